fn main() {
    let args = std::env::args();
    if let Err(err) = objfs::run(args) {
        eprintln!("objfs error: {err}");
        std::process::exit(1);
    }
}
