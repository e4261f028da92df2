//! Store-dialect hooks. Each service supplies URL shaping, request signing,
//! retry policy, and the listing wire format through the hook seam.

pub mod s3;

pub use s3::S3Hook;
