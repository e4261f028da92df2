//! Content-type lookup by file extension, loaded from the usual
//! `mime.types` locations. Loading is lazy on first use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

const MAP_FILES: [&str; 4] = [
    "/etc/httpd/mime.types",
    "/etc/apache2/mime.types",
    "/etc/mime.types",
    "~/.mime.types",
];

#[derive(Debug, Default)]
pub struct MimeTypes {
    map: HashMap<String, String>,
}

impl MimeTypes {
    /// Load from the standard system locations; missing files are skipped.
    pub fn load_system() -> Self {
        let mut types = Self::default();
        for entry in MAP_FILES {
            if let Some(path) = expand_home(entry) {
                if let Ok(contents) = std::fs::read_to_string(path) {
                    types.parse(&contents);
                }
            }
        }
        types
    }

    /// Parse `mime.types` content: `type ext ext ...` per line, `#` comments.
    pub fn parse(&mut self, contents: &str) {
        for raw in contents.lines() {
            let line = match raw.find('#') {
                Some(0) => continue,
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let mut fields = line.split_whitespace();
            let Some(content_type) = fields.next() else {
                continue;
            };
            for ext in fields {
                self.map
                    .insert(ext.to_ascii_lowercase(), content_type.to_string());
            }
        }
    }

    pub fn by_extension(&self, ext: &str) -> Option<&str> {
        self.map.get(&ext.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn for_path(&self, path: &str) -> Option<&str> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = name.rsplit_once('.')?;
        self.by_extension(ext)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn expand_home(path: &str) -> Option<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var_os("HOME")?;
        Some(PathBuf::from(home).join(rest))
    } else {
        Some(PathBuf::from(path))
    }
}

static TYPES: OnceLock<MimeTypes> = OnceLock::new();

/// Guess a content type for a path from the system mime maps.
pub fn guess(path: &str) -> Option<String> {
    TYPES
        .get_or_init(MimeTypes::load_system)
        .for_path(path)
        .map(str::to_string)
}
