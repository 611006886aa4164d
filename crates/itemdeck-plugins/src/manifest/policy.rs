//! Content policy for manifest references and contribution payloads

use regex::Regex;
use serde_json::Value;

/// What a manifest path points at, deciding the allowed extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Image,
    Stylesheet,
    Script,
    Json,
}

impl PathKind {
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Image => &["png", "jpg", "jpeg", "gif", "webp", "svg", "avif"],
            Self::Stylesheet => &["css"],
            Self::Script => &["js", "mjs"],
            Self::Json => &["json"],
        }
    }
}

/// Check a plugin-relative path, returning the reason it is rejected
pub fn check_path(path: &str, kind: PathKind) -> Option<String> {
    if path.trim().is_empty() {
        return Some("path must not be empty".to_string());
    }
    if path.contains("://") || path.starts_with("data:") || path.starts_with("//") {
        return Some("must be a relative path inside the plugin".to_string());
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Some("absolute paths are not allowed".to_string());
    }
    if path
        .split(['/', '\\'])
        .any(|segment| segment == "..")
    {
        return Some("path must not leave the plugin directory".to_string());
    }

    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.contains('/'));
    match extension {
        Some(ext) if kind.extensions().contains(&ext.as_str()) => None,
        _ => Some(format!(
            "unsupported file type (expected one of: {})",
            kind.extensions().join(", ")
        )),
    }
}

/// Detects executable markup smuggled into contribution strings
#[derive(Debug, Clone)]
pub struct InlineScriptScanner {
    pattern: Regex,
}

impl InlineScriptScanner {
    pub fn new() -> Result<Self, regex::Error> {
        let pattern = Regex::new(
            r"(?i)<\s*script\b|javascript\s*:|vbscript\s*:|data\s*:\s*text/html|<[^>]*\son[a-z]+\s*=",
        )?;
        Ok(Self { pattern })
    }

    pub fn is_executable(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Paths of every string inside `value` carrying executable content
    pub fn scan(&self, value: &Value, path: &str) -> Vec<String> {
        let mut hits = Vec::new();
        self.scan_into(value, path, &mut hits);
        hits
    }

    fn scan_into(&self, value: &Value, path: &str, hits: &mut Vec<String>) {
        match value {
            Value::String(text) if self.is_executable(text) => hits.push(path.to_string()),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.scan_into(item, &format!("{}[{}]", path, i), hits);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.scan_into(item, &format!("{}.{}", path, key), hits);
                }
            }
            _ => {}
        }
    }
}
