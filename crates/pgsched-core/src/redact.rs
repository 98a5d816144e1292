//! Scrubbing of error text before it is logged or stored
//!
//! Driver errors can echo connection strings or `password=...` fragments.
//! Every message that ends up in a run record goes through [`Redactor::clean`].

use regex::Regex;
use std::sync::LazyLock;

/// Keys masked when no explicit list is configured
pub const DEFAULT_REDACT_KEYS: &[&str] = &[
    "password",
    "new_password",
    "current_password",
    "token",
    "authorization",
    "secret",
];

/// Default cap on stored error text, in bytes
pub const DEFAULT_MAX_ERROR_BYTES: usize = 4096;

const MASK: &str = "[REDACTED]";

static URL_USERINFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(postgres(?:ql)?://[^:/@\s]+):[^@\s]*@")
        .expect("URL_USERINFO is a compile-time constant")
});

/// Masks sensitive `key=value` / `key: value` pairs and bounds message length.
#[derive(Debug, Clone)]
pub struct Redactor {
    pairs: Option<Regex>,
    max_bytes: usize,
}

impl Default for Redactor {
    fn default() -> Self {
        let keys: Vec<String> = DEFAULT_REDACT_KEYS.iter().map(|k| k.to_string()).collect();
        Self::new(&keys, DEFAULT_MAX_ERROR_BYTES)
    }
}

impl Redactor {
    /// Build a redactor for the given keys (case-insensitive).
    pub fn new(keys: &[String], max_bytes: usize) -> Self {
        let alternatives: Vec<String> = keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        // Keys are escaped, so the only failure mode left is a size limit.
        let pairs = if alternatives.is_empty() {
            None
        } else {
            Regex::new(&format!(
                r#"(?i)\b({})(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
                alternatives.join("|")
            ))
            .ok()
        };

        Self {
            pairs,
            max_bytes: max_bytes.max(16),
        }
    }

    /// Configured byte cap
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Mask secrets, then truncate on a char boundary.
    pub fn clean(&self, message: &str) -> String {
        let masked = URL_USERINFO.replace_all(message, format!("$1:{MASK}@"));
        let masked = match &self.pairs {
            Some(re) => re.replace_all(&masked, format!("$1$2{MASK}")).into_owned(),
            None => masked.into_owned(),
        };
        truncate_bytes(masked, self.max_bytes)
    }
}

fn truncate_bytes(mut text: String, max_bytes: usize) -> String {
    const ELLIPSIS: &str = "…";
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes.saturating_sub(ELLIPSIS.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(ELLIPSIS);
    text
}
