//! Content fingerprints.
//!
//! A fingerprint is a SHA-256 digest over the trimmed title and the
//! *normalized* content, hex encoded and truncated to [`HASH_PREFIX_LEN`]
//! characters (64 bits). Normalization removes differences an editor produces
//! without the user changing anything (line endings, whitespace between tags,
//! empty paragraphs), so a formatting-only echo from the server never looks
//! like a change.
//!
//! Collisions: with a 64-bit prefix the birthday bound sits around 2^32
//! distinct versions of a single document before a collision becomes likely.
//! Hashes are only ever compared within one document's history, so this is an
//! accepted risk.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
pub const HASH_PREFIX_LEN: usize = 16;

/// Block-level elements stripped when they hold nothing visible.
const STRUCTURAL_BLOCKS: &[&str] = &[
    "p",
    "div",
    "li",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "blockquote",
    "pre",
    "span",
];

static INTER_TAG_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s+<").expect("inter-tag pattern is valid"));

static EMPTY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = STRUCTURAL_BLOCKS
        .iter()
        .map(|tag| format!(r"<{tag}(?:\s[^>]*)?>(?:\s|&nbsp;|<br\s*/?>)*</{tag}\s*>"))
        .collect();
    Regex::new(&format!("(?i){}", alternatives.join("|"))).expect("empty-block pattern is valid")
});

/// A truncated, hex-encoded content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an existing digest string (e.g. one received over the wire).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentHash {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Normalize content so cosmetic differences hash identically.
///
/// Runs to a fixpoint: stripping an empty block can leave its parent empty or
/// expose new inter-tag whitespace, so the passes repeat until nothing
/// changes. Every pass that changes the text makes it strictly shorter, which
/// bounds the loop.
pub fn normalize(content: &str) -> String {
    let mut current = content.replace("\r\n", "\n").replace('\r', "\n");
    loop {
        let collapsed = INTER_TAG_WHITESPACE.replace_all(&current, "><");
        let stripped = EMPTY_BLOCK.replace_all(&collapsed, "");
        let next = stripped
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Fingerprint a document version.
pub fn fingerprint(title: &str, content: &str) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(content).as_bytes());
    let digest = hex::encode(hasher.finalize());
    ContentHash(digest[..HASH_PREFIX_LEN].to_string())
}
