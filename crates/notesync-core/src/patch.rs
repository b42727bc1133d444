//! Incremental edits.
//!
//! Positions and lengths count Unicode scalar values, not bytes, so a client
//! can compute them without knowing the server's string encoding.

use serde::{Deserialize, Serialize};

/// A single insert or delete relative to the current content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Patch {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

/// A patch that was not applied because it fell outside the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPatch {
    /// Index of the patch in the submitted list.
    pub index: usize,
    pub patch: Patch,
    /// Content length (in chars) the patch was checked against.
    pub content_len: usize,
}

/// Result of applying a patch list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub content: String,
    pub applied: usize,
    pub skipped: Vec<SkippedPatch>,
}

/// Byte offset of the `position`-th char, allowing the end of the string.
fn byte_offset(content: &str, position: usize) -> Option<usize> {
    content
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(content.len()))
        .nth(position)
}

/// Apply `patches` in order to `content`.
///
/// Each patch is checked against the content as it stands after the previous
/// patches. Out-of-range patches are skipped and reported; the rest still
/// apply. The caller owns the result: feeding it the same list again applies
/// the edits a second time.
pub fn apply_patches(content: &str, patches: &[Patch]) -> PatchOutcome {
    let mut current = content.to_string();
    let mut applied = 0;
    let mut skipped = Vec::new();

    for (index, patch) in patches.iter().enumerate() {
        let content_len = current.chars().count();
        let done = match patch {
            Patch::Insert { position, text } => match byte_offset(&current, *position) {
                Some(at) => {
                    current.insert_str(at, text);
                    true
                }
                None => false,
            },
            Patch::Delete { position, length } => {
                let end = position.checked_add(*length);
                match (byte_offset(&current, *position), end.and_then(|e| byte_offset(&current, e))) {
                    (Some(start), Some(end)) => {
                        current.replace_range(start..end, "");
                        true
                    }
                    _ => false,
                }
            }
        };

        if done {
            applied += 1;
        } else {
            skipped.push(SkippedPatch {
                index,
                patch: patch.clone(),
                content_len,
            });
        }
    }

    PatchOutcome {
        content: current,
        applied,
        skipped,
    }
}

/// HTML elements that never take a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Structural check for rich-text markup.
///
/// Fails on a tag cut off before its `>`, on a closing tag that does not match
/// the innermost open element, and on elements left open at the end. A `<`
/// that does not start a tag (`a < b`) is plain text.
pub fn is_well_formed(content: &str) -> bool {
    let mut open: Vec<String> = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find('<') {
        let after = &rest[start + 1..];
        let first = after.chars().next();

        if after.starts_with("!--") {
            match after.find("-->") {
                Some(end) => {
                    rest = &after[end + 3..];
                    continue;
                }
                None => return false,
            }
        }

        let starts_tag = matches!(first, Some(c) if c.is_ascii_alphabetic() || c == '/' || c == '!');
        if !starts_tag {
            rest = after;
            continue;
        }

        let Some(end) = after.find('>') else {
            return false;
        };
        let body = &after[..end];
        if body.contains('<') {
            return false;
        }
        rest = &after[end + 1..];

        if body.starts_with('!') {
            continue;
        }

        if let Some(closing) = body.strip_prefix('/') {
            let name = closing.trim().to_ascii_lowercase();
            match open.pop() {
                Some(top) if top == name => {}
                _ => return false,
            }
            continue;
        }

        let name: String = body
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let self_closing = body.trim_end().ends_with('/');
        if !self_closing && !VOID_ELEMENTS.contains(&name.as_str()) {
            open.push(name);
        }
    }

    open.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(position: usize, text: &str) -> Patch {
        Patch::Insert {
            position,
            text: text.to_string(),
        }
    }

    fn delete(position: usize, length: usize) -> Patch {
        Patch::Delete { position, length }
    }

    #[test]
    fn test_empty_patch_list_is_noop() {
        let outcome = apply_patches("Hello", &[]);
        assert_eq!(outcome.content, "Hello");
        assert_eq!(outcome.applied, 0);
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn test_insert_and_delete() {
        let outcome = apply_patches("Hello", &[insert(5, " world"), delete(0, 1), insert(0, "J")]);
        assert_eq!(outcome.content, "Jello world");
        assert_eq!(outcome.applied, 3);
    }

    #[test]
    fn test_reapplying_patches_is_not_idempotent() {
        let patches = vec![insert(5, " world")];
        let once = apply_patches("Hello", &patches).content;
        let twice = apply_patches(&once, &patches).content;
        assert_eq!(once, "Hello world");
        assert_eq!(twice, "Hello world world");
        assert_ne!(once, twice);
    }

    #[test]
    fn test_out_of_range_patch_is_skipped_not_fatal() {
        let outcome = apply_patches("abc", &[insert(10, "x"), delete(2, 5), insert(3, "d")]);
        assert_eq!(outcome.content, "abcd");
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped.len(), 2);
        assert_eq!(outcome.skipped[0].index, 0);
        assert_eq!(outcome.skipped[1].index, 1);
        assert_eq!(outcome.skipped[1].content_len, 3);
    }

    #[test]
    fn test_positions_count_chars_not_bytes() {
        let outcome = apply_patches("héllo", &[delete(1, 1), insert(1, "e")]);
        assert_eq!(outcome.content, "hello");
        let outcome = apply_patches("日本", &[insert(2, "語")]);
        assert_eq!(outcome.content, "日本語");
    }

    #[test]
    fn test_delete_length_overflow_is_skipped() {
        let outcome = apply_patches("abc", &[delete(1, usize::MAX)]);
        assert_eq!(outcome.content, "abc");
        assert_eq!(outcome.skipped.len(), 1);
    }

    #[test]
    fn test_well_formed_markup() {
        assert!(is_well_formed("plain text"));
        assert!(is_well_formed("a < b and c > d"));
        assert!(is_well_formed("<p>Hello <b>world</b><br></p>"));
        assert!(is_well_formed("<ul><li>one</li><li>two</li></ul><img src=\"x\"/>"));
        assert!(is_well_formed("<!-- note --><P>Case</p>"));
    }

    #[test]
    fn test_truncated_or_unbalanced_markup() {
        assert!(!is_well_formed("<p>Hello</p"));
        assert!(!is_well_formed("<p>Hello"));
        assert!(!is_well_formed("<p><b>Hello</p></b>"));
        assert!(!is_well_formed("<p <b>x</b></p>"));
        assert!(!is_well_formed("</p>"));
    }
}
