//! Three-way conflict detection and resolution.
//!
//! A client keeps the hash the server last confirmed (its baseline). Comparing
//! the baseline against the client's local hash and the server's current hash
//! tells whether either side moved. Only when both moved is there a real
//! conflict, and that one is never settled without the user choosing a
//! strategy.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::fingerprint::{fingerprint, ContentHash};

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<li(?:\s[^>]*)?>(.*?)</li\s*>").expect("list item pattern is valid"));

static LIST_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(?:ul|ol)\s*>").expect("list close pattern is valid"));

static TEXT_BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+•]|\d+[.)]|\[[ xX]\])\s+(.*)$").expect("bullet pattern is valid")
});

static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("tag pattern is valid"));

const TEXT_SEPARATOR: &str = "\n\n--- Offline changes ---\n\n";
const MARKUP_SEPARATOR: &str = "<hr><p><em>Offline changes</em></p>";

/// What a returning client should do with one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDecision {
    /// Nothing moved, or both sides converged on the same content.
    InSync,
    /// Only the client changed: push local content.
    PushLocal,
    /// Only the server changed: adopt server content.
    AcceptRemote,
    /// Both changed independently: ask the user.
    Conflict,
}

/// Classify a document from its three hashes.
pub fn classify(baseline: &ContentHash, local: &ContentHash, server: &ContentHash) -> SyncDecision {
    match (baseline == server, baseline == local) {
        (true, true) => SyncDecision::InSync,
        (true, false) => SyncDecision::PushLocal,
        (false, true) => SyncDecision::AcceptRemote,
        (false, false) if local == server => SyncDecision::InSync,
        (false, false) => SyncDecision::Conflict,
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub title: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

impl Version {
    pub fn new(title: impl Into<String>, content: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            updated_at,
        }
    }

    pub fn hash(&self) -> ContentHash {
        fingerprint(&self.title, &self.content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    AcceptRemote,
    KeepLocal,
    /// Union of list items, remote order first.
    MergeLists,
    /// The version with the later timestamp wins.
    MergeByTime,
    /// Remote, a visible separator, then local.
    Append,
}

/// Everything a client needs to show a side-by-side resolution dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub document_id: String,
    pub baseline_hash: Option<ContentHash>,
    pub local_hash: ContentHash,
    pub server_hash: ContentHash,
    pub local: Version,
    pub remote: Version,
    pub suggested: ResolutionStrategy,
}

impl ConflictReport {
    pub fn new(document_id: &str, baseline_hash: Option<ContentHash>, local: Version, remote: Version) -> Self {
        Self {
            document_id: document_id.to_string(),
            baseline_hash,
            local_hash: local.hash(),
            server_hash: remote.hash(),
            suggested: suggest_strategy(&local, &remote),
            local,
            remote,
        }
    }
}

/// Pick the least lossy merge for the content at hand.
pub fn suggest_strategy(local: &Version, remote: &Version) -> ResolutionStrategy {
    if is_list_like(&local.content) && is_list_like(&remote.content) {
        ResolutionStrategy::MergeLists
    } else {
        ResolutionStrategy::Append
    }
}

/// Produce the resolved version for a chosen strategy.
pub fn resolve(strategy: ResolutionStrategy, local: &Version, remote: &Version) -> Version {
    match strategy {
        ResolutionStrategy::AcceptRemote => remote.clone(),
        ResolutionStrategy::KeepLocal => local.clone(),
        ResolutionStrategy::MergeByTime => {
            if local.updated_at > remote.updated_at {
                local.clone()
            } else {
                remote.clone()
            }
        }
        ResolutionStrategy::MergeLists => {
            merge_lists(local, remote).unwrap_or_else(|| append(local, remote))
        }
        ResolutionStrategy::Append => append(local, remote),
    }
}

fn merged_meta(local: &Version, remote: &Version, content: String) -> Version {
    let title = if remote.title.trim().is_empty() {
        local.title.clone()
    } else {
        remote.title.clone()
    };
    Version {
        title,
        content,
        updated_at: local.updated_at.max(remote.updated_at),
    }
}

fn is_markup(content: &str) -> bool {
    ANY_TAG.is_match(content)
}

fn is_list_like(content: &str) -> bool {
    if is_markup(content) {
        return LIST_ITEM.is_match(content);
    }
    let mut lines = content.lines().filter(|l| !l.trim().is_empty()).peekable();
    lines.peek().is_some() && lines.all(|l| TEXT_BULLET.is_match(l))
}

/// Comparable form of a list item: visible text, lowercased, spaces collapsed.
fn item_key(item: &str) -> String {
    let text = ANY_TAG.replace_all(item, " ").replace("&nbsp;", " ");
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn merge_lists(local: &Version, remote: &Version) -> Option<Version> {
    if !(is_list_like(&local.content) && is_list_like(&remote.content)) {
        return None;
    }
    if is_markup(&remote.content) != is_markup(&local.content) {
        return None;
    }

    let content = if is_markup(&remote.content) {
        let seen: HashSet<String> = LIST_ITEM
            .captures_iter(&remote.content)
            .map(|c| item_key(&c[1]))
            .collect();
        let additions = local_only(
            LIST_ITEM.captures_iter(&local.content).map(|c| c.get(1).map_or("", |m| m.as_str())),
            seen,
        );
        if additions.is_empty() {
            remote.content.clone()
        } else {
            let close = LIST_CLOSE.find_iter(&remote.content).last()?;
            let inserted: String = additions.iter().map(|item| format!("<li>{}</li>", item)).collect();
            let mut merged = remote.content.clone();
            merged.insert_str(close.start(), &inserted);
            merged
        }
    } else {
        let items = |content: &str| -> Vec<(String, String)> {
            content
                .lines()
                .filter_map(|line| {
                    TEXT_BULLET
                        .captures(line)
                        .map(|c| (line.trim_end().to_string(), item_key(&c[1])))
                })
                .collect()
        };
        let mut seen: HashSet<String> =
            items(&remote.content).into_iter().map(|(_, key)| key).collect();
        let mut merged = remote.content.trim_end().to_string();
        for (line, key) in items(&local.content) {
            if seen.insert(key) {
                merged.push('\n');
                merged.push_str(&line);
            }
        }
        merged
    };

    Some(merged_meta(local, remote, content))
}

fn local_only<'a>(items: impl Iterator<Item = &'a str>, mut seen: HashSet<String>) -> Vec<&'a str> {
    items.filter(|item| seen.insert(item_key(item))).collect()
}

fn append(local: &Version, remote: &Version) -> Version {
    let separator = if is_markup(&remote.content) || is_markup(&local.content) {
        MARKUP_SEPARATOR
    } else {
        TEXT_SEPARATOR
    };
    let content = format!("{}{}{}", remote.content, separator, local.content);
    merged_meta(local, remote, content)
}
