//! Key transforms: per-bucket normalization of object keys before hashing
//!
//! A rule maps an object key to its routing-equivalence class. Directory
//! rules send every object of one logical directory to the same vnode, which
//! shard-local listings depend on.

use crate::common::{Config, TransformRule};
use std::collections::HashMap;

/// A pure key rule
pub type KeyRule = fn(&str) -> String;

/// Registry of key rules by bucket name; unknown buckets use the identity.
#[derive(Clone)]
pub struct KeyTransform {
    rules: HashMap<String, KeyRule>,
}

impl KeyTransform {
    /// Identity for every bucket
    pub fn identity() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut transform = Self::identity();
        for (bucket, rule) in &config.key_transforms {
            transform.register(bucket, rule_fn(*rule));
        }
        transform
    }

    pub fn register(&mut self, bucket: &str, rule: KeyRule) -> &mut Self {
        self.rules.insert(bucket.to_string(), rule);
        self
    }

    pub fn has_rule(&self, bucket: &str) -> bool {
        self.rules.contains_key(bucket)
    }

    pub fn transform(&self, bucket: &str, key: &str) -> String {
        match self.rules.get(bucket) {
            Some(rule) => rule(key),
            None => key.to_string(),
        }
    }
}

impl Default for KeyTransform {
    fn default() -> Self {
        let mut transform = Self::identity();
        transform
            .register("manta", directory_rule)
            .register("testmanta", directory_rule);
        transform
    }
}

impl std::fmt::Debug for KeyTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buckets: Vec<&String> = self.rules.keys().collect();
        buckets.sort();
        f.debug_struct("KeyTransform").field("buckets", &buckets).finish()
    }
}

pub fn rule_fn(rule: TransformRule) -> KeyRule {
    match rule {
        TransformRule::Directory => directory_rule,
        TransformRule::UuidDirectory => uuid_directory_rule,
    }
}

/// The parent directory of `key`; the key itself when it has none, or when
/// it is an account root (`/<uuid>/stor`).
pub fn directory_rule(key: &str) -> String {
    if is_account_root(key) {
        return key.to_string();
    }
    match dirname(key) {
        "." => key.to_string(),
        dir => dir.to_string(),
    }
}

/// Keys of the form `<uuid>:<path>`: apply [`directory_rule`] to the path only.
pub fn uuid_directory_rule(key: &str) -> String {
    match key.split_once(':') {
        Some((id, path)) if is_lower_uuid(id) => format!("{}:{}", id, directory_rule(path)),
        _ => directory_rule(key),
    }
}

/// POSIX dirname: trailing separators are ignored, "." when there is no directory.
fn dirname(path: &str) -> &str {
    if path.is_empty() {
        return ".";
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        None => ".",
        Some(idx) => {
            let parent = trimmed[..idx].trim_end_matches('/');
            if parent.is_empty() {
                "/"
            } else {
                parent
            }
        }
    }
}

fn is_account_root(key: &str) -> bool {
    key.strip_prefix('/')
        .and_then(|rest| rest.strip_suffix("/stor"))
        .is_some_and(is_lower_uuid)
}

/// Hyphenated, lowercase UUID
fn is_lower_uuid(s: &str) -> bool {
    s.len() == 36
        && !s.bytes().any(|b| b.is_ascii_uppercase())
        && s.bytes()
            .enumerate()
            .all(|(i, b)| matches!(i, 8 | 13 | 18 | 23) == (b == b'-'))
        && uuid::Uuid::parse_str(s).is_ok()
}
