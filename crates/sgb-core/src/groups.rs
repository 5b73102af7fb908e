//! Group-identity normalization.
//!
//! The messaging network emits the same group id in three encodings: standard
//! base64, URL-safe base64 (usually with padding stripped), and the URL-safe
//! form carrying a fixed `group.` prefix. Everything downstream keys on one
//! canonical form; this module collapses the variants and remembers the
//! mapping in both directions.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::domain::GroupId;

/// Fixed textual prefix carried by the third observed encoding.
pub const GROUP_ID_PREFIX: &str = "group.";

#[derive(Default)]
struct IdMaps {
    /// observed variant -> canonical id
    canonical: HashMap<String, GroupId>,
    /// canonical id -> all observed variants (the canonical form included)
    variants: HashMap<GroupId, Vec<String>>,
}

/// Bidirectional variant/canonical cache. Read-mostly; writers replace whole
/// entries rather than mutating in place.
#[derive(Default)]
pub struct GroupIdNormalizer {
    maps: RwLock<IdMaps>,
}

impl GroupIdNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse any of the three observed encodings to the canonical id.
    ///
    /// Returns `None` (and logs) for malformed input; never panics or errors.
    /// Repeated lookups for a seen variant are a single map read.
    pub fn normalize(&self, raw: &str) -> Option<GroupId> {
        {
            let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
            if let Some(canonical) = maps.canonical.get(raw) {
                return Some(canonical.clone());
            }
        }

        let Some(canonical) = canonicalize(raw) else {
            eprintln!(
                "[GROUPS] unrecognized group id: {}",
                truncate_for_log(raw)
            );
            return None;
        };
        let canonical = GroupId(canonical);

        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        maps.canonical.insert(raw.to_string(), canonical.clone());
        maps.canonical
            .insert(canonical.0.clone(), canonical.clone());

        // Replace the variant list wholesale.
        let mut known = maps.variants.get(&canonical).cloned().unwrap_or_default();
        if !known.iter().any(|v| v == &canonical.0) {
            known.push(canonical.0.clone());
        }
        if !known.iter().any(|v| v == raw) {
            known.push(raw.to_string());
        }
        maps.variants.insert(canonical.clone(), known);

        Some(canonical)
    }

    /// All variants observed so far for a canonical id, canonical form first.
    pub fn all_formats(&self, id: &GroupId) -> Vec<String> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.variants.get(id).cloned().unwrap_or_default()
    }

    /// The `group.`-prefixed URL-safe form the daemon expects in RPC params.
    pub fn prefixed_format(&self, id: &GroupId) -> String {
        format!("{GROUP_ID_PREFIX}{}", to_url_safe(&id.0))
    }
}

/// Pure canonicalization: strip the prefix, reverse URL-safe substitution,
/// restore padding, and verify the result actually decodes.
fn canonicalize(raw: &str) -> Option<String> {
    let stripped = raw.strip_prefix(GROUP_ID_PREFIX).unwrap_or(raw);
    if stripped.is_empty() {
        return None;
    }

    let substituted: String = stripped
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let unpadded = substituted.trim_end_matches('=');
    if unpadded.is_empty()
        || unpadded
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '+' || c == '/'))
    {
        return None;
    }

    let padded = match unpadded.len() % 4 {
        0 => unpadded.to_string(),
        1 => return None, // no base64 payload has this length
        n => format!("{unpadded}{}", "=".repeat(4 - n)),
    };

    STANDARD.decode(&padded).ok()?;
    Some(padded)
}

fn to_url_safe(canonical: &str) -> String {
    canonical
        .chars()
        .filter(|c| *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect()
}

fn truncate_for_log(s: &str) -> String {
    if s.len() <= 48 {
        return s.to_string();
    }
    let mut out = s.chars().take(48).collect::<String>();
    out.push_str("...");
    out
}
