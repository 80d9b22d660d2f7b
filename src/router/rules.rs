// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Size and type based write-target rules.

use serde::{Deserialize, Serialize};

use crate::storage::traits::BackendKind;

/// Route payloads smaller than `max_size` bytes (optionally of one data
/// type) to `backend`. Higher `priority` rules are consulted first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRule {
    pub name: String,
    pub max_size: u64,
    #[serde(default)]
    pub data_type: Option<String>,
    pub backend: BackendKind,
    #[serde(default)]
    pub priority: u32,
}

impl StorageRule {
    #[must_use]
    pub fn matches(&self, size: u64, data_type: Option<&str>) -> bool {
        if size >= self.max_size {
            return false;
        }
        match (&self.data_type, data_type) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
        }
    }
}

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Small payloads stay close, large ones go far.
#[must_use]
pub fn default_rules() -> Vec<StorageRule> {
    let rule = |name: &str, max_size: u64, backend: BackendKind, priority: u32| StorageRule {
        name: name.to_string(),
        max_size,
        data_type: None,
        backend,
        priority,
    };
    vec![
        rule("tiny", KB, BackendKind::Ephemeral, 40),
        rule("small", 100 * KB, BackendKind::FastLocal, 30),
        rule("medium", 10 * MB, BackendKind::BulkLocal, 20),
        rule("large", u64::MAX, BackendKind::RemoteObject, 10),
    ]
}

/// Ordered write candidates for one payload.
///
/// The first matching rule whose backend is usable, then the primary, then
/// each fallback, keeping only usable tiers. The ephemeral tier always
/// closes the list. `preferred`, when usable, goes first.
#[must_use]
pub fn write_candidates(
    rules: &[StorageRule],
    size: u64,
    data_type: Option<&str>,
    preferred: Option<BackendKind>,
    primary: BackendKind,
    fallbacks: &[BackendKind],
    usable: impl Fn(BackendKind) -> bool,
) -> Vec<BackendKind> {
    let mut ordered: Vec<&StorageRule> = rules.iter().collect();
    // Stable: equal priorities keep their configured order
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let ruled = ordered
        .into_iter()
        .filter(|rule| rule.matches(size, data_type))
        .map(|rule| rule.backend)
        .find(|kind| usable(*kind));

    let mut out = Vec::with_capacity(fallbacks.len() + 3);
    let tail = std::iter::once(primary).chain(fallbacks.iter().copied());
    for kind in preferred.into_iter().chain(ruled).chain(tail) {
        if kind != BackendKind::Ephemeral && usable(kind) && !out.contains(&kind) {
            out.push(kind);
        }
    }
    // A tiny payload routed to ephemeral by rule still goes first
    if ruled == Some(BackendKind::Ephemeral) && matches!(preferred, None | Some(BackendKind::Ephemeral)) {
        out.insert(0, BackendKind::Ephemeral);
    } else {
        out.push(BackendKind::Ephemeral);
    }
    out
}
