//! # Chain Resolver
//!
//! Pure functions over the chain entries of one volume. Nothing here touches the store;
//! callers load the entries, ask the resolver, then act through the store's atomic
//! operations.
//!
//! - [`ChainIndex::resolve_path`] returns the ordered full → target sequence needed to
//!   materialize an entry, refusing to cross any link that is not `valid`.
//! - [`compute_deletable`] returns the current deletion frontier under a retention rule:
//!   expired entries that no non-deleted child still references. Deleting the frontier
//!   may expose parents; they show up on the next call, which keeps deletion leaf-first.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::errors::{VaultError, VaultResult};
use crate::model::{ChainEntry, ChecksumMap, EntryId, EntryKind, EntryStatus, RetentionPolicy};

/// Facts about an entry's position in its volume, handed to expiry rules.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryContext {
    pub now: DateTime<Utc>,
    /// 0 for the newest valid entry of the volume, 1 for the one before, ...
    pub valid_rank: usize,
}

/// Pluggable retention predicate. Returning `true` means the entry is no longer wanted.
pub trait ExpiryRule {
    fn is_expired(&self, entry: &ChainEntry, ctx: &ExpiryContext) -> bool;
}

impl ExpiryRule for RetentionPolicy {
    fn is_expired(&self, entry: &ChainEntry, ctx: &ExpiryContext) -> bool {
        if self.is_unbounded() {
            return false;
        }
        let by_count = self.keep_last.map(|n| ctx.valid_rank >= n as usize);
        let by_age = self.max_age().map(|age| ctx.now - entry.created_at > age);
        by_count.unwrap_or(true) && by_age.unwrap_or(true)
    }
}

/// Order entries parent-before-child; siblings and unrelated roots by ascending id.
pub fn causal_order(entries: Vec<ChainEntry>) -> Vec<ChainEntry> {
    let mut by_id: HashMap<EntryId, ChainEntry> =
        entries.into_iter().map(|e| (e.id, e)).collect();
    let mut ids: Vec<EntryId> = by_id.keys().copied().collect();
    ids.sort();

    let mut emitted: HashSet<EntryId> = HashSet::with_capacity(ids.len());
    let mut order: Vec<EntryId> = Vec::with_capacity(ids.len());
    for id in ids {
        // Walk up to the first ancestor not yet emitted, then emit downwards.
        let mut pending = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if emitted.contains(&current) || pending.contains(&current) {
                break;
            }
            let Some(entry) = by_id.get(&current) else {
                break;
            };
            pending.push(current);
            cursor = entry.parent();
        }
        for current in pending.into_iter().rev() {
            emitted.insert(current);
            order.push(current);
        }
    }
    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

/// Most recently created `valid` entry.
pub fn latest_valid(entries: &[ChainEntry]) -> Option<&ChainEntry> {
    entries.iter().filter(|e| e.is_valid()).max_by_key(|e| e.id)
}

/// Unit → hash state after replaying `path` (as returned by [`ChainIndex::resolve_path`]).
pub fn materialize(path: &[ChainEntry]) -> ChecksumMap {
    let mut state = ChecksumMap::new();
    for entry in path {
        if let EntryKind::Incremental { removed, .. } = &entry.kind {
            for unit in removed {
                state.remove(unit);
            }
        } else {
            state.clear();
        }
        state.extend(entry.checksums.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    state
}

/// In-memory arena of one volume's entries keyed by id.
#[derive(Debug, Default, Clone)]
pub struct ChainIndex {
    entries: HashMap<EntryId, ChainEntry>,
}

impl ChainIndex {
    pub fn new(entries: impl IntoIterator<Item = ChainEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&ChainEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full ancestor → `target` inclusive. Every link must be present and `valid`.
    pub fn resolve_path(&self, target: EntryId) -> VaultResult<Vec<ChainEntry>> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(target);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(VaultError::BrokenChain {
                    entry: id,
                    reason: "cycle in parent links".into(),
                });
            }
            let entry = self.entries.get(&id).ok_or_else(|| VaultError::BrokenChain {
                entry: id,
                reason: "entry missing".into(),
            })?;
            if entry.status != EntryStatus::Valid {
                return Err(VaultError::BrokenChain {
                    entry: id,
                    reason: format!("entry is {}", entry.status),
                });
            }
            path.push(entry.clone());
            cursor = entry.parent();
        }
        path.reverse();
        Ok(path)
    }

    /// Number of incrementals between the nearest full and `id` (0 for a full).
    pub fn depth(&self, id: EntryId) -> usize {
        let mut depth = 0;
        let mut cursor = self.entries.get(&id).and_then(|e| e.parent());
        while let Some(parent) = cursor {
            depth += 1;
            if depth > self.entries.len() {
                break;
            }
            cursor = self.entries.get(&parent).and_then(|e| e.parent());
        }
        depth
    }

    /// Ids that have at least one non-deleted child.
    fn referenced_parents(&self) -> HashSet<EntryId> {
        self.entries
            .values()
            .filter(|e| e.status != EntryStatus::Deleted)
            .filter_map(|e| e.parent())
            .collect()
    }

    /// Rank of every valid entry, newest first.
    fn valid_ranks(&self) -> HashMap<EntryId, usize> {
        let mut valid: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.is_valid())
            .map(|e| e.id)
            .collect();
        valid.sort_by(|a, b| b.cmp(a));
        valid.into_iter().enumerate().map(|(i, id)| (id, i)).collect()
    }

    /// Whether `entry` is expired under both its own policy snapshot and `current`.
    pub fn is_expired(
        &self,
        entry: &ChainEntry,
        current: &dyn ExpiryRule,
        now: DateTime<Utc>,
    ) -> bool {
        match entry.status {
            EntryStatus::Corrupt => true,
            EntryStatus::Pending | EntryStatus::Deleted => false,
            EntryStatus::Valid => {
                let ranks = self.valid_ranks();
                let ctx = ExpiryContext {
                    now,
                    valid_rank: ranks.get(&entry.id).copied().unwrap_or(0),
                };
                self.expired_with(entry, current, &ctx)
            }
        }
    }

    fn expired_with(&self, entry: &ChainEntry, current: &dyn ExpiryRule, ctx: &ExpiryContext) -> bool {
        ctx.valid_rank > 0
            && entry.retention.is_expired(entry, ctx)
            && current.is_expired(entry, ctx)
    }
}

/// Current deletion frontier of a volume: expired entries with no non-deleted child.
///
/// `current` is the governing job's present policy; each entry's own policy snapshot must
/// agree. The newest valid entry is never returned, pending entries are never returned,
/// corrupt entries are returned as soon as nothing references them.
pub fn compute_deletable(
    entries: &[ChainEntry],
    current: &dyn ExpiryRule,
    now: DateTime<Utc>,
) -> BTreeSet<EntryId> {
    let index = ChainIndex::new(entries.iter().cloned());
    let referenced = index.referenced_parents();
    let ranks = index.valid_ranks();

    index
        .entries
        .values()
        .filter(|e| !referenced.contains(&e.id))
        .filter(|e| match e.status {
            EntryStatus::Corrupt => true,
            EntryStatus::Valid => {
                let ctx = ExpiryContext {
                    now,
                    valid_rank: ranks.get(&e.id).copied().unwrap_or(0),
                };
                index.expired_with(e, current, &ctx)
            }
            EntryStatus::Pending | EntryStatus::Deleted => false,
        })
        .map(|e| e.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnvironmentId, TransferHandle, VolumeRef, ENTRY_SCHEMA_VERSION};
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn at(hours_ago: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            - Duration::hours(hours_ago)
    }

    fn mk(id: u64, parent: Option<u64>, status: EntryStatus, policy: RetentionPolicy) -> ChainEntry {
        ChainEntry {
            id: EntryId(id),
            volume: VolumeRef::new(EnvironmentId(1), "vol"),
            kind: match parent {
                None => EntryKind::Full,
                Some(p) => EntryKind::Incremental {
                    parent: EntryId(p),
                    removed: vec![],
                },
            },
            created_at: at(10 - id as i64),
            size_bytes: 1,
            checksums: BTreeMap::new(),
            metadata: BTreeMap::new(),
            status,
            retention: policy,
            job_id: None,
            run_id: None,
            handle: TransferHandle(format!("h{}", id)),
            schema_version: ENTRY_SCHEMA_VERSION,
        }
    }

    fn keep1() -> RetentionPolicy {
        RetentionPolicy::keep_last(1)
    }

    #[test]
    fn resolve_path_runs_from_full_to_target() {
        let index = ChainIndex::new(vec![
            mk(1, None, EntryStatus::Valid, keep1()),
            mk(2, Some(1), EntryStatus::Valid, keep1()),
            mk(3, Some(2), EntryStatus::Valid, keep1()),
        ]);
        let path: Vec<u64> = index
            .resolve_path(EntryId(3))
            .unwrap()
            .iter()
            .map(|e| e.id.0)
            .collect();
        assert_eq!(path, vec![1, 2, 3]);
        assert_eq!(index.depth(EntryId(3)), 2);
        assert_eq!(index.depth(EntryId(1)), 0);
    }

    #[test]
    fn resolve_path_refuses_invalid_links() {
        let index = ChainIndex::new(vec![
            mk(1, None, EntryStatus::Valid, keep1()),
            mk(2, Some(1), EntryStatus::Corrupt, keep1()),
            mk(3, Some(2), EntryStatus::Valid, keep1()),
        ]);
        match index.resolve_path(EntryId(3)) {
            Err(VaultError::BrokenChain { entry, .. }) => assert_eq!(entry, EntryId(2)),
            other => panic!("expected broken chain, got {:?}", other),
        }
        let missing = ChainIndex::new(vec![mk(3, Some(2), EntryStatus::Valid, keep1())]);
        assert!(matches!(
            missing.resolve_path(EntryId(3)),
            Err(VaultError::BrokenChain { .. })
        ));
    }

    #[test]
    fn materialize_applies_changes_and_removals() {
        let mut full = mk(1, None, EntryStatus::Valid, keep1());
        full.checksums.insert("a".into(), "1".into());
        full.checksums.insert("b".into(), "1".into());
        let mut inc = mk(2, Some(1), EntryStatus::Valid, keep1());
        inc.kind = EntryKind::Incremental {
            parent: EntryId(1),
            removed: vec!["b".into()],
        };
        inc.checksums.insert("a".into(), "2".into());
        inc.checksums.insert("c".into(), "2".into());

        let state = materialize(&[full, inc]);
        assert_eq!(state.get("a").map(String::as_str), Some("2"));
        assert!(!state.contains_key("b"));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn causal_order_puts_parents_first() {
        let ordered = causal_order(vec![
            mk(5, Some(3), EntryStatus::Valid, keep1()),
            mk(3, Some(1), EntryStatus::Valid, keep1()),
            mk(4, None, EntryStatus::Valid, keep1()),
            mk(1, None, EntryStatus::Valid, keep1()),
        ]);
        let ids: Vec<u64> = ordered.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 3, 4, 5]);
    }

    #[test]
    fn keep_last_one_protects_ancestors_of_latest() {
        let entries = vec![
            mk(1, None, EntryStatus::Valid, keep1()),
            mk(2, Some(1), EntryStatus::Valid, keep1()),
            mk(3, Some(2), EntryStatus::Valid, keep1()),
        ];
        assert!(compute_deletable(&entries, &keep1(), at(0)).is_empty());
    }

    #[test]
    fn superseded_chain_is_deleted_leaf_first() {
        let mut entries = vec![
            mk(1, None, EntryStatus::Valid, keep1()),
            mk(2, Some(1), EntryStatus::Valid, keep1()),
            mk(3, Some(2), EntryStatus::Valid, keep1()),
            mk(4, None, EntryStatus::Valid, keep1()),
        ];
        let now = at(0);
        let first = compute_deletable(&entries, &keep1(), now);
        assert_eq!(first, BTreeSet::from([EntryId(3)]));
        // Idempotent without intervening change.
        assert_eq!(compute_deletable(&entries, &keep1(), now), first);

        entries[2].status = EntryStatus::Deleted;
        assert_eq!(
            compute_deletable(&entries, &keep1(), now),
            BTreeSet::from([EntryId(2)])
        );
        entries[1].status = EntryStatus::Deleted;
        assert_eq!(
            compute_deletable(&entries, &keep1(), now),
            BTreeSet::from([EntryId(1)])
        );
        entries[0].status = EntryStatus::Deleted;
        assert!(compute_deletable(&entries, &keep1(), now).is_empty());
    }

    #[test]
    fn snapshot_policy_outvotes_shorter_current_policy() {
        let generous = RetentionPolicy::keep_last(5);
        let entries = vec![
            mk(1, None, EntryStatus::Valid, generous),
            mk(2, None, EntryStatus::Valid, generous),
        ];
        assert!(compute_deletable(&entries, &keep1(), at(0)).is_empty());
        assert!(compute_deletable(&entries, &RetentionPolicy::default(), at(0)).is_empty());
    }

    #[test]
    fn age_rule_and_corrupt_entries() {
        let by_age = RetentionPolicy {
            keep_last: None,
            max_age_hours: Some(5),
        };
        let entries = vec![
            mk(1, None, EntryStatus::Valid, by_age),
            mk(2, None, EntryStatus::Corrupt, by_age),
            mk(8, None, EntryStatus::Valid, by_age),
            mk(9, None, EntryStatus::Valid, by_age),
            mk(10, None, EntryStatus::Pending, by_age),
        ];
        let deletable = compute_deletable(&entries, &by_age, at(0));
        assert_eq!(deletable, BTreeSet::from([EntryId(1), EntryId(2)]));
    }

    #[test]
    fn unbounded_policy_keeps_everything_valid() {
        let forever = RetentionPolicy::default();
        let entries = vec![
            mk(1, None, EntryStatus::Valid, forever),
            mk(2, None, EntryStatus::Valid, forever),
        ];
        assert!(compute_deletable(&entries, &forever, at(0)).is_empty());
    }
}
