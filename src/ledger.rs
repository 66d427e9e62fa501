//! Change ledger — bounded, in-memory history of accepted state transitions.
//!
//! DESIGN
//! ======
//! Every accepted mutation appends one record carrying the before/after
//! values of the touched element. Once the ledger exceeds its bound the
//! oldest record is evicted, FIFO. The ledger powers observability and
//! undo; it plays no part in conflict resolution and is never persisted.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::now_ms;

/// Records kept before the oldest is evicted.
pub const DEFAULT_LEDGER_CAPACITY: usize = 50;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeSubject {
    Area,
    CollisionArea,
    Dimensions,
    Layer,
    Asset,
}

/// One accepted state transition. `before`/`after` are JSON images of the
/// touched element (`None` on the missing side of add/remove).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub kind: ChangeKind,
    pub subject: ChangeSubject,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub ts: i64,
    pub actor: String,
}

impl ChangeRecord {
    #[must_use]
    pub fn new(
        kind: ChangeKind,
        subject: ChangeSubject,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        actor: &str,
    ) -> Self {
        Self { id: Uuid::new_v4(), kind, subject, before, after, ts: now_ms(), actor: actor.to_owned() }
    }
}

// =============================================================================
// LEDGER
// =============================================================================

#[derive(Debug)]
pub struct ChangeLedger {
    records: VecDeque<ChangeRecord>,
    capacity: usize,
}

impl ChangeLedger {
    /// A zero capacity is treated as 1 so `record` always keeps the newest
    /// entry.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { records: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Append a record, evicting the oldest if over capacity.
    pub fn record(&mut self, record: ChangeRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// All records, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<ChangeRecord> {
        self.records.iter().cloned().collect()
    }

    /// The newest `n` records, oldest of those first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<ChangeRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn last(&self) -> Option<&ChangeRecord> {
        self.records.back()
    }

    /// Remove and return the newest record.
    pub fn pop_last(&mut self) -> Option<ChangeRecord> {
        self.records.pop_back()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for ChangeLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dimension_update(n: i64) -> ChangeRecord {
        ChangeRecord::new(
            ChangeKind::Update,
            ChangeSubject::Dimensions,
            Some(serde_json::json!({ "n": n - 1 })),
            Some(serde_json::json!({ "n": n })),
            "test",
        )
    }

    #[test]
    fn records_in_order() {
        let mut ledger = ChangeLedger::default();
        for n in 0..5 {
            ledger.record(dimension_update(n));
        }
        let all = ledger.all();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].after, Some(serde_json::json!({ "n": 0 })));
        assert_eq!(all[4].after, Some(serde_json::json!({ "n": 4 })));
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut ledger = ChangeLedger::default();
        for n in 0..75 {
            ledger.record(dimension_update(n));
        }
        assert_eq!(ledger.len(), DEFAULT_LEDGER_CAPACITY);
        let all = ledger.all();
        // 75 recorded, bound 50: entries 25..=74 survive.
        assert_eq!(all[0].after, Some(serde_json::json!({ "n": 25 })));
        assert_eq!(all[49].after, Some(serde_json::json!({ "n": 74 })));
    }

    #[test]
    fn recent_returns_newest_n() {
        let mut ledger = ChangeLedger::new(10);
        for n in 0..6 {
            ledger.record(dimension_update(n));
        }
        let recent = ledger.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].after, Some(serde_json::json!({ "n": 3 })));
        assert_eq!(recent[2].after, Some(serde_json::json!({ "n": 5 })));
    }

    #[test]
    fn recent_larger_than_len_returns_all() {
        let mut ledger = ChangeLedger::new(10);
        ledger.record(dimension_update(0));
        assert_eq!(ledger.recent(100).len(), 1);
    }

    #[test]
    fn pop_last_removes_newest() {
        let mut ledger = ChangeLedger::new(10);
        ledger.record(dimension_update(0));
        ledger.record(dimension_update(1));

        let popped = ledger.pop_last().unwrap();
        assert_eq!(popped.after, Some(serde_json::json!({ "n": 1 })));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.last().unwrap().after, Some(serde_json::json!({ "n": 0 })));
    }

    #[test]
    fn clear_empties_ledger() {
        let mut ledger = ChangeLedger::new(10);
        ledger.record(dimension_update(0));
        ledger.clear();
        assert!(ledger.is_empty());
        assert!(ledger.pop_last().is_none());
    }
}
