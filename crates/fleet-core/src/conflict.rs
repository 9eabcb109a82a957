//! # Conflict Resolution
//!
//! Deterministic arbitration between two competing writes to the same record.
//!
//! ## Policy: first-write-wins
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Conflict Resolution Rule                           │
//! │                                                                         │
//! │  resolve(a, b):                                                        │
//! │      if a.created_at <= b.created_at  ──►  a wins (b rejected)         │
//! │      else                             ──►  b wins (a rejected)         │
//! │                                                                         │
//! │  • The event with the NON-LATER timestamp wins.                        │
//! │  • Exact tie: the FIRST argument wins.                                 │
//! │  • Pure: no external state, no side effects. Callers audit the         │
//! │    outcome themselves.                                                 │
//! │                                                                         │
//! │  At the ingest call site the first argument is the already-persisted   │
//! │  pending event, so a tie keeps the record that arrived first.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SyncEvent;

/// Which argument of [`resolve`] won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    /// The first argument (at ingest: the existing pending event).
    First,
    /// The second argument (at ingest: the incoming challenger).
    Second,
}

/// Outcome of the incoming challenger, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDisposition {
    /// The second argument (challenger) won and should be persisted.
    Accepted,
    /// The second argument lost; the first is retained.
    Rejected,
}

/// Result of resolving one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictOutcome {
    pub winner: ConflictWinner,
    pub disposition: ConflictDisposition,
}

/// Resolves a conflict between two events competing for the same record.
///
/// Total and deterministic: defined for any pair, and repeated invocation
/// with the same pair always yields the same winner. Operates only on the
/// two events' timestamps.
pub fn resolve(first: &SyncEvent, second: &SyncEvent) -> ConflictOutcome {
    if first.created_at <= second.created_at {
        ConflictOutcome {
            winner: ConflictWinner::First,
            disposition: ConflictDisposition::Rejected,
        }
    } else {
        ConflictOutcome {
            winner: ConflictWinner::Second,
            disposition: ConflictDisposition::Accepted,
        }
    }
}

/// Picks the winner among several reported versions of one record.
///
/// Same rule as [`resolve`], folded left: the earliest timestamp wins,
/// and a tie keeps the earlier position. Returns the winning index, or
/// `None` for an empty slice.
pub fn resolve_among(timestamps: &[DateTime<Utc>]) -> Option<usize> {
    if timestamps.is_empty() {
        return None;
    }
    let mut winner = 0;
    for (i, ts) in timestamps.iter().enumerate().skip(1) {
        if *ts < timestamps[winner] {
            winner = i;
        }
    }
    Some(winner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn event_at(offset_secs: i64) -> SyncEvent {
        let mut event = SyncEvent::new(
            "stock_update",
            &json!({"record_id": "r-1"}),
            "dev-a",
            None,
        );
        event.created_at = Utc::now() + Duration::seconds(offset_secs);
        event
    }

    #[test]
    fn test_earlier_event_wins() {
        let a = event_at(0);
        let b = event_at(3600);

        let outcome = resolve(&a, &b);
        assert_eq!(outcome.winner, ConflictWinner::First);
        assert_eq!(outcome.disposition, ConflictDisposition::Rejected);

        // Swapped arguments: the earlier event still wins.
        let outcome = resolve(&b, &a);
        assert_eq!(outcome.winner, ConflictWinner::Second);
        assert_eq!(outcome.disposition, ConflictDisposition::Accepted);
    }

    #[test]
    fn test_exact_tie_first_argument_wins() {
        let a = event_at(0);
        let mut b = event_at(0);
        b.created_at = a.created_at;

        let outcome = resolve(&a, &b);
        assert_eq!(outcome.winner, ConflictWinner::First);
    }

    #[test]
    fn test_resolve_among_picks_earliest() {
        let base = Utc::now();
        let stamps = vec![
            base + Duration::seconds(10),
            base,
            base + Duration::seconds(5),
        ];
        assert_eq!(resolve_among(&stamps), Some(1));
    }

    #[test]
    fn test_resolve_among_tie_keeps_earlier_position() {
        let base = Utc::now();
        assert_eq!(resolve_among(&[base, base]), Some(0));
        assert_eq!(resolve_among(&[]), None);
    }

    #[test]
    fn test_deterministic_across_calls() {
        let a = event_at(-5);
        let b = event_at(5);
        let first = resolve(&a, &b);
        for _ in 0..100 {
            assert_eq!(resolve(&a, &b), first);
        }
    }
}
