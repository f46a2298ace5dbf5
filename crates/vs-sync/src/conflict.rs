//! Conflict resolution for a single issue whose tracker and board statuses
//! disagree, plus the flap guard that stops two consecutive passes from
//! ping-ponging an entity between states.
//!
//! Resolution order: board-freshness gate, tracker authority inside a short
//! window, last-writer-wins with ties to the tracker.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use vs_core::status::{tracker_to_board, BoardStatus};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConflictPolicy {
    /// A board timestamp older than this is untrustworthy.
    pub board_freshness_threshold: Duration,
    /// Both sources claiming a change inside this window means the tracker
    /// wins outright.
    pub authority_window: Duration,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            board_freshness_threshold: Duration::hours(24),
            authority_window: Duration::seconds(30),
        }
    }
}

/// Which source's claim should be propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// Statuses already agree under the mapping; nothing to do.
    InSync,
    /// The tracker's status is applied to the board.
    Tracker,
    /// The board's status is applied to the tracker.
    Board,
}

/// Resolve a tracker/board status disagreement.
pub fn resolve_status(
    policy: &ConflictPolicy,
    now: DateTime<Utc>,
    tracker_status: &str,
    tracker_modified: Option<DateTime<Utc>>,
    board_status: &str,
    board_modified: Option<DateTime<Utc>>,
) -> Winner {
    let tracker_mapped = tracker_to_board(tracker_status);
    let board_mapped = BoardStatus::parse(board_status);
    if tracker_mapped == board_mapped {
        return Winner::InSync;
    }

    // Rule 1: freshness gate. An absent, old, or obviously-stale board
    // timestamp forfeits the board's claim.
    let board_fresh = match board_modified {
        None => false,
        Some(bm) => {
            let within_threshold = now - bm <= policy.board_freshness_threshold;
            let obviously_stale = tracker_modified
                .map(|tm| tm - bm > policy.board_freshness_threshold)
                .unwrap_or(false);
            within_threshold && !obviously_stale
        }
    };
    if !board_fresh {
        return Winner::Tracker;
    }

    match (tracker_modified, board_modified) {
        (Some(tm), Some(bm)) => {
            // Rule 2: near-simultaneous changes go to the authority.
            if (tm - bm).abs() <= policy.authority_window {
                Winner::Tracker
            } else if bm > tm {
                // Rule 3: last writer wins...
                Winner::Board
            } else {
                // ...ties and older board writes go to the tracker.
                Winner::Tracker
            }
        }
        // Board carries the only timestamp and passed the gate.
        (None, Some(_)) => Winner::Board,
        _ => Winner::Tracker,
    }
}

// ---------------------------------------------------------------------------
// Flap guard
// ---------------------------------------------------------------------------

/// Suppresses a transition that would exactly reverse the transition applied
/// to the same entity by the immediately preceding pass. Call
/// [`FlapGuard::begin_run`] at the start of every sync run.
#[derive(Debug, Default)]
pub struct FlapGuard {
    previous: HashMap<String, (String, String)>,
    current: HashMap<String, (String, String)>,
}

impl FlapGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rotate run state: the transitions of the finished run become the ones
    /// guarded against in the next.
    pub fn begin_run(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    /// Whether applying `from -> to` on `entity` is allowed. When allowed the
    /// transition is recorded; when it would reverse the preceding pass's
    /// transition it is suppressed and logged.
    pub fn allow(&mut self, entity: &str, from: &str, to: &str) -> bool {
        let reversal = (to.to_string(), from.to_string());
        let flapping = self.previous.get(entity) == Some(&reversal)
            || self.current.get(entity) == Some(&reversal);
        if flapping {
            info!(entity, from, to, "flap-suppressed");
            return false;
        }
        self.current
            .insert(entity.to_string(), (from.to_string(), to.to_string()));
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
