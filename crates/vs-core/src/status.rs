//! Pure bidirectional mapping between tracker status labels and the board's
//! five-state lattice. Both directions are total: unrecognized input falls
//! back to `todo` / `Backlog`.

use serde::{Deserialize, Serialize};

/// The board's restricted status lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

impl BoardStatus {
    /// Canonical wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardStatus::Todo => "todo",
            BoardStatus::InProgress => "inprogress",
            BoardStatus::InReview => "inreview",
            BoardStatus::Done => "done",
            BoardStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a board status, case-insensitively. Unrecognized input maps to
    /// `Todo`.
    pub fn parse(raw: &str) -> BoardStatus {
        match raw.trim().to_lowercase().as_str() {
            "todo" => BoardStatus::Todo,
            "inprogress" | "in-progress" | "in_progress" => BoardStatus::InProgress,
            "inreview" | "in-review" | "in_review" => BoardStatus::InReview,
            "done" => BoardStatus::Done,
            "cancelled" | "canceled" => BoardStatus::Cancelled,
            _ => BoardStatus::Todo,
        }
    }
}

impl std::fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical tracker status labels, in lattice order.
pub const TRACKER_STATUSES: [&str; 5] =
    ["Backlog", "In Progress", "In Review", "Done", "Cancelled"];

/// Map a tracker status label onto the board lattice. Case-insensitive;
/// common tracker aliases (`Todo`, `Active`, `Completed`) are accepted.
pub fn tracker_to_board(status: &str) -> BoardStatus {
    match status.trim().to_lowercase().as_str() {
        "backlog" | "todo" => BoardStatus::Todo,
        "in progress" | "inprogress" | "active" | "started" => BoardStatus::InProgress,
        "in review" | "inreview" | "review" => BoardStatus::InReview,
        "done" | "completed" | "closed" => BoardStatus::Done,
        "cancelled" | "canceled" => BoardStatus::Cancelled,
        _ => BoardStatus::Todo,
    }
}

/// Map a board status back to the canonical tracker label.
pub fn board_to_tracker(status: BoardStatus) -> &'static str {
    match status {
        BoardStatus::Todo => "Backlog",
        BoardStatus::InProgress => "In Progress",
        BoardStatus::InReview => "In Review",
        BoardStatus::Done => "Done",
        BoardStatus::Cancelled => "Cancelled",
    }
}

/// Map a raw board status label to the canonical tracker label.
pub fn board_label_to_tracker(raw: &str) -> &'static str {
    board_to_tracker(BoardStatus::parse(raw))
}

/// Canonical spelling of a tracker label: round the label through the board
/// lattice. Aliases collapse onto their canonical form.
pub fn canonical_tracker(status: &str) -> &'static str {
    board_to_tracker(tracker_to_board(status))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
