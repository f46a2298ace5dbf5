//! Pure builders for the agent's labeled memory blocks.
//!
//! Every builder is a deterministic function of its inputs: no clocks, no
//! counters, no "now" fields -- anything volatile would defeat the
//! hash-based diffing that keeps block upserts quiet when nothing changed.
//! Structured blocks serialize through BTreeMaps so equal inputs give
//! byte-equal output regardless of input ordering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vs_core::status::{tracker_to_board, TRACKER_STATUSES};
use vs_core::types::{Issue, Project};

/// All managed block labels, in upsert order.
pub const BLOCK_LABELS: [&str; 9] = [
    "project",
    "board_config",
    "board_metrics",
    "hotspots",
    "backlog_summary",
    "change_log",
    "persona",
    "human",
    "scratchpad",
];

/// Label of the only block a sleep-time partner may keep attached.
pub const SCRATCHPAD_LABEL: &str = "scratchpad";

/// One status transition recorded for the change log block. Timestamps are
/// deliberately absent; the log is ordered by position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub issue_identifier: String,
    pub from_status: String,
    pub to_status: String,
}

fn to_sorted_json(map: &BTreeMap<&str, serde_json::Value>) -> String {
    // BTreeMap keys are already sorted; serde_json emits them in order.
    serde_json::to_string_pretty(map).unwrap_or_default()
}

/// `project` block: stable project metadata.
pub fn project_block(project: &Project) -> String {
    let mut map = BTreeMap::new();
    map.insert("identifier", serde_json::json!(project.identifier));
    map.insert("name", serde_json::json!(project.name));
    map.insert("git_url", serde_json::json!(project.git_url));
    map.insert("filesystem_path", serde_json::json!(project.filesystem_path));
    map.insert("issue_count", serde_json::json!(project.issue_count));
    to_sorted_json(&map)
}

/// `board_config` block: the board binding and its status lattice.
pub fn board_config_block(project: &Project) -> String {
    let lattice: Vec<&str> = TRACKER_STATUSES
        .iter()
        .map(|s| tracker_to_board(s).as_str())
        .collect();
    let mut map = BTreeMap::new();
    map.insert("board_project_id", serde_json::json!(project.board_id));
    map.insert("statuses", serde_json::json!(lattice));
    to_sorted_json(&map)
}

/// `board_metrics` block: issue counts per board status, keys sorted.
pub fn board_metrics_block(issues: &[Issue]) -> String {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for status in TRACKER_STATUSES {
        counts.insert(tracker_to_board(status).as_str().to_string(), 0);
    }
    for issue in issues {
        let board = tracker_to_board(&issue.status).as_str().to_string();
        *counts.entry(board).or_insert(0) += 1;
    }
    let mut map = BTreeMap::new();
    map.insert("total", serde_json::json!(issues.len()));
    map.insert("by_status", serde_json::json!(counts));
    to_sorted_json(&map)
}

/// `hotspots` block: the issues with the most recent tracker activity,
/// ordered by their own modification timestamps (which are input data, not
/// clock reads). Ties break on identifier so the output is stable.
pub fn hotspots_block(issues: &[Issue]) -> String {
    let mut sorted: Vec<&Issue> = issues.iter().collect();
    sorted.sort_by(|a, b| {
        b.tracker_modified_at
            .cmp(&a.tracker_modified_at)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    let hot: Vec<serde_json::Value> = sorted
        .iter()
        .take(5)
        .map(|i| {
            serde_json::json!({
                "identifier": i.identifier,
                "status": i.status,
                "title": i.title,
            })
        })
        .collect();
    let mut map = BTreeMap::new();
    map.insert("hotspots", serde_json::json!(hot));
    to_sorted_json(&map)
}

/// `backlog_summary` block: backlog size plus the first few backlog titles
/// in identifier order.
pub fn backlog_summary_block(issues: &[Issue]) -> String {
    let mut backlog: Vec<&Issue> = issues
        .iter()
        .filter(|i| tracker_to_board(&i.status) == vs_core::status::BoardStatus::Todo)
        .collect();
    backlog.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    let head: Vec<serde_json::Value> = backlog
        .iter()
        .take(10)
        .map(|i| serde_json::json!({ "identifier": i.identifier, "title": i.title }))
        .collect();
    let mut map = BTreeMap::new();
    map.insert("count", serde_json::json!(backlog.len()));
    map.insert("head", serde_json::json!(head));
    to_sorted_json(&map)
}

/// `change_log` block: the most recent transitions, oldest first, bounded.
pub fn change_log_block(entries: &[ChangeLogEntry]) -> String {
    const KEEP: usize = 20;
    let tail: Vec<String> = entries
        .iter()
        .rev()
        .take(KEEP)
        .rev()
        .map(|e| format!("{}: {} -> {}", e.issue_identifier, e.from_status, e.to_status))
        .collect();
    tail.join("\n")
}

/// `persona` block default, used when the Control Agent supplies none.
pub fn persona_block(project: &Project) -> String {
    format!(
        "You are the project memory agent for {name} ({ident}). You track the \
         project's issues across its tracker, kanban board, and local issue \
         store, and answer questions about project state, hotspots, and \
         backlog. Be concise and cite issue identifiers.",
        name = project.name,
        ident = project.identifier,
    )
}

/// `human` block default.
pub fn human_block(project: &Project) -> String {
    format!(
        "The user is a developer working on {name}. They care about issue \
         status, what changed recently, and what to pick up next.",
        name = project.name,
    )
}

/// `scratchpad` block seed. Only written at agent creation; the agent owns
/// its scratchpad afterwards.
pub fn scratchpad_block() -> String {
    "(working notes)".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
