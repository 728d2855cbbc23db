//! Terminal rendering for CLI output.

use crate::client::AttentionItem;
use ve_core::sync::SyncResult;
use ve_core::{ArtifactListing, StatusLogEntry, WorkUnit};

/// `<short>: <STATUS>` lines for an artifact listing, topologically ordered.
pub fn artifact_list(rows: &[ArtifactListing]) -> String {
    let mut out = String::new();
    for row in rows {
        match row {
            ArtifactListing::Local { short, status } => {
                out.push_str(&format!("{short}: {status}\n"));
            }
            ArtifactListing::External {
                short,
                repo,
                artifact_id,
            } => {
                out.push_str(&format!("{short}: EXTERNAL -> {repo}:{artifact_id}\n"));
            }
        }
    }
    out
}

/// Work-unit table for `ve orch units`.
pub fn work_unit_table(units: &[WorkUnit]) -> String {
    let mut out = String::from("CHUNK                PHASE      STATUS            PRIORITY  BLOCKED BY\n");
    for unit in units {
        out.push_str(&format!(
            "{:<20} {:<10} {:<17} {:<9} {}\n",
            unit.chunk,
            unit.phase.as_str(),
            unit.status.as_str(),
            unit.priority,
            unit.blocked_by.join(", "),
        ));
    }
    out
}

/// Attention queue for `ve orch attention`.
pub fn attention_table(items: &[AttentionItem]) -> String {
    let mut out = String::from("CHUNK                BLOCKING  REASON\n");
    for item in items {
        out.push_str(&format!(
            "{:<20} {:<9} {}\n",
            item.work_unit.chunk,
            item.blocking_count,
            item.work_unit.attention_reason.as_deref().unwrap_or("-"),
        ));
    }
    out
}

/// Status history for `ve orch history`.
pub fn history_table(history: &[StatusLogEntry]) -> String {
    let mut out = String::new();
    for entry in history {
        out.push_str(&format!(
            "{}  {} -> {}\n",
            entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            entry.old_status.as_deref().unwrap_or("(created)"),
            entry.new_status,
        ));
    }
    out
}

/// Per-entry sync report plus the `Updated N` summary line.
pub fn sync_report(results: &[SyncResult]) -> String {
    let mut out = String::new();
    for result in results {
        match &result.error {
            Some(error) => {
                out.push_str(&format!("{}: error: {error}\n", result.chunk_id));
            }
            None if result.updated => {
                out.push_str(&format!(
                    "{}: {} -> {}\n",
                    result.chunk_id,
                    short_sha(&result.old_sha),
                    short_sha(&result.new_sha),
                ));
            }
            None => {
                out.push_str(&format!(
                    "{}: up to date ({})\n",
                    result.chunk_id,
                    short_sha(&result.new_sha),
                ));
            }
        }
    }
    let updated = results.iter().filter(|r| r.updated && r.error.is_none()).count();
    out.push_str(&format!("Updated {updated}\n"));
    out
}

fn short_sha(sha: &str) -> &str {
    if sha.is_empty() {
        "(none)"
    } else if sha.len() >= 12 {
        &sha[..12]
    } else {
        sha
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ve_core::RawStatus;

    #[test]
    fn artifact_list_prints_status_lines() {
        let rows = vec![
            ArtifactListing::Local {
                short: "a".to_string(),
                status: RawStatus("ACTIVE".to_string()),
            },
            ArtifactListing::External {
                short: "b".to_string(),
                repo: "acme/platform".to_string(),
                artifact_id: "remote".to_string(),
            },
        ];
        let out = artifact_list(&rows);
        assert_eq!(out, "a: ACTIVE\nb: EXTERNAL -> acme/platform:remote\n");
    }

    #[test]
    fn sync_report_counts_updates() {
        let results = vec![
            SyncResult {
                chunk_id: "a".to_string(),
                old_sha: "1".repeat(40),
                new_sha: "2".repeat(40),
                updated: true,
                error: None,
            },
            SyncResult {
                chunk_id: "b".to_string(),
                old_sha: "2".repeat(40),
                new_sha: "2".repeat(40),
                updated: false,
                error: None,
            },
            SyncResult {
                chunk_id: "c".to_string(),
                old_sha: String::new(),
                new_sha: String::new(),
                updated: false,
                error: Some("missing repo".to_string()),
            },
        ];
        let out = sync_report(&results);
        assert!(out.contains("Updated 1\n"));
        assert!(out.contains("c: error: missing repo"));
    }
}
