//! Display formatting for CLI output
//!
//! Plans, execution reports and release tables, styled with `console`.

use console::{StyledObject, style};
use keelson_core::{Release, ReleaseStatus};
use keelson_kube::{OperationStatus, Plan, Report};
use std::fmt::Write as _;

/// Color a release status
pub fn status_style(status: ReleaseStatus) -> StyledObject<String> {
    let text = status.to_string();
    match status {
        ReleaseStatus::Deployed => style(text).green(),
        ReleaseStatus::Failed => style(text).red(),
        ReleaseStatus::Superseded => style(text).dim(),
        s if s.is_pending() => style(text).yellow(),
        _ => style(text).dim(),
    }
}

fn operation_marker(status: OperationStatus) -> StyledObject<&'static str> {
    match status {
        OperationStatus::Completed => style("✓").green(),
        OperationStatus::Failed => style("✗").red().bold(),
        OperationStatus::Pending => style("·").dim(),
    }
}

/// Phases and operations, one line each
pub fn format_plan(plan: &Plan) -> String {
    let mut out = String::new();
    if plan.is_empty() {
        let _ = writeln!(out, "{}", style("nothing to do").dim());
        return out;
    }
    for phase in &plan.phases {
        let _ = writeln!(out, "{}", style(phase.kind).bold());
        for op in &phase.operations {
            let _ = writeln!(out, "  {} {}", operation_marker(op.status), op.id);
            for id in op.kind.target_ids() {
                let _ = writeln!(out, "      {}", style(id).dim());
            }
        }
    }
    if !plan.skipped.is_empty() {
        let _ = writeln!(out, "{}", style("skipped").bold());
        for skipped in &plan.skipped {
            let _ = writeln!(out, "  {} ({})", skipped.id, skipped.reason);
        }
    }
    out
}

/// What changed in the cluster
pub fn format_report(report: &Report) -> String {
    let mut out = String::new();
    let groups = [
        ("+", "created", report.created.iter().map(|(id, _)| id).collect::<Vec<_>>()),
        ("~", "recreated", report.recreated.iter().map(|(id, _)| id).collect()),
        ("~", "updated", report.updated.iter().map(|(id, _)| id).collect()),
        ("-", "deleted", report.deleted.iter().collect()),
    ];
    for (marker, verb, ids) in groups {
        for id in ids {
            let _ = writeln!(out, "  {} {} {}", marker, verb, id);
        }
    }
    let _ = writeln!(out, "{}", style(report.summary()).bold());
    out
}

/// Revision table, newest last
pub fn format_history(releases: &[Release]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<18} {:<21} {}",
        style("REVISION").bold(),
        style("STATUS").bold(),
        style("UPDATED").bold(),
        style("DESCRIPTION").bold()
    );
    for release in releases {
        let _ = writeln!(
            out,
            "{:<10} {:<18} {:<21} {}",
            release.revision,
            status_style(release.status),
            release.last_deployed.format("%Y-%m-%d %H:%M:%S"),
            release.description
        );
    }
    out
}
