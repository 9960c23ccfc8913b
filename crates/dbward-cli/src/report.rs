use std::path::Path;

use dbward_config::DbWardConfig;
use dbward_db::{BackupMetadata, MigrationStatus};

const MIN_WIDTH: usize = 50;

/// Lay out `rows` as `label  value` lines inside a rounded box.
fn render_box(title: &str, rows: &[(&str, String)]) -> Vec<String> {
    let label_w = rows.iter().map(|(l, _)| l.chars().count()).max().unwrap_or(0);
    let content_w = rows
        .iter()
        .map(|(_, v)| label_w + 2 + v.chars().count())
        .max()
        .unwrap_or(0);
    // 4 for "│ " + " │"
    let width = (content_w + 4).max(title.chars().count() + 8).max(MIN_WIDTH);
    let inner = width - 4;

    let title_dashes = width - 2 - title.chars().count() - 5; // 2 for ╭╮, 5 for "─── " + " "
    let mut lines = vec![format!("╭─── {title} {}╮", "─".repeat(title_dashes))];
    lines.push(format!("│ {:<inner$} │", ""));
    for (label, value) in rows {
        let text = format!("{label:<label_w$}  {value}");
        lines.push(format!("│ {text:<inner$} │"));
    }
    lines.push(format!("│ {:<inner$} │", ""));
    lines.push(format!("╰{}╯", "─".repeat(width - 2)));
    lines
}

pub fn print_status(config: &DbWardConfig, status: &MigrationStatus) {
    let lock = match &status.lock {
        Some(info) => format!(
            "held by {} (pid {}) until {}",
            info.locked_by,
            info.pid,
            info.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => "free".to_string(),
    };
    let rows = [
        ("Namespace", config.namespace.clone()),
        ("Database", config.database.clone()),
        ("Path", config.database_path().display().to_string()),
        ("Applied", status.applied.len().to_string()),
        ("Failed", status.failed.len().to_string()),
        ("Pending", status.pending.len().to_string()),
        ("Orphaned", status.orphans.len().to_string()),
        ("Drifted", status.drifted.len().to_string()),
        ("Lock", lock),
    ];
    for line in render_box("dbward status", &rows) {
        println!("{line}");
    }

    if !status.applied.is_empty() {
        println!();
        println!("Applied:");
        for record in &status.applied {
            println!(
                "  {}  {}  by {}  ({} ms)",
                record.version,
                record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                record.applied_by,
                record.execution_time_ms
            );
        }
    }
    if !status.failed.is_empty() {
        println!();
        println!("Failed (retried on next migrate):");
        for record in &status.failed {
            println!(
                "  {}  {}",
                record.version,
                record.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }
    for (heading, versions) in [
        ("Pending:", &status.pending),
        ("Recorded without a file:", &status.orphans),
        ("Changed on disk since applied:", &status.drifted),
    ] {
        if versions.is_empty() {
            continue;
        }
        println!();
        println!("{heading}");
        for version in versions {
            println!("  {version}");
        }
    }
}

pub fn print_backups(dir: &Path, backups: &[BackupMetadata]) {
    if backups.is_empty() {
        println!("No backups in {}", dir.display());
        return;
    }
    let rows: Vec<_> = backups
        .iter()
        .map(|b| {
            (
                b.name.as_str(),
                format!(
                    "{}  {:>9}  {}",
                    b.created_at.format("%Y-%m-%d %H:%M:%S"),
                    b.size,
                    b.user
                ),
            )
        })
        .collect();
    for line in render_box(&format!("{} backup(s)", backups.len()), &rows) {
        println!("{line}");
    }
    println!("  in {}", dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_lines_share_a_width() {
        let lines = render_box(
            "dbward status",
            &[("Applied", "2".to_string()), ("Lock", "free".to_string())],
        );
        assert_eq!(lines.len(), 6);
        let width = lines[0].chars().count();
        assert!(width >= MIN_WIDTH);
        assert!(lines.iter().all(|l| l.chars().count() == width));
        assert!(lines[2].starts_with("│ Applied  2"));
    }

    #[test]
    fn box_grows_with_long_values() {
        let long = "x".repeat(80);
        let lines = render_box("t", &[("Path", long.clone())]);
        let width = lines[0].chars().count();
        assert!(width > 80);
        assert!(lines.iter().all(|l| l.chars().count() == width));
        assert!(lines[2].contains(&long));
    }
}
