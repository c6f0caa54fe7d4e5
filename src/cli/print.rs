//! Step header, footer and build summary rendering
//!
//! All boxes share a fixed 80 column width. Titles, versions and URLs that
//! do not fit are truncated with an ellipsis.

use colored::Colorize;
use std::time::Duration;

use crate::models::{BuildRunResults, StepInfo, StepRunResult, StepRunStatus};

const BOX_WIDTH: usize = 80;
const ICON_BOX_WIDTH: usize = 4;
const TIME_BOX_WIDTH: usize = 10;

pub fn running_workflow(title: &str) {
    println!();
    println!("{}", format!("Running workflow ({title})").blue());
    println!();
}

/// Truncate at a char boundary at or below `max_bytes`.
fn truncate_at_boundary(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut end = max_bytes;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

fn padded_row(content: String) -> String {
    let row = format!("| {content} |");
    if row.len() <= BOX_WIDTH {
        let padding = BOX_WIDTH - row.len();
        format!("| {content}{} |", " ".repeat(padding))
    } else {
        let overflow = row.len() - BOX_WIDTH;
        if content.len() > overflow + 3 {
            let trimmed = truncate_at_boundary(&content, content.len() - overflow - 3);
            format!("| {trimmed}... |")
        } else {
            row
        }
    }
}

fn truncate_version(version: &str) -> String {
    if version.len() > 25 {
        let mut start = version.len() - 22;
        while start < version.len() && !version.is_char_boundary(start) {
            start += 1;
        }
        format!("...{}", &version[start..])
    } else {
        version.to_string()
    }
}

pub fn step_header(info: &StepInfo, idx: usize) {
    let sep = format!("+{}+", "-".repeat(BOX_WIDTH - 2));
    let version = truncate_version(&info.version);

    println!("{sep}");
    println!("{}", padded_row(format!("({idx}) {} ({version})", info.title)));
    println!("{sep}");
    println!("{}", padded_row(format!("id: {}", info.id)));
    println!("{}", padded_row(format!("version: {}", info.version)));
    println!("{}", padded_row(format!("collection: {}", info.steplib)));
    println!(
        "{}",
        padded_row(format!("time: {}", chrono::Utc::now().to_rfc3339()))
    );
    println!("{sep}");
    println!("|{}|", " ".repeat(BOX_WIDTH - 2));
}

fn format_seconds(duration: Duration) -> String {
    format!("{:.2} sec", duration.as_secs_f64())
}

fn footer_title(result: &StepRunResult) -> String {
    let info = &result.step_info;
    let version = truncate_version(&info.version);
    let base = match result.status {
        StepRunStatus::Failed | StepRunStatus::FailedSkippable => format!(
            "{} ({}) (exit code: {})",
            info.id, version, result.exit_code
        ),
        _ => format!("{} ({})", info.id, version),
    };

    let title_box_width = BOX_WIDTH - 4 - ICON_BOX_WIDTH - TIME_BOX_WIDTH - 1;
    if base.len() > title_box_width {
        let overflow = base.len() - title_box_width;
        let id_len = info.id.len().saturating_sub(overflow + 3);
        let trimmed = truncate_at_boundary(&info.id, id_len);
        match result.status {
            StepRunStatus::Failed | StepRunStatus::FailedSkippable => format!(
                "{trimmed}... ({}) (exit code: {})",
                version, result.exit_code
            ),
            _ => format!("{trimmed}... ({version})"),
        }
    } else {
        base
    }
}

fn footer_main_row(result: &StepRunResult) -> String {
    let (icon, colorize): (&str, fn(&str) -> colored::ColoredString) = match result.status {
        StepRunStatus::Success => ("✅", |s| s.green()),
        StepRunStatus::Failed => ("🚫", |s| s.red()),
        StepRunStatus::FailedSkippable => ("⚠️", |s| s.yellow()),
        StepRunStatus::Skipped | StepRunStatus::SkippedWithRunIf => ("➡", |s| s.blue()),
    };

    let title = footer_title(result);
    let title_box_width = BOX_WIDTH - 4 - ICON_BOX_WIDTH - TIME_BOX_WIDTH - 1;
    let title_padding = title_box_width.saturating_sub(title.len());

    let time = format_seconds(result.run_time);
    let time_padding = TIME_BOX_WIDTH.saturating_sub(time.len() + 1);

    format!(
        "| {icon}  | {}{} | {}{}|",
        colorize(&title),
        " ".repeat(title_padding),
        time,
        " ".repeat(time_padding)
    )
}

fn footer_sub_section(result: &StepRunResult) -> Vec<String> {
    let info = &result.step_info;
    let mut rows = Vec::new();

    if info.is_update_available() {
        rows.push(padded_row(format!(
            "Update available: {} -> {}",
            info.version, info.latest
        )));
    }
    if !info.support_url.is_empty() {
        rows.push(padded_row(format!("Issue tracker: {}", info.support_url)));
    }
    if !info.source_code_url.is_empty() {
        rows.push(padded_row(format!("Source: {}", info.source_code_url)));
    }
    for line in result.detected_error_messages.iter().take(5) {
        rows.push(padded_row(line.clone()));
    }
    rows
}

fn column_separator() -> String {
    let title_box_width = BOX_WIDTH - 4 - ICON_BOX_WIDTH - TIME_BOX_WIDTH;
    format!(
        "+{}+{}+{}+",
        "-".repeat(ICON_BOX_WIDTH),
        "-".repeat(title_box_width),
        "-".repeat(TIME_BOX_WIDTH)
    )
}

pub fn step_footer(result: &StepRunResult, is_last_step: bool) {
    let sep = column_separator();

    println!("|{}|", " ".repeat(BOX_WIDTH - 2));
    println!("{sep}");
    println!("{}", footer_main_row(result));
    println!("{sep}");
    if result.error.is_some() {
        for row in footer_sub_section(result) {
            println!("{row}");
        }
        println!("{sep}");
    }

    if !is_last_step {
        println!();
        println!("{}▼", " ".repeat(42));
        println!();
    }
}

pub fn summary(results: &BuildRunResults) {
    let sep = column_separator();

    println!();
    println!();
    println!("+{}+", "-".repeat(BOX_WIDTH - 2));
    let banner = "bitrise summary";
    let padding = (BOX_WIDTH - 2 - banner.len()) / 2;
    println!(
        "|{}{banner}{}|",
        " ".repeat(padding),
        " ".repeat(BOX_WIDTH - 2 - banner.len() - padding)
    );
    println!("{sep}");
    let header_padding = BOX_WIDTH - "|    | title".len() - "| time (s) |".len();
    println!("|    | title{}| time (s) |", " ".repeat(header_padding));
    println!("{sep}");

    for result in results.ordered_results() {
        println!("{}", footer_main_row(result));
        println!("{sep}");
        if result.error.is_some() {
            for row in footer_sub_section(result) {
                println!("{row}");
            }
            println!("{sep}");
        }
    }

    let total = format_seconds(results.total_run_time());
    let total_row = format!("| Total runtime: {total}");
    println!("{total_row}{}|", " ".repeat(BOX_WIDTH.saturating_sub(total_row.len() + 1)));
    println!("+{}+", "-".repeat(BOX_WIDTH - 2));
    println!();
}

/// One line per step for a result bucket, used by failure reporting.
pub fn step_status_list(header: &str, steps: &[StepRunResult]) {
    if steps.is_empty() {
        return;
    }
    tracing::info!("{header}");
    for result in steps {
        match &result.error {
            Some(error) => {
                tracing::info!(" * step: ({}) | error: ({error})", result.step_info.id)
            }
            None => tracing::info!(" * step: ({})", result.step_info.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: StepRunStatus, id: &str) -> StepRunResult {
        StepRunResult {
            step_info: StepInfo {
                id: id.to_string(),
                title: id.to_string(),
                version: "1.0.0".to_string(),
                ..Default::default()
            },
            status,
            idx: 0,
            run_time: Duration::from_secs(2),
            exit_code: 0,
            error: None,
            detected_error_messages: Vec::new(),
        }
    }

    #[test]
    fn padded_rows_have_fixed_width() {
        let row = padded_row("short".to_string());
        assert_eq!(row.len(), BOX_WIDTH);

        let long = padded_row("x".repeat(200));
        assert_eq!(long.len(), BOX_WIDTH);
        assert!(long.contains("..."));
    }

    #[test]
    fn long_versions_are_truncated_with_ellipsis() {
        let version = truncate_version("https://github.com/some/very/long/version/string");
        assert!(version.starts_with("..."));
        assert_eq!(version.len(), 25);
        assert_eq!(truncate_version("1.2.3"), "1.2.3");
    }

    #[test]
    fn failed_footer_title_includes_exit_code() {
        let mut failed = result(StepRunStatus::Failed, "script");
        failed.exit_code = 42;
        assert!(footer_title(&failed).contains("exit code: 42"));

        let ok = result(StepRunStatus::Success, "script");
        assert!(!footer_title(&ok).contains("exit code"));
    }

    #[test]
    fn overlong_titles_are_trimmed() {
        let long = result(StepRunStatus::Success, &"a".repeat(120));
        let title = footer_title(&long);
        assert!(title.contains("..."));
        assert!(title.len() <= BOX_WIDTH);
    }
}
