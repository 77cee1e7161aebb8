//! Styled terminal output for run results and live trace events.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use weft_types::event::TraceEvent;
use weft_types::result::{BlockResult, BlockStatus, ExecutionResult, RunStatus};

/// Print a finished run: summary header, per-block table, final output.
pub fn print_result(result: &ExecutionResult) -> anyhow::Result<()> {
    let marker = match result.status {
        RunStatus::Success => style("*").green().bold(),
        RunStatus::Cancelled => style("~").yellow().bold(),
        RunStatus::Failed => style("x").red().bold(),
    };

    println!();
    println!(
        "  {} Workflow '{}' {}",
        marker,
        style(&result.workflow_id).cyan(),
        result.status
    );
    println!("  Execution: {}", result.execution_id);
    println!("  Duration: {} ms", result.duration_ms());
    if result.total_cost > 0.0 {
        println!("  Cost: {:.4}", result.total_cost);
    }
    if !result.total_tokens.is_zero() {
        println!("  Tokens: {}", result.total_tokens.total);
    }
    if let Some(ref err) = result.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    if !result.block_results.is_empty() {
        println!("{}", block_table(result.block_results.values()));
        println!();
    }

    println!("  {}", style("Output:").bold());
    for line in serde_json::to_string_pretty(&result.output)?.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}

fn block_table<'a>(results: impl Iterator<Item = &'a BlockResult>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Block").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Runs"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for r in results {
        let runs = if r.iterations.is_empty() {
            "-".to_string()
        } else {
            r.iterations.len().to_string()
        };
        let duration = r
            .duration_ms()
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_else(|| "-".to_string());
        let error = r
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();

        table.add_row(vec![
            Cell::new(&r.block_id),
            Cell::new(r.block_type.to_string()),
            status_cell(r.status),
            Cell::new(runs),
            Cell::new(duration),
            Cell::new(error),
        ]);
    }
    table
}

fn status_cell(status: BlockStatus) -> Cell {
    let color = match status {
        BlockStatus::Success => Color::Green,
        BlockStatus::Error => Color::Red,
        BlockStatus::Cancelled => Color::Yellow,
        _ => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}

/// One line per trace event for `run --stream` without `--json`.
pub fn event_line(event: &TraceEvent) -> String {
    match event {
        TraceEvent::BlockStarted {
            block_id,
            block_type,
            iteration,
            ..
        } => format!(
            "  {} {} ({}){}",
            style(">").cyan(),
            block_id,
            block_type,
            iteration_suffix(*iteration)
        ),
        TraceEvent::BlockFinished {
            block_id,
            status,
            iteration,
            error,
            ..
        } => {
            let marker = match status {
                BlockStatus::Success => style("<").green(),
                BlockStatus::Error => style("!").red(),
                BlockStatus::Cancelled => style("~").yellow(),
                _ => style("-").dim(),
            };
            let mut line = format!("  {marker} {block_id} {status}{}", iteration_suffix(*iteration));
            if let Some(error) = error {
                line.push_str(&format!(": {}", style(error).red()));
            }
            line
        }
        TraceEvent::RunComplete {
            status,
            total_duration_ms,
            ..
        } => format!(
            "  {} run {status} in {total_duration_ms} ms",
            style("=").bold()
        ),
    }
}

fn iteration_suffix(iteration: Option<usize>) -> String {
    iteration
        .map(|i| format!(" [#{i}]"))
        .unwrap_or_default()
}
