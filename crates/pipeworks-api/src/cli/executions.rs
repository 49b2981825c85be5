//! Execution management commands: execs, exec, active, today, clear.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use dialoguer::Confirm;
use pipeworks_types::pipeline::{RunStatus, StatusRecord};
use uuid::Uuid;

use crate::state::AppState;

/// Rows shown by `execs` before asking to show the rest.
const PAGE_SIZE: usize = 10;

/// List every recorded execution.
pub async fn list_executions(state: &AppState, all: bool, json: bool) -> Result<()> {
    let records = state.manager.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        print_empty("No executions recorded yet. Start one with:");
        return Ok(());
    }

    if all || records.len() <= PAGE_SIZE {
        print_table(&records);
        print_count(records.len(), records.len());
        return Ok(());
    }

    print_table(&records[..PAGE_SIZE]);
    let more = Confirm::new()
        .with_prompt(format!(
            "Show the remaining {} executions?",
            records.len() - PAGE_SIZE
        ))
        .default(false)
        .interact()?;

    let shown = if more {
        print_table(&records[PAGE_SIZE..]);
        records.len()
    } else {
        PAGE_SIZE
    };
    print_count(shown, records.len());
    Ok(())
}

/// Show one execution in detail.
pub async fn show_execution(state: &AppState, id: Uuid, json: bool) -> Result<()> {
    let record = state
        .manager
        .get(id)
        .await
        .with_context(|| format!("failed to load execution {id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Execution").bold(), style(record.id).cyan());
    println!();
    println!("  {:<10} {}", style("Name").dim(), record.name);
    println!(
        "  {:<10} {} ({})",
        style("Started").dim(),
        record.start.format("%Y-%m-%d %H:%M:%S UTC"),
        format_relative_time(&record.start, Utc::now())
    );
    println!("  {:<10} {}", style("Duration").dim(), record.duration);
    println!(
        "  {:<10} {}",
        style("Stage").dim(),
        record.last_step.as_deref().unwrap_or("-")
    );
    println!("  {:<10} {}", style("Status").dim(), styled_status(record.status));
    println!(
        "  {:<10} {}",
        style("Log").dim(),
        state.layout.execution_log_path(record.id).display()
    );
    println!();

    Ok(())
}

/// List executions that have not finished.
pub async fn list_active(state: &AppState, json: bool) -> Result<()> {
    let records = state.manager.active().await?;
    print_records(&records, json, "No active executions.")
}

/// List executions started within the last 24 hours.
pub async fn list_today(state: &AppState, json: bool) -> Result<()> {
    let records = state.manager.today(Utc::now()).await?;
    print_records(&records, json, "No executions in the last 24 hours.")
}

/// Remove every execution at least `hours` old.
pub async fn clear_executions(state: &AppState, hours: u32, force: bool, json: bool) -> Result<()> {
    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete checkpoints, requests and logs of executions older than {hours}h?"
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let removed = state.manager.clear_older_than(hours, Utc::now()).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "hours": hours,
                "removed": removed,
            }))?
        );
        return Ok(());
    }

    println!();
    println!(
        "  {} Removed {} execution{}",
        style("✓").green().bold(),
        style(removed.len()).bold(),
        if removed.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

fn print_records(records: &[StatusRecord], json: bool, empty: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  {} {empty}", style("i").blue().bold());
        println!();
        return Ok(());
    }

    print_table(records);
    print_count(records.len(), records.len());
    Ok(())
}

fn print_empty(message: &str) {
    println!();
    println!(
        "  {} {message} {}",
        style("i").blue().bold(),
        style("pipeworks run").yellow()
    );
    println!();
}

fn print_table(records: &[StatusRecord]) {
    println!();
    println!("{}", build_table(records, Utc::now()));
}

fn print_count(shown: usize, total: usize) {
    println!();
    if shown == total {
        println!(
            "  {} execution{}",
            style(total).bold(),
            if total == 1 { "" } else { "s" }
        );
    } else {
        println!("  {} of {} executions", style(shown).bold(), total);
    }
    println!();
}

fn build_table(records: &[StatusRecord], now: DateTime<Utc>) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Started").fg(Color::White),
        Cell::new("ID").fg(Color::White),
        Cell::new("Name").fg(Color::White),
        Cell::new("Duration").fg(Color::White),
        Cell::new("Stage").fg(Color::White),
        Cell::new("Status").fg(Color::White),
    ]);

    for record in records {
        table.add_row(vec![
            Cell::new(format_relative_time(&record.start, now)).fg(Color::DarkGrey),
            Cell::new(record.id).fg(Color::Cyan),
            Cell::new(&record.name),
            Cell::new(&record.duration),
            Cell::new(record.last_step.as_deref().unwrap_or("-")),
            status_cell(record.status),
        ]);
    }

    table
}

fn status_cell(status: RunStatus) -> Cell {
    match status {
        RunStatus::Running => Cell::new("● running").fg(Color::Yellow),
        RunStatus::Finished => Cell::new("✓ finished").fg(Color::Green),
        RunStatus::Killed => Cell::new("○ killed").fg(Color::DarkGrey),
        RunStatus::FatalError => Cell::new("✗ fatal error").fg(Color::Red),
    }
}

fn styled_status(status: RunStatus) -> String {
    match status {
        RunStatus::Running => style(status).yellow().to_string(),
        RunStatus::Finished => style(status).green().to_string(),
        RunStatus::Killed => style(status).dim().to_string(),
        RunStatus::FatalError => style(status).red().bold().to_string(),
    }
}

fn format_relative_time(dt: &DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}
