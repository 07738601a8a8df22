/// Terminal front end: prints the roster and forwards user commands to the engine
use crate::engine::SyncHandle;
use crate::presence::{PresenceRow, PresenceSnapshot};
use crate::selection::SelectOutcome;
use crate::types::LoadStatus;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Commands accepted on stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Select(String),
    Deselect,
    Refresh,
    Peers,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<CliCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(None);
    };

    let parsed = match command {
        "select" | "open" => {
            let peer = parts
                .next()
                .ok_or_else(|| "Usage: select <peer_id>".to_string())?;
            CliCommand::Select(peer.to_string())
        }
        "deselect" | "close" => CliCommand::Deselect,
        "refresh" => CliCommand::Refresh,
        "peers" | "ls" => CliCommand::Peers,
        "help" | "?" => CliCommand::Help,
        "quit" | "exit" | "q" => CliCommand::Quit,
        other => return Err(format!("Unknown command: {}", other)),
    };
    Ok(Some(parsed))
}

/// Uncolored row text: `<marker> <label> [<badge>]`
pub fn row_text(row: &PresenceRow) -> String {
    let marker = if row.is_selected { ">" } else { " " };
    match row.badge() {
        Some(badge) => format!("{} {} ({})", marker, row.label(), badge),
        None => format!("{} {}", marker, row.label()),
    }
}

fn print_roster(snapshot: &PresenceSnapshot) {
    let status = match &snapshot.status {
        LoadStatus::NotStarted => snapshot.status.label().dimmed(),
        LoadStatus::Loading => snapshot.status.label().yellow(),
        LoadStatus::Loaded => snapshot.status.label().green(),
        LoadStatus::Failed(reason) => format!("Failed: {}", reason).red(),
    };

    println!();
    println!("{} [{}]", "Chats".bright_cyan().bold(), status);
    println!("{}", "─".repeat(40).dimmed());
    if snapshot.rows.is_empty() {
        println!("  {}", "No conversations".yellow());
    }
    for row in &snapshot.rows {
        let text = row_text(row);
        let line = if row.is_selected {
            text.bright_white().bold()
        } else if row.unseen > 0 {
            text.bright_red().bold()
        } else if row.display_name.is_none() {
            text.dimmed()
        } else {
            text.normal()
        };
        println!("{}", line);
    }
}

fn print_usage() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <peer_id>   Open a conversation", "select".cyan());
    println!("  {}           Close the open conversation", "deselect".cyan());
    println!("  {}            Reload the roster", "refresh".cyan());
    println!("  {}              Print the roster", "peers".cyan());
    println!("  {}               Exit", "quit".cyan());
}

/// Run until stdin closes or `quit` is entered
pub async fn run(handle: SyncHandle) -> anyhow::Result<()> {
    println!("{}", "⚡ Ripple".bright_cyan().bold());
    print_usage();

    let mut view = handle.watch();
    let printer = tokio::spawn(async move {
        print_roster(&view.borrow_and_update().clone());
        while view.changed().await.is_ok() {
            let snapshot = view.borrow_and_update().clone();
            print_roster(&snapshot);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{} {}", "✗".red().bold(), e.red());
                continue;
            }
        };

        match command {
            CliCommand::Select(peer) => match handle.select(peer.as_str()).await {
                Ok(SelectOutcome::Unchanged) => {
                    println!("{} {} is already open", "•".dimmed(), peer.cyan())
                }
                Ok(SelectOutcome::Selected { .. }) => {}
                Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
            },
            CliCommand::Deselect => {
                handle.deselect().await?;
            }
            CliCommand::Refresh => handle.refresh().await?,
            CliCommand::Peers => print_roster(&handle.snapshot()),
            CliCommand::Help => print_usage(),
            CliCommand::Quit => break,
        }
    }

    handle.shutdown().await.ok();
    printer.abort();
    Ok(())
}
