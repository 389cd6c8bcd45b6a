//! Interactive shell.
//!
//! Each `upload`/`download` runs as its own task with its own connection,
//! so several transfers can be in flight while the prompt stays usable.

use crate::progress::{TransferProgress, format_bytes};
use console::style;
use filemove_core::Client;
use filemove_transport::Dialer;
use indicatif::MultiProgress;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

/// A parsed shell line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Upload a local file
    Upload(PathBuf),
    /// Download a stored file
    Download(String),
    /// Show the command list
    Help,
    /// Leave the shell
    Exit,
    /// Blank line
    Empty,
}

/// Parse one input line
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, arg) = match line.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (line, ""),
    };

    match verb.to_ascii_lowercase().as_str() {
        "" => Ok(Command::Empty),
        "upload" | "up" if !arg.is_empty() => Ok(Command::Upload(PathBuf::from(arg))),
        "download" | "down" if !arg.is_empty() => Ok(Command::Download(arg.to_string())),
        "upload" | "up" => Err("usage: upload <file>".to_string()),
        "download" | "down" => Err("usage: download <name>".to_string()),
        "help" | "?" => Ok(Command::Help),
        "exit" | "quit" => Ok(Command::Exit),
        other => Err(format!("unknown command '{other}' (try 'help')")),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  upload <file>     Send a local file to the server");
    println!("  download <name>   Fetch one of your stored files");
    println!("  help              Show this list");
    println!("  exit              Wait for running transfers and leave");
}

fn prompt(username: &str) {
    print!("{}> ", style(username).cyan());
    let _ = std::io::stdout().flush();
}

/// Run the shell until `exit`, end of input or Ctrl+C
pub async fn run<D>(client: Arc<Client<D>>) -> anyhow::Result<()>
where
    D: Dialer + 'static,
{
    let username = client.identity().to_string();
    let multi = MultiProgress::new();
    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_help();
    prompt(&username);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined {
                    tracing::warn!("Transfer task failed: {}", e);
                }
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Interrupted, cancelling transfers");
                client.shutdown();
                break;
            }
        };

        let Some(line) = line else {
            println!();
            break;
        };

        match parse_command(&line) {
            Ok(Command::Upload(path)) => {
                let client = Arc::clone(&client);
                let progress = TransferProgress::in_multi(&multi);
                tasks.spawn(async move {
                    match client.upload_with_progress(&path, &progress).await {
                        Ok(report) => progress.finish_with_message(format!(
                            "{} uploaded {} ({})",
                            style("✓").green(),
                            report.name,
                            format_bytes(report.size)
                        )),
                        Err(e) => progress.abandon_with_message(format!(
                            "{} upload of {} failed: {}",
                            style("✗").red(),
                            path.display(),
                            e
                        )),
                    }
                });
            }
            Ok(Command::Download(name)) => {
                let client = Arc::clone(&client);
                let progress = TransferProgress::in_multi(&multi);
                tasks.spawn(async move {
                    match client.download_with_progress(&name, &progress).await {
                        Ok(report) => progress.finish_with_message(format!(
                            "{} downloaded {} to {}",
                            style("✓").green(),
                            report.name,
                            report.path.display()
                        )),
                        Err(e) => progress.abandon_with_message(format!(
                            "{} download of {} failed: {}",
                            style("✗").red(),
                            name,
                            e
                        )),
                    }
                });
            }
            Ok(Command::Help) => print_help(),
            Ok(Command::Exit) => break,
            Ok(Command::Empty) => {}
            Err(msg) => eprintln!("{msg}"),
        }

        prompt(&username);
    }

    if !tasks.is_empty() {
        println!("Waiting for {} transfer(s) to finish...", tasks.len());
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!("Transfer task failed: {}", e);
        }
    }

    Ok(())
}
