// crates/rdbg-client/src/main.rs

mod network;
mod repl;
mod types;

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use rdbg_core::ContextId;
use rdbg_protocol::Frame;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::network::{DebuggerConnection, ServerEvent};
use crate::repl::{ReplCommand, HELP};
use crate::types::ClientConfig;

#[derive(Parser)]
#[command(name = "rdbg")]
#[command(about = "Command-line client for the remote script debugger")]
struct Cli {
    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Context to talk to at startup
    #[arg(short, long)]
    context: Option<i32>,

    /// TOML file with host, port and default_context
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if cli.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.context.is_some() {
        config.default_context = cli.context;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let connection = DebuggerConnection::connect(&config.server_addr(), event_tx).await?;
    let network = tokio::spawn(connection.run(frame_rx));

    println!("Connected to {}. Type `help` for commands.", config.server_addr());
    let mut current = config.default_context.map(ContextId);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    prompt(current)?;

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(ServerEvent::Frame(frame)) => {
                    print_frame(&frame);
                    prompt(current)?;
                }
                Some(ServerEvent::Closed) | None => {
                    println!("\nConnection closed.");
                    break;
                }
            },

            line = stdin.next_line() => {
                let Some(line) = line? else {
                    println!("\nEOF on stdin, exiting client.");
                    let _ = frame_tx.send(repl::exit_frame());
                    break;
                };
                match repl::parse(&line, current) {
                    Ok(ReplCommand::Send(frame)) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(ReplCommand::Use(context)) => {
                        info!(context_id = %context, "context selected");
                        current = Some(context);
                        prompt(current)?;
                    }
                    Ok(ReplCommand::Help) => {
                        println!("{HELP}");
                        prompt(current)?;
                    }
                    Ok(ReplCommand::Quit) => {
                        let _ = frame_tx.send(repl::exit_frame());
                        println!("Exiting client.");
                        break;
                    }
                    Ok(ReplCommand::Nothing) => prompt(current)?,
                    Err(e) => {
                        eprintln!("{e}");
                        prompt(current)?;
                    }
                }
            }
        }
    }

    // Let the exit line go out before the socket is dropped.
    drop(frame_tx);
    if let Err(e) = network.await {
        debug!("network task ended abnormally: {}", e);
    }
    Ok(())
}

fn prompt(current: Option<ContextId>) -> std::io::Result<()> {
    match current {
        Some(context) => print!("rdbg[{context}]> "),
        None => print!("rdbg> "),
    }
    std::io::stdout().flush()
}

fn print_frame(frame: &Frame) {
    let stamp = Local::now().format("%H:%M:%S%.3f");
    let body = match serde_json::from_str::<Value>(&frame.payload) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| frame.payload.clone()),
        Err(_) => frame.payload.clone(),
    };
    if frame.context_id.is_none() {
        println!("\r[{stamp}] server\n{body}");
    } else {
        println!("\r[{stamp}] context {}\n{body}", frame.context_id);
    }
}
