//! Demo server: debug one sandbox script over TCP.
//!
//! ```text
//! RUST_LOG=debug rdbg-server demo.sbx --suspended
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rdbg_core::{EngineOptions, SandboxEngine};
use rdbg_server::engine_task::spawn_engine;
use rdbg_server::{Config, RemoteDebugger};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rdbg-server", version, about = "Debug a sandbox script over TCP")]
struct Cli {
    /// Script to run.
    script: PathBuf,

    /// Interface to bind (overrides RDBG_TCP_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides RDBG_TCP_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Pause before the first statement.
    #[arg(long)]
    suspended: bool,

    /// Resume the script when the last client disconnects.
    #[arg(long)]
    continue_when_no_connections: bool,

    /// Added to every reported line number.
    #[arg(long, default_value_t = 0)]
    displacement: i32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.tcp_host = host;
    }
    if let Some(port) = cli.port {
        config.tcp_port = port;
    }

    let source = fs::read_to_string(&cli.script)
        .with_context(|| format!("cannot read {}", cli.script.display()))?;
    let file_name = file_name(&cli.script)?;
    let name = cli
        .script
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("script")
        .to_string();

    let script_dir = cli
        .script
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let loader = move |name: &str| fs::read_to_string(script_dir.join(name)).ok();

    let debugger = Arc::new(RemoteDebugger::with_script_loader(
        config,
        SandboxEngine::hosted_module(),
        Arc::new(loader),
    ));
    let addr = debugger.start().map_err(|e| anyhow!("{e} (code {})", e.code().as_i32()))?;
    info!(%addr, script = %cli.script.display(), "serving");

    let options = EngineOptions::new()
        .suspended(cli.suspended)
        .continue_when_no_connections(cli.continue_when_no_connections)
        .source_code_displacement(cli.displacement);

    let engine = spawn_engine(Arc::clone(&debugger), name, file_name, source, options)?;
    let report = engine
        .join()
        .map_err(|_| anyhow!("engine thread panicked"))??;

    for line in &report.output {
        println!("{line}");
    }
    info!(outcome = ?report.outcome, "engine done");

    debugger.stop()?;
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("script path has no file name: {}", path.display()))
}
