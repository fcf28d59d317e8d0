//! Engine thread of the demo server.
//!
//! Owns one `SandboxEngine` for its whole life: install a session, expose
//! the global object as debuggee, run the script, uninstall.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use rdbg_core::{EngineOptions, RunOutcome, SandboxEngine};
use tracing::{info, warn};

use crate::debugger::RemoteDebugger;

/// What the engine thread produced.
#[derive(Debug)]
pub struct EngineReport {
    pub outcome: RunOutcome,
    pub output: Vec<String>,
}

/// Spawn the engine thread for `source`, installed as context `name`.
pub fn spawn_engine(
    debugger: Arc<RemoteDebugger>,
    name: String,
    file_name: String,
    source: String,
    options: EngineOptions,
) -> Result<JoinHandle<Result<EngineReport>>> {
    thread::Builder::new()
        .name(format!("engine-{name}"))
        .spawn(move || run_engine(&debugger, &name, file_name, &source, options))
        .context("cannot spawn engine thread")
}

/// Body of the engine thread; also usable inline.
pub fn run_engine(
    debugger: &RemoteDebugger,
    name: &str,
    file_name: String,
    source: &str,
    options: EngineOptions,
) -> Result<EngineReport> {
    let mut engine = SandboxEngine::new(file_name, source);

    let session = debugger
        .install(&mut engine, name, options)
        .with_context(|| format!("cannot install debugger for {name}"))?;
    info!(context_id = %session.context_id(), name, "engine session ready");

    let global = engine.global();
    let outcome = debugger
        .add_debuggee(&mut engine, global)
        .context("cannot register global object")
        .and_then(|()| engine.run().context("script failed"));

    // Uninstall even when the run failed.
    if let Err(e) = debugger.uninstall(&mut engine) {
        warn!(name, error = %e, code = e.code().as_i32(), "uninstall failed");
    }

    let outcome = outcome?;
    info!(name, ?outcome, "script finished");
    Ok(EngineReport {
        outcome,
        output: engine.output().to_vec(),
    })
}
