// crates/rdbg-core/tests/session_scenarios.rs
//
// End-to-end scenarios across registry, sessions and the sandbox engine.
// Engines run on their own threads, the test thread plays the I/O side.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rdbg_core::{
    Client, ClientId, ClientManager, Command, ContextId, DebuggerError, DebuggerEvents,
    EngineBinding, EngineOptions, EngineSession, ErrorCode, FailurePoint, LocalDebugger,
    LocalDebuggerHandler, RegistrySettings, RunOutcome, SandboxEngine, SessionRegistry, SharedLoader,
};
use serde_json::{json, Value};

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

struct Harness {
    registry: Arc<SessionRegistry>,
    clients: Arc<ClientManager>,
}

impl Harness {
    fn new() -> Self {
        let clients = Arc::new(ClientManager::new(16));
        let registry = SessionRegistry::new(
            Arc::clone(&clients),
            RegistrySettings::default(),
            SharedLoader::none(),
        );
        Self { registry, clients }
    }

    fn connect(&self, id: i32) -> ClientId {
        let id = self.clients.add_client(Client::new(ClientId(id), 256)).unwrap();
        // Discard the contexts list sent on connect.
        self.drain(id);
        id
    }

    fn drain(&self, id: ClientId) -> Vec<Value> {
        let client = self.clients.get_client(id).unwrap();
        let mut out = Vec::new();
        while let Some(cmd) = client.out_queue().get() {
            out.push(serde_json::from_str(&cmd.payload).unwrap());
        }
        out
    }

    /// Install `source` into a fresh sandbox with a registered debuggee.
    fn install(&self, name: &str, source: &str, options: EngineOptions) -> (Arc<EngineSession>, SandboxEngine) {
        let mut engine = SandboxEngine::new(format!("{name}.sbx"), source);
        let session = self
            .registry
            .install(&mut engine, name, options, &SandboxEngine::hosted_module())
            .unwrap();
        let global = engine.global();
        self.registry.add_debuggee(&mut engine, global).unwrap();
        (session, engine)
    }

    fn send(&self, client: ClientId, context: ContextId, command: Value) {
        self.registry
            .route(Command::new(client, context, command.to_string()));
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn spawn_run(mut engine: SandboxEngine) -> thread::JoinHandle<(RunOutcome, SandboxEngine)> {
    thread::spawn(move || {
        let outcome = engine.run().unwrap();
        (outcome, engine)
    })
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[test]
fn suspended_script_resumes_on_client_continue() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, engine) = harness.install(
        "main",
        "print one\nprint two",
        EngineOptions::new().suspended(true),
    );

    let runner = spawn_run(engine);
    wait_until("initial pause", || session.is_paused());

    let events = harness.drain(client);
    assert_eq!(events[0]["event"], "paused");
    assert_eq!(events[0]["reason"], "suspended");
    assert_eq!(events[0]["line"], 1);

    harness.send(client, session.context_id(), json!({"command": "continue"}));
    let (outcome, engine) = runner.join().unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(engine.output(), ["one", "two"]);
    assert!(!session.is_paused());
}

#[test]
fn step_pauses_again_on_next_line() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, engine) = harness.install(
        "stepper",
        "print a\nprint b\nprint c",
        EngineOptions::new().suspended(true).source_code_displacement(10),
    );

    let runner = spawn_run(engine);
    wait_until("initial pause", || session.is_paused());
    harness.drain(client);

    harness.send(client, session.context_id(), json!({"command": "step"}));
    wait_until("step pause", || {
        harness
            .drain(client)
            .iter()
            .any(|e| e["event"] == "paused" && e["reason"] == "step" && e["line"] == 12)
    });

    harness.send(client, session.context_id(), json!({"command": "where"}));
    wait_until("where reply", || {
        harness
            .drain(client)
            .iter()
            .any(|e| e["command"] == "where" && e["line"] == 12)
    });

    harness.send(client, session.context_id(), json!({"command": "continue"}));
    let (outcome, engine) = runner.join().unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(engine.output(), ["a", "b", "c"]);
}

#[test]
fn paused_context_auto_continues_when_last_client_leaves() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, engine) = harness.install(
        "auto",
        "print before\ndebugger\nprint after",
        EngineOptions::new().continue_when_no_connections(true),
    );

    let runner = spawn_run(engine);
    wait_until("debugger statement pause", || session.is_paused());

    harness.clients.remove_client(client);
    let (outcome, engine) = runner.join().unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(engine.output(), ["before", "after"]);
}

#[test]
fn last_client_leaving_as_pause_begins_never_strands_the_engine() {
    for round in 0..200 {
        let harness = Harness::new();
        let client = harness.connect(1);
        let (session, mut engine) = harness.install(
            "edge",
            "print x",
            EngineOptions::new().continue_when_no_connections(true),
        );

        let start = Arc::new(Barrier::new(2));
        let waiter = {
            let session = Arc::clone(&session);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                session.wait_for_command(&mut engine, false)
            })
        };

        start.wait();
        harness.clients.remove_client(client);
        wait_until(&format!("pause to end in round {round}"), || waiter.is_finished());
        assert!(waiter.join().unwrap());
        assert!(!session.is_paused());
    }
}

#[test]
fn congested_queue_warns_before_action_runs() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, _engine) = harness.install("stuck", "print x", EngineOptions::new());

    for _ in 0..3 {
        harness.send(client, session.context_id(), json!({"command": "where"}));
    }

    let replies = harness.drain(client);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["type"], "warn");
    assert_eq!(replies[0]["code"], 1);
    assert_eq!(session.pending_actions(), 3);
}

#[test]
fn queued_command_is_drained_while_script_runs() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, mut engine) = harness.install("busy", "print a\nprint b", EngineOptions::new());

    harness.send(client, session.context_id(), json!({"command": "where"}));
    assert_eq!(session.pending_actions(), 1);

    assert_eq!(engine.run().unwrap(), RunOutcome::Completed);
    assert_eq!(session.pending_actions(), 0);

    let replies = harness.drain(client);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["command"], "where");
    assert_eq!(replies[0]["line"], 1);
}

#[test]
fn handle_pending_commands_without_running() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, mut engine) = harness.install("manual", "print a", EngineOptions::new());

    harness.send(client, session.context_id(), json!({"command": "output"}));
    harness.registry.handle_pending_commands(&mut engine).unwrap();

    let replies = harness.drain(client);
    assert_eq!(replies[0]["command"], "output");
    assert_eq!(replies[0]["lines"], json!([]));
}

#[test]
fn interrupt_unwinds_a_stuck_pause() {
    let harness = Harness::new();
    let _client = harness.connect(1);
    let (session, engine) = harness.install(
        "frozen",
        "debugger\nprint never",
        EngineOptions::new(),
    );

    let runner = spawn_run(engine);
    wait_until("pause", || session.is_paused());

    harness.registry.interrupt(None);
    let (outcome, engine) = runner.join().unwrap();
    assert_eq!(outcome, RunOutcome::Aborted);
    assert!(engine.output().is_empty());
    assert!(session.is_interrupted());
}

#[test]
fn abort_command_unwinds_command_loop() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, engine) = harness.install(
        "abort",
        "debugger\nprint never",
        EngineOptions::new(),
    );

    let runner = spawn_run(engine);
    wait_until("pause", || session.is_paused());
    harness.send(client, session.context_id(), json!({"command": "abort"}));

    let (outcome, _engine) = runner.join().unwrap();
    assert_eq!(outcome, RunOutcome::Aborted);
    assert!(!session.is_interrupted());
}

#[test]
fn failed_command_does_not_stop_the_pause() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (session, engine) = harness.install(
        "resilient",
        "debugger\nprint done",
        EngineOptions::new(),
    );

    let runner = spawn_run(engine);
    wait_until("pause", || session.is_paused());
    harness.drain(client);

    harness.send(client, session.context_id(), json!({"command": "fly"}));
    wait_until("error reply", || {
        harness
            .drain(client)
            .iter()
            .any(|e| e["type"] == "error" && e["code"] == 1)
    });
    assert!(session.is_paused());

    harness.send(client, session.context_id(), json!({"command": "continue"}));
    let (outcome, engine) = runner.join().unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(engine.output(), ["done"]);
}

#[test]
fn two_engines_are_debugged_independently() {
    let harness = Harness::new();
    let client = harness.connect(1);
    let (first, first_engine) = harness.install("first", "debugger\nprint 1", EngineOptions::new());
    let (second, second_engine) = harness.install("second", "debugger\nprint 2", EngineOptions::new());

    let first_run = spawn_run(first_engine);
    let second_run = spawn_run(second_engine);
    wait_until("both paused", || first.is_paused() && second.is_paused());

    harness.send(client, second.context_id(), json!({"command": "continue"}));
    let (_, second_engine) = second_run.join().unwrap();
    assert_eq!(second_engine.output(), ["2"]);
    assert!(first.is_paused());

    harness.send(client, first.context_id(), json!({"command": "continue"}));
    let (_, first_engine) = first_run.join().unwrap();
    assert_eq!(first_engine.output(), ["1"]);
}

#[test]
fn install_failures_map_to_distinct_codes() {
    let cases = [
        (FailurePoint::CreateScope, ErrorCode::CannotCreateScope),
        (FailurePoint::StandardLibrary, ErrorCode::CannotInitStandardLibrary),
        (FailurePoint::DefineFunction, ErrorCode::CannotDefineFunction),
        (FailurePoint::Evaluate, ErrorCode::CannotEvaluateModule),
    ];
    for (point, code) in cases {
        let harness = Harness::new();
        let mut engine = SandboxEngine::new("broken.sbx", "").fail_at(point);
        let err = harness
            .registry
            .install(&mut engine, "broken", EngineOptions::new(), &SandboxEngine::hosted_module())
            .unwrap_err();
        assert_eq!(err.code(), code, "{point:?}");
        assert_eq!(engine.scope_count(), 0);
        assert_eq!(engine.context_tag(), None);
        assert!(harness.registry.is_empty());
    }
}

#[test]
fn failing_shutdown_still_uninstalls() {
    let harness = Harness::new();
    let mut engine = SandboxEngine::new("late.sbx", "").fail_at(FailurePoint::Shutdown);
    harness
        .registry
        .install(&mut engine, "late", EngineOptions::new(), &SandboxEngine::hosted_module())
        .unwrap();

    let err = harness.registry.uninstall(&mut engine).unwrap_err();
    assert!(matches!(err, DebuggerError::ShutdownFailed(_)));
    assert_eq!(engine.context_tag(), None);
    assert_eq!(engine.scope_count(), 0);
    assert!(harness.registry.is_empty());
}

// ----------------------------------------------------------------------
// Local debugger
// ----------------------------------------------------------------------

#[derive(Default)]
struct Recording {
    payloads: Mutex<Vec<Value>>,
    pauses: Mutex<Vec<bool>>,
}

impl LocalDebuggerHandler for Recording {
    fn handle_command(&self, payload: &str) -> bool {
        self.payloads
            .lock()
            .unwrap()
            .push(serde_json::from_str(payload).unwrap());
        true
    }

    fn handle_pause(&self, _engine: &mut dyn EngineBinding, suspended: bool) -> bool {
        self.pauses.lock().unwrap().push(suspended);
        true
    }

    fn load_script(&self, name: &str) -> Option<String> {
        (name == "lib.sbx").then(|| "print from lib".to_string())
    }
}

#[test]
fn local_debugger_round_trip() {
    let handler = Arc::new(Recording::default());
    let debugger = LocalDebugger::new(EngineOptions::new().suspended(true), handler.clone());
    let mut engine = SandboxEngine::new("local.sbx", "print a\ndebugger\nprint b");

    debugger
        .install(&mut engine, &SandboxEngine::hosted_module())
        .unwrap();
    assert_eq!(engine.context_tag(), Some(ContextId::NONE));
    let global = engine.global();
    debugger.add_debuggee(&mut engine, global).unwrap();

    assert_eq!(engine.run().unwrap(), RunOutcome::Completed);
    assert_eq!(*handler.pauses.lock().unwrap(), vec![true, false]);
    assert_eq!(engine.output(), ["a", "b"]);

    debugger
        .send_command(&mut engine, r#"{"command":"source","file":"lib.sbx"}"#)
        .unwrap();
    let payloads = handler.payloads.lock().unwrap().clone();
    let reply = payloads.last().unwrap();
    assert_eq!(reply["command"], "source");
    assert_eq!(reply["source"], "print from lib");

    debugger.remove_debuggee(&mut engine, global).unwrap();
    debugger.uninstall(&mut engine).unwrap();
    assert!(!debugger.is_installed());
}
