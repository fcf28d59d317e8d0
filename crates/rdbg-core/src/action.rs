//! Units of debugger work executed on a session's engine thread.

use tracing::debug;

use crate::binding::EngineBinding;
use crate::command::Command;
use crate::session::EngineSession;
use crate::types::ClientId;

/// What the hosted debugger wants the command loop to do next.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebuggerStateHint {
    /// Stop blocking, let the script run.
    Continue = 1,
    /// Keep the current state (stay paused if paused).
    Ignore = 2,
    /// Unwind the command loop entirely.
    Interrupted = 3,
}

impl DebuggerStateHint {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(DebuggerStateHint::Continue),
            2 => Some(DebuggerStateHint::Ignore),
            3 => Some(DebuggerStateHint::Interrupted),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Ok,
    Failed,
}

/// Result of executing one [`Action`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub outcome: ActionOutcome,
    pub hint: DebuggerStateHint,
}

impl ActionResult {
    pub fn ok(hint: DebuggerStateHint) -> Self {
        Self {
            outcome: ActionOutcome::Ok,
            hint,
        }
    }

    pub fn failed() -> Self {
        Self {
            outcome: ActionOutcome::Failed,
            hint: DebuggerStateHint::Ignore,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == ActionOutcome::Ok
    }
}

/// Work queued for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver one client command to the hosted debugger.
    Command(Command),
    /// Force a resume (no clients left to do it).
    Continue,
}

impl Action {
    /// Client that caused this action, if any.
    pub fn origin(&self) -> Option<ClientId> {
        match self {
            Action::Command(command) => Some(command.client_id),
            Action::Continue => None,
        }
    }

    /// Run the action. Must be called on the session's engine thread.
    pub fn execute(self, session: &EngineSession, engine: &mut dyn EngineBinding) -> ActionResult {
        match self {
            Action::Command(command) => {
                match session
                    .hosted()
                    .send_command(engine, command.client_id, &command.payload)
                {
                    Ok(hint) => ActionResult::ok(hint),
                    Err(err) => {
                        debug!(
                            context_id = %session.context_id(),
                            client_id = %command.client_id,
                            error = %err,
                            "command action failed"
                        );
                        ActionResult::failed()
                    }
                }
            }
            Action::Continue => ActionResult::ok(DebuggerStateHint::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_codes() {
        assert_eq!(DebuggerStateHint::from_i64(1), Some(DebuggerStateHint::Continue));
        assert_eq!(DebuggerStateHint::from_i64(2), Some(DebuggerStateHint::Ignore));
        assert_eq!(DebuggerStateHint::from_i64(3), Some(DebuggerStateHint::Interrupted));
        assert_eq!(DebuggerStateHint::from_i64(0), None);
    }

    #[test]
    fn origin_of_actions() {
        let cmd = Command::control(ClientId(4), "{}");
        assert_eq!(Action::Command(cmd).origin(), Some(ClientId(4)));
        assert_eq!(Action::Continue.origin(), None);
    }
}
