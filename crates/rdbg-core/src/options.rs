//! Per-session options, the hosted module source, and the script loader.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

/// Options for one debugger session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineOptions {
    /// Pause immediately after install.
    pub suspended: bool,

    /// Never block on a pause while no client is connected.
    pub continue_when_no_connections: bool,

    /// Line offset applied when reporting source locations.
    pub source_code_displacement: i32,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn continue_when_no_connections(mut self, enabled: bool) -> Self {
        self.continue_when_no_connections = enabled;
        self
    }

    pub fn source_code_displacement(mut self, displacement: i32) -> Self {
        self.source_code_displacement = displacement;
        self
    }

    /// The `options` object exposed to the hosted module.
    pub fn to_script_value(&self) -> Value {
        json!({
            "suspended": self.suspended,
            "sourceDisplacement": self.source_code_displacement,
        })
    }
}

/// Source of the debugger module evaluated inside every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedModule {
    pub file_name: String,
    pub source: String,
}

impl HostedModule {
    pub fn new(file_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            source: source.into(),
        }
    }
}

/// Embedder hook that supplies script sources by name.
pub trait ScriptLoader: Send + Sync {
    /// Source text for `name`, or `None` if unknown.
    fn load(&self, name: &str) -> Option<String>;
}

impl<F> ScriptLoader for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn load(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Optional shared loader.
#[derive(Clone, Default)]
pub struct SharedLoader(Option<Arc<dyn ScriptLoader>>);

impl SharedLoader {
    pub fn new(loader: Arc<dyn ScriptLoader>) -> Self {
        Self(Some(loader))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn load(&self, name: &str) -> Option<String> {
        self.0.as_ref().and_then(|loader| loader.load(name))
    }
}

impl fmt::Debug for SharedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedLoader")
            .field(&self.0.as_ref().map(|_| "<loader>"))
            .finish()
    }
}
