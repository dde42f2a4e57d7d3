use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const MAX_COMMANDS: usize = 15;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_ARGUMENT_LEN: usize = 1024;

/// Status returned synchronously to the remote caller.
///
/// Zero or positive means the request was accepted, which says nothing about the
/// outcome of any work it started. Negative values are rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandResult(pub i32);

impl CommandResult {
    pub const ACCEPTED: Self = Self(0);
    pub const NOT_FOUND: Self = Self(-1);
    pub const MALFORMED_ARGUMENT: Self = Self(-2);
    pub const NOT_READY: Self = Self(-3);

    pub fn is_accepted(self) -> bool {
        self.0 >= 0
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl From<CommandResult> for i32 {
    fn from(result: CommandResult) -> Self {
        result.0
    }
}

impl core::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            CommandResult::ACCEPTED => write!(f, "accepted"),
            CommandResult::NOT_FOUND => write!(f, "not found"),
            CommandResult::MALFORMED_ARGUMENT => write!(f, "malformed argument"),
            CommandResult::NOT_READY => write!(f, "not ready"),
            CommandResult(code) => write!(f, "status {}", code),
        }
    }
}

/// One remote call as delivered by the connectivity stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub name: String,
    #[serde(default)]
    pub argument: String,
}

impl CommandInvocation {
    pub fn new(name: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument: argument.into(),
        }
    }
}

pub type CommandHandler = Arc<dyn Fn(&str) -> CommandResult + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("command `{0}` is already registered")]
    Duplicate(String),
    #[error("command table full ({MAX_COMMANDS} entries)")]
    TableFull,
    #[error("command name is {0} bytes, limit is {MAX_NAME_LEN}")]
    NameTooLong(usize),
    #[error("command name is empty")]
    EmptyName,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub registered: u8,
    pub invoked: u32,
    pub accepted: u32,
    pub rejected: u32,
    pub not_found: u32,
}

struct CommandEntry {
    name: ArrayString<MAX_NAME_LEN>,
    handler: CommandHandler,
}

/// Name → handler table shared between the orchestrator and the connectivity stack.
///
/// Entries are fully built before they are inserted under the write lock, so a
/// concurrent lookup sees either the whole entry or nothing.
pub struct CommandDispatcher {
    table: RwLock<Vec<CommandEntry, MAX_COMMANDS>>,
    invoked: AtomicU32,
    accepted: AtomicU32,
    rejected: AtomicU32,
    not_found: AtomicU32,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Vec::new()),
            invoked: AtomicU32::new(0),
            accepted: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
            not_found: AtomicU32::new(0),
        }
    }

    pub fn register<F>(&self, name: &str, handler: F) -> Result<(), DispatchError>
    where
        F: Fn(&str) -> CommandResult + Send + Sync + 'static,
    {
        self.register_shared(name, Arc::new(handler))
    }

    pub fn register_shared(&self, name: &str, handler: CommandHandler) -> Result<(), DispatchError> {
        if name.is_empty() {
            return Err(DispatchError::EmptyName);
        }
        let name_buf = ArrayString::<MAX_NAME_LEN>::from(name)
            .map_err(|_| DispatchError::NameTooLong(name.len()))?;

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.iter().any(|entry| entry.name.as_str() == name) {
            return Err(DispatchError::Duplicate(name.to_string()));
        }
        table
            .push(CommandEntry {
                name: name_buf,
                handler,
            })
            .map_err(|_| DispatchError::TableFull)?;

        debug!(target: "app.cmd", "registered command `{}` ({}/{})", name, table.len(), MAX_COMMANDS);
        Ok(())
    }

    /// Look up `name` and run its handler on the calling context.
    pub fn invoke(&self, name: &str, argument: &str) -> CommandResult {
        self.invoked.fetch_add(1, Ordering::Relaxed);

        // Clone the handler out so the table lock is not held while it runs.
        let handler = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table
                .iter()
                .find(|entry| entry.name.as_str() == name)
                .map(|entry| Arc::clone(&entry.handler))
        };

        let Some(handler) = handler else {
            self.not_found.fetch_add(1, Ordering::Relaxed);
            warn!(target: "app.cmd", "unknown command `{}`", name);
            return CommandResult::NOT_FOUND;
        };

        if argument.len() > MAX_ARGUMENT_LEN {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "app.cmd",
                "command `{}` argument is {} bytes, limit is {}",
                name,
                argument.len(),
                MAX_ARGUMENT_LEN
            );
            return CommandResult::MALFORMED_ARGUMENT;
        }

        trace!(target: "app.cmd", "invoking `{}` arg={:?}", name, argument);
        let result = handler(argument);
        if result.is_accepted() {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        debug!(target: "app.cmd", "command `{}` -> {}", name, result.code());
        result
    }

    pub fn invoke_request(&self, invocation: &CommandInvocation) -> CommandResult {
        self.invoke(&invocation.name, &invocation.argument)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.iter().any(|entry| entry.name.as_str() == name)
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn command_names(&self) -> std::vec::Vec<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.iter().map(|entry| entry.name.to_string()).collect()
    }

    pub fn get_stats(&self) -> DispatcherStats {
        DispatcherStats {
            registered: self.len() as u8,
            invoked: self.invoked.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("commands", &self.command_names())
            .field("stats", &self.get_stats())
            .finish()
    }
}
