//! Public types consumed by callers of the session API.
//!
//! Callers construct a [`SessionConfig`], receive a `Session`, and match on
//! [`SessionError`] to decide whether a failure is fatal (installation,
//! launch, handshake, process death) or recoverable (`NotReady`).

use std::path::{Path, PathBuf};

/// How the `fortls` child process is invoked.
///
/// Resolved once per session by the installer and immutable afterward; the
/// transport is its only consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    command: PathBuf,
    args: Vec<String>,
}

impl Invocation {
    #[must_use]
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Bare executable with no arguments.
    #[must_use]
    pub fn bare(command: impl Into<PathBuf>) -> Self {
        Self::new(command, Vec::new())
    }

    #[must_use]
    pub fn command(&self) -> &Path {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// What a query issued before readiness should do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotReadyPolicy {
    /// Block until the readiness wait resolves (marker or timeout fallback).
    #[default]
    Wait,
    /// Fail fast with [`SessionError::NotReady`]; the caller may retry.
    Fail,
}

/// Session configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Behaviour of queries issued before the readiness wait has resolved.
    pub not_ready: NotReadyPolicy,
}

/// Server capabilities captured once from the initialize response.
///
/// Absence of a capability degrades functionality but is never an error.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    raw: serde_json::Value,
}

impl Capabilities {
    #[must_use]
    pub(crate) fn from_initialize_result(result: &serde_json::Value) -> Self {
        Self {
            raw: result.get("capabilities").cloned().unwrap_or_default(),
        }
    }

    fn has(&self, key: &str) -> bool {
        match self.raw.get(key) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(_) => true,
        }
    }

    #[must_use]
    pub fn text_document_sync(&self) -> bool {
        self.has("textDocumentSync")
    }

    #[must_use]
    pub fn document_symbols(&self) -> bool {
        self.has("documentSymbolProvider")
    }

    #[must_use]
    pub fn workspace_symbols(&self) -> bool {
        self.has("workspaceSymbolProvider")
    }

    #[must_use]
    pub fn hover(&self) -> bool {
        self.has("hoverProvider")
    }

    #[must_use]
    pub fn definition(&self) -> bool {
        self.has("definitionProvider")
    }

    #[must_use]
    pub fn references(&self) -> bool {
        self.has("referencesProvider")
    }

    #[must_use]
    pub fn completion(&self) -> bool {
        self.has("completionProvider")
    }
}

/// The `fortls` executable could not be located or installed.
///
/// Carries the last underlying cause observed across the resolution chain.
#[derive(Debug, thiserror::Error)]
#[error("unable to locate or install fortls: {last_cause}")]
pub struct InstallError {
    pub(crate) last_cause: String,
}

impl InstallError {
    #[must_use]
    pub fn last_cause(&self) -> &str {
        &self.last_cause
    }
}

/// Error taxonomy for the session lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The server binary is unobtainable. The session never starts.
    #[error("fortls is not available")]
    Installation(#[from] InstallError),

    /// A resolved binary could not be launched (deleted after resolution,
    /// not executable). The session never starts.
    #[error("failed to launch the fortls process")]
    Launch(#[source] anyhow::Error),

    /// The initialize exchange failed or the server exited before replying.
    /// The session never starts.
    #[error("initialize handshake with fortls failed")]
    Handshake(#[source] anyhow::Error),

    /// A query was issued before readiness under [`NotReadyPolicy::Fail`].
    /// Recoverable: the caller may retry after awaiting readiness.
    #[error("fortls is still analyzing the workspace")]
    NotReady,

    /// The server process died mid-session. Fatal for this session.
    #[error("fortls exited unexpectedly")]
    ProcessExited,

    /// A request failed for a reason other than process death
    /// (serialization, response timeout).
    #[error("request to fortls failed")]
    Transport(#[source] anyhow::Error),
}
