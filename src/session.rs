//! Session facade — resolve, launch, handshake, await readiness, query.
//!
//! [`Session::start`] composes the full lifecycle in strict order: binary
//! resolution, process launch, notification handler registration, the
//! initialize handshake, and the bounded readiness wait. Any stage failure
//! aborts the sequence with a tagged [`SessionError`]; later stages are
//! never attempted. Queries are gated on readiness according to
//! [`NotReadyPolicy`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::install::{self, SystemToolchain, Toolchain};
use crate::protocol;
use crate::ready::{READY_TIMEOUT, ReadinessFlags, ReadinessState};
use crate::transport::{NotificationRouter, ServerTransport};
use crate::types::{Capabilities, InstallError, NotReadyPolicy, SessionConfig, SessionError};

/// Directories fortls gains nothing from analyzing: VCS metadata and
/// Fortran build artifact trees.
#[must_use]
pub fn is_ignored_dirname(name: &str) -> bool {
    matches!(name, ".git" | ".hg" | ".svn" | "build" | "dist" | "CMakeFiles")
}

/// One live fortls session for one project root.
///
/// Owns the process, channel, router, and readiness flags exclusively; a
/// new session for the same project creates an entirely fresh set.
pub struct Session {
    transport: ServerTransport,
    router: Arc<NotificationRouter>,
    flags: Arc<ReadinessFlags>,
    capabilities: Capabilities,
    project_root: PathBuf,
    policy: NotReadyPolicy,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("project_root", &self.project_root)
            .field("capabilities", &self.capabilities)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Resolve (or install) fortls, launch it against `project_root`, and
    /// run the session through handshake and readiness.
    pub async fn start(
        project_root: impl Into<PathBuf>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        Self::start_with_toolchain(SystemToolchain, project_root, config).await
    }

    /// [`Session::start`] against an explicit [`Toolchain`].
    pub async fn start_with_toolchain<T>(
        toolchain: T,
        project_root: impl Into<PathBuf>,
        config: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        T: Toolchain + Send + 'static,
    {
        let project_root = project_root.into();
        let project_root = std::fs::canonicalize(&project_root).unwrap_or(project_root);

        // Resolution walks the PATH, probes the interpreter, and may run
        // pip for seconds; none of that belongs on the async threads.
        let invocation = tokio::task::spawn_blocking(move || {
            let invocation = install::resolve(&toolchain)?;
            if let Some(version) = install::fortls_version(&invocation) {
                info!("using fortls {version}");
            }
            Ok::<_, InstallError>(invocation)
        })
        .await
        .map_err(|e| SessionError::Transport(e.into()))??;

        let router = Arc::new(NotificationRouter::new());
        info!(root = %project_root.display(), "starting fortls");
        let transport = ServerTransport::spawn(&invocation, &project_root, router.clone())
            .map_err(SessionError::Launch)?;

        Self::attach(transport, router, project_root, config).await
    }

    /// Run the lifecycle over an already-launched transport.
    ///
    /// This is the seam harnesses use with [`ServerTransport::from_streams`];
    /// [`Session::start`] goes through it too. Registers the notification
    /// handlers, performs the handshake, then — under
    /// [`NotReadyPolicy::Wait`] — blocks on the readiness wait. Under
    /// [`NotReadyPolicy::Fail`] it returns right after the handshake and
    /// queries fail fast until readiness resolves in the background.
    pub async fn attach(
        mut transport: ServerTransport,
        router: Arc<NotificationRouter>,
        project_root: impl Into<PathBuf>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let project_root = project_root.into();
        let flags = ReadinessFlags::new();
        register_notification_handlers(&router, &flags);

        let capabilities = handshake(&mut transport, &project_root).await?;

        // The timeout producer runs regardless of policy, so the fallback
        // transition is guaranteed even when no caller is waiting.
        let timer_flags = flags.clone();
        tokio::spawn(async move {
            timer_flags.wait(READY_TIMEOUT).await;
        });

        if config.not_ready == NotReadyPolicy::Wait {
            debug!("waiting for fortls to finish initial workspace analysis");
            match flags.wait(READY_TIMEOUT).await {
                ReadinessState::SignalObserved => info!("fortls reported analysis complete"),
                state => debug!(?state, "readiness wait resolved"),
            }
        }

        Ok(Self {
            transport,
            router,
            flags,
            capabilities,
            project_root,
            policy: config.not_ready,
        })
    }

    /// Server capabilities captured from the initialize response.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Router for the session's notification channel, for callers that
    /// want to observe additional server notifications.
    #[must_use]
    pub fn router(&self) -> &NotificationRouter {
        &self.router
    }

    /// Shared readiness handle, usable independently of the session borrow
    /// (e.g. to await readiness while another task decides to shut down).
    #[must_use]
    pub fn readiness(&self) -> Arc<ReadinessFlags> {
        self.flags.clone()
    }

    #[must_use]
    pub fn readiness_state(&self) -> ReadinessState {
        self.flags.state()
    }

    /// Whether queries are admitted. True after either an observed marker
    /// or the timeout fallback; check [`Self::readiness_state`] to tell
    /// the two apart.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.flags.is_ready()
    }

    #[must_use]
    pub fn completions_available(&self) -> bool {
        self.flags.completions_available()
    }

    /// Document symbols for one file, hierarchical where fortls supports it.
    pub async fn document_symbols(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<serde_json::Value, SessionError> {
        self.gate().await?;
        let uri = self.file_uri(path.as_ref())?;
        self.request_result(
            "textDocument/documentSymbol",
            protocol::document_symbol_params(&uri),
        )
        .await
    }

    /// Workspace-wide symbol search.
    pub async fn workspace_symbols(
        &mut self,
        query: &str,
    ) -> Result<serde_json::Value, SessionError> {
        self.gate().await?;
        self.request_result(
            "workspace/symbol",
            protocol::workspace_symbol_params(query),
        )
        .await
    }

    /// Hover information at a zero-indexed position.
    pub async fn hover(
        &mut self,
        path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, SessionError> {
        self.gate().await?;
        let uri = self.file_uri(path.as_ref())?;
        self.request_result(
            "textDocument/hover",
            protocol::text_position_params(&uri, line, character),
        )
        .await
    }

    /// Definition site(s) of the symbol at a zero-indexed position.
    pub async fn definition(
        &mut self,
        path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, SessionError> {
        self.gate().await?;
        let uri = self.file_uri(path.as_ref())?;
        self.request_result(
            "textDocument/definition",
            protocol::text_position_params(&uri, line, character),
        )
        .await
    }

    /// All references to the symbol at a zero-indexed position, including
    /// the declaration.
    pub async fn references(
        &mut self,
        path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, SessionError> {
        self.gate().await?;
        let uri = self.file_uri(path.as_ref())?;
        self.request_result(
            "textDocument/references",
            protocol::references_params(&uri, line, character),
        )
        .await
    }

    /// Tear the session down: release any readiness waiter, then shut the
    /// process down gracefully (kill as the backstop).
    pub async fn shutdown(self) {
        info!("shutting down fortls session");
        self.flags.force_release();
        self.transport.shutdown().await;
    }

    async fn gate(&self) -> Result<(), SessionError> {
        if self.flags.is_ready() {
            return Ok(());
        }
        match self.policy {
            NotReadyPolicy::Fail => Err(SessionError::NotReady),
            NotReadyPolicy::Wait => {
                self.flags.wait(READY_TIMEOUT).await;
                Ok(())
            }
        }
    }

    fn file_uri(&self, path: &Path) -> Result<String, SessionError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        };
        protocol::path_to_file_uri(&absolute)
            .map(|uri| uri.to_string())
            .map_err(|e| SessionError::Transport(e.into()))
    }

    async fn request_result(
        &mut self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SessionError> {
        match self.transport.request(method, Some(params)).await {
            Ok(response) => {
                if let Some(error) = response.get("error") {
                    return Err(SessionError::Transport(anyhow::anyhow!(
                        "{method} failed: {}",
                        error.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error")
                    )));
                }
                Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null))
            }
            Err(e) if self.transport.is_alive() => Err(SessionError::Transport(e)),
            Err(_) => Err(SessionError::ProcessExited),
        }
    }
}

/// Wire the readiness heuristic to the free-text notification methods and
/// explicitly no-op the chatter we never interpret.
fn register_notification_handlers(router: &NotificationRouter, flags: &Arc<ReadinessFlags>) {
    for method in ["window/logMessage", "window/showMessage"] {
        let flags = flags.clone();
        router.on(method, move |params| {
            let text = params
                .as_ref()
                .and_then(|p| p.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or_default();
            trace!("fortls message: {text}");
            flags.observe_message(text);
        });
    }

    router.on("$/progress", |_| {});
    router.on("textDocument/publishDiagnostics", |_| {});
}

/// Drive the capability-negotiation exchange: initialize request, single
/// correlated response, capability capture, initialized notification —
/// strictly in that order.
async fn handshake(
    transport: &mut ServerTransport,
    project_root: &Path,
) -> Result<Capabilities, SessionError> {
    let params =
        protocol::initialize_params(project_root).map_err(|e| SessionError::Handshake(e.into()))?;

    debug!("sending initialize request to fortls");
    let response = transport
        .request("initialize", Some(params))
        .await
        .map_err(SessionError::Handshake)?;

    if let Some(error) = response.get("error") {
        return Err(SessionError::Handshake(anyhow::anyhow!(
            "initialize failed: {}",
            error.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error")
        )));
    }

    let result = response.get("result").cloned().unwrap_or_default();
    let capabilities = Capabilities::from_initialize_result(&result);
    if capabilities.text_document_sync() {
        debug!("fortls supports text document synchronization");
    }
    if !capabilities.document_symbols() {
        // Degrades symbol queries but is not an error.
        warn!("fortls does not report document symbol support");
    }

    transport
        .notify("initialized", Some(serde_json::json!({})))
        .await
        .map_err(SessionError::Handshake)?;

    Ok(capabilities)
}
