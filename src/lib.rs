//! LSP client session manager for the fortls Fortran language server.
//!
//! The lifecycle is: resolve or install the `fortls` binary, launch it as a
//! child process over framed stdio, perform the initialize handshake, infer
//! readiness from free-text log notifications (with a bounded timeout
//! fallback, since fortls emits no structured ready event), then serve
//! readiness-gated symbol queries until shutdown.

pub mod codec;
pub mod install;
pub mod ready;
pub mod transport;
pub mod types;

pub(crate) mod protocol;

mod session;

pub use install::{SystemToolchain, Toolchain, fortls_version, resolve};
pub use ready::{READY_TIMEOUT, ReadinessFlags, ReadinessState, is_ready_signal};
pub use session::{Session, is_ignored_dirname};
pub use transport::{NotificationRouter, ServerTransport};
pub use types::{
    Capabilities, InstallError, Invocation, NotReadyPolicy, SessionConfig, SessionError,
};
