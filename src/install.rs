//! Locating or installing the fortls executable.
//!
//! Resolution tries, in order: the PATH, an already-importable Python
//! module, a pip install followed by a PATH re-check, and finally running
//! the module through the interpreter directly. The first success wins and
//! later steps are never attempted. pip runs at most once per resolution.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::types::{InstallError, Invocation};

const FORTLS_BIN: &str = "fortls";
const FORTLS_MODULE: &str = "fortls";
/// Pinned minimum version for automated installs.
const FORTLS_REQUIREMENT: &str = "fortls>=3.0.0";

/// OS-level operations behind the resolver, separated so tests can count
/// side effects and script outcomes.
pub trait Toolchain {
    /// Look up an executable on the search path.
    fn find_in_path(&self, name: &str) -> Option<PathBuf>;

    /// Whether `import <module>` succeeds in the host Python, without
    /// installing anything.
    fn probe_module(&self, module: &str) -> bool;

    /// Install a requirement via pip. Mutating and network-dependent.
    fn pip_install(&self, requirement: &str) -> Result<(), String>;

    /// Interpreter used for module probes and `-m` invocations.
    fn python(&self) -> PathBuf;
}

/// [`Toolchain`] backed by the real system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolchain;

impl Toolchain for SystemToolchain {
    fn find_in_path(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn probe_module(&self, module: &str) -> bool {
        Command::new(self.python())
            .args(["-c", &format!("import {module}")])
            .output()
            .is_ok_and(|out| out.status.success())
    }

    fn pip_install(&self, requirement: &str) -> Result<(), String> {
        let output = Command::new(self.python())
            .args(["-m", "pip", "install", requirement])
            .output()
            .map_err(|e| format!("failed to run pip: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "pip install {requirement} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    fn python(&self) -> PathBuf {
        which::which("python3")
            .or_else(|_| which::which("python"))
            .unwrap_or_else(|_| PathBuf::from("python3"))
    }
}

/// Resolve a runnable fortls invocation, installing it on demand.
///
/// Fatal on failure: without a binary there is no session to offer.
pub fn resolve(toolchain: &dyn Toolchain) -> Result<Invocation, InstallError> {
    if let Some(path) = toolchain.find_in_path(FORTLS_BIN) {
        debug!(path = %path.display(), "found fortls on PATH");
        return Ok(Invocation::bare(path));
    }

    // Some environments expose the module without a PATH entry; the console
    // script still resolves by name once the module is importable.
    if toolchain.probe_module(FORTLS_MODULE) {
        debug!("fortls module importable, using bare command name");
        return Ok(Invocation::bare(FORTLS_BIN));
    }

    info!("fortls not found, installing via pip ({FORTLS_REQUIREMENT})");
    if let Err(cause) = toolchain.pip_install(FORTLS_REQUIREMENT) {
        warn!("pip install of fortls failed: {cause}");
        return Err(InstallError { last_cause: cause });
    }

    if let Some(path) = toolchain.find_in_path(FORTLS_BIN) {
        info!(path = %path.display(), "installed fortls");
        return Ok(Invocation::bare(path));
    }

    // Installed, but the interpreter's scripts directory is not on PATH.
    // Run the module through the interpreter instead.
    if toolchain.probe_module(FORTLS_MODULE) {
        let python = toolchain.python();
        info!(python = %python.display(), "running fortls as a module");
        return Ok(Invocation::new(
            python,
            vec!["-m".to_string(), FORTLS_MODULE.to_string()],
        ));
    }

    Err(InstallError {
        last_cause: String::from(
            "pip install reported success but fortls is neither on PATH nor importable",
        ),
    })
}

/// Best-effort version query, used only for logging.
#[must_use]
pub fn fortls_version(invocation: &Invocation) -> Option<String> {
    let output = Command::new(invocation.command())
        .args(invocation.args())
        .arg("--version")
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}
