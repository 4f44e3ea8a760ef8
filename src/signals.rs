//! SIGTERM/SIGINT handling for the backup run: a signal flips the
//! cancellation token so in-flight work winds down through its existing
//! suspension points, and records which signal fired so `main` can map it to
//! the `128 + signo` exit code §6.5 requires.

use anyhow::{Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use crate::utils::cancel::CancellationToken;

static CAUGHT: AtomicI32 = AtomicI32::new(0);
static TOKEN: OnceLock<CancellationToken> = OnceLock::new();

/// Installs handlers for SIGTERM and SIGINT that cancel `cancel` and record
/// the signal number. Safe to call once per process; a second call would
/// silently overwrite the stored token, so callers must only invoke this
/// from `main`'s backup-run path.
pub fn install(cancel: &CancellationToken) -> Result<()> {
    let _ = TOKEN.set(cancel.clone());
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle)).context("install SIGTERM handler")?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle)).context("install SIGINT handler")?;
    }
    Ok(())
}

/// The signal caught since `install`, if any. `main` checks this before
/// falling back to `errors::exit_code_for` so a run killed by a signal exits
/// `128 + signo` rather than the generic failure code.
pub fn caught_signal() -> Option<i32> {
    match CAUGHT.load(Ordering::SeqCst) {
        0 => None,
        signo => Some(signo),
    }
}

extern "C" fn handle(signo: i32) {
    CAUGHT.store(signo, Ordering::SeqCst);
    if let Some(token) = TOKEN.get() {
        token.cancel();
    }
}
