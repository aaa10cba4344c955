//! Platform-specific installation with backup and rollback.
//!
//! Every platform goes through the same phases:
//!
//! ```text
//! Extracting -> Located -> Validated -> Swapped -> Verified
//!      \           \           \           \
//!       +-----------+-----------+-----------+--> RollingBack -> RolledBack
//!                                                           \-> RollbackFailed
//! ```

pub mod base;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{UpdateError, UpdateResult};

#[cfg(target_os = "macos")]
pub use macos::MacOsApplier;
#[cfg(unix)]
pub use unix::UnixApplier;
#[cfg(windows)]
pub use windows::WindowsApplier;

/// How an update ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The new executable is in place now.
    Replaced,
    /// The file was locked; the OS will swap it in on the next reboot.
    ScheduledForReboot,
}

/// Installs a downloaded artifact over the running application.
///
/// All operations block; async callers should run them on a blocking thread.
pub trait UpdateApplier: Send + Sync {
    /// Copy `src` (file or bundle directory) to `backup`.
    fn backup(&self, src: &Path, backup: &Path) -> UpdateResult<()>;

    /// Extract `update_path` and swap the result in for `target`.
    fn apply(&self, update_path: &Path, target: &Path) -> UpdateResult<ApplyOutcome>;

    /// Put `backup` back at `target`.
    fn restore(&self, backup: &Path, target: &Path) -> UpdateResult<()>;

    /// Remove leftovers. Missing paths are ignored.
    fn cleanup(&self, paths: &[PathBuf]) -> UpdateResult<()>;

    /// Launch the freshly installed application and exit this process.
    fn restart(&self, exec_path: &Path, args: &[String]) -> UpdateResult<()>;
}

/// The applier for the platform this binary was built for.
pub fn platform_applier() -> Box<dyn UpdateApplier> {
    #[cfg(target_os = "macos")]
    {
        Box::new(MacOsApplier::new())
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Box::new(UnixApplier::new())
    }
    #[cfg(windows)]
    {
        Box::new(WindowsApplier::new())
    }
}

/// Step of an apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Extracting,
    Located,
    Validated,
    Swapped,
    Verified,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl ApplyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracting => "extracting",
            Self::Located => "located",
            Self::Validated => "validated",
            Self::Swapped => "swapped",
            Self::Verified => "verified",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::RolledBack | Self::RollbackFailed)
    }

    fn can_advance_to(self, next: ApplyPhase) -> bool {
        use ApplyPhase::*;
        matches!(
            (self, next),
            (Extracting, Located)
                | (Located, Validated)
                | (Validated, Swapped)
                | (Swapped, Verified)
                | (Extracting | Located | Validated | Swapped, RollingBack)
                | (RollingBack, RolledBack | RollbackFailed)
        )
    }
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records the phases of one apply run and refuses out-of-order steps.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    history: Vec<ApplyPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    /// Start in `Extracting`.
    pub fn new() -> Self {
        Self {
            history: vec![ApplyPhase::Extracting],
        }
    }

    pub fn current(&self) -> ApplyPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(ApplyPhase::Extracting)
    }

    pub fn history(&self) -> &[ApplyPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: ApplyPhase) -> UpdateResult<()> {
        let current = self.current();
        if !current.can_advance_to(next) {
            return Err(UpdateError::validation("illegal apply phase transition")
                .with_context("from", current)
                .with_context("to", next));
        }
        tracing::debug!(from = %current, to = %next, "Apply phase transition");
        self.history.push(next);
        Ok(())
    }

    /// Whether the swap already happened, i.e. the target was modified.
    pub fn swapped(&self) -> bool {
        self.history.contains(&ApplyPhase::Swapped)
    }
}

/// Restore `<target>.backup` after a failed swap, recording the outcome.
///
/// Returns the error to report: `cause` tagged with the final phase, or the
/// fatal rollback failure.
pub(crate) fn roll_back(phases: &mut PhaseTracker, target: &Path, cause: UpdateError) -> UpdateError {
    if phases.advance(ApplyPhase::RollingBack).is_err() {
        return cause.with_context("phase", phases.current());
    }
    tracing::warn!(target = %target.display(), error = %cause, "Apply failed, rolling back");

    match base::restore(&base::backup_path_for(target), target) {
        Ok(()) => {
            let _ = phases.advance(ApplyPhase::RolledBack);
            cause.with_context("phase", phases.current())
        }
        Err(rollback_err) => {
            let _ = phases.advance(ApplyPhase::RollbackFailed);
            tracing::error!(target = %target.display(), error = %rollback_err, "Rollback failed");
            UpdateError::rollback_failed(cause, rollback_err)
        }
    }
}
