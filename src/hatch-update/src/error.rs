//! Error types for hatch-update.
//!
//! Every fallible operation returns an [`UpdateError`] tagged with one of six
//! [`ErrorCategory`] values so hosts can branch on the category instead of
//! parsing messages.

use std::fmt;

use thiserror::Error;

/// Result type for update operations.
pub type UpdateResult<T> = std::result::Result<T, UpdateError>;

/// Boxed error used as the wrapped cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Broad failure class of an [`UpdateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    /// Checksums, formats, malformed release metadata.
    Validation,
    FileSystem,
    Permission,
    /// HTTPS violations, signature and path-traversal failures.
    Security,
    Configuration,
}

impl ErrorCategory {
    /// Get the category as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::FileSystem => "filesystem",
            Self::Permission => "permission",
            Self::Security => "security",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker cause for an operation aborted through its cancellation token.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Structured update failure.
///
/// Renders as `[category] message: cause [key=value]...`.
#[derive(Debug, Error)]
#[error("{}", render(.category, .message, .cause, .context))]
pub struct UpdateError {
    category: ErrorCategory,
    message: String,
    #[source]
    cause: Option<BoxError>,
    context: Vec<(String, String)>,
    inconsistent_state: bool,
}

fn render(
    category: &ErrorCategory,
    message: &str,
    cause: &Option<BoxError>,
    context: &[(String, String)],
) -> String {
    let mut out = format!("[{category}] {message}");
    if let Some(cause) = cause {
        out.push_str(&format!(": {cause}"));
    }
    for (key, value) in context {
        out.push_str(&format!(" [{key}={value}]"));
    }
    out
}

impl UpdateError {
    /// Create an error of the given category.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            cause: None,
            context: Vec::new(),
            inconsistent_state: false,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::FileSystem, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permission, message)
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Security, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    /// Network error caused by a fired cancellation token.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::network(message).with_cause(Cancelled)
    }

    /// Filesystem error from an IO failure, promoted to `permission` when the
    /// OS reports a permission problem.
    pub fn io(message: impl Into<String>, err: std::io::Error) -> Self {
        let category = if err.kind() == std::io::ErrorKind::PermissionDenied {
            ErrorCategory::Permission
        } else {
            ErrorCategory::FileSystem
        };
        Self::new(category, message).with_cause(err)
    }

    /// The fatal condition where an update failed and restoring the backup
    /// failed too. Keeps the category of the original failure.
    pub fn rollback_failed(apply_err: UpdateError, rollback_err: UpdateError) -> Self {
        let mut err = Self::new(
            apply_err.category,
            "update failed and rollback also failed",
        )
        .with_context("apply_error", apply_err.to_string())
        .with_context("rollback_error", rollback_err.to_string())
        .with_context("inconsistent_state", "true")
        .with_cause(apply_err);
        err.inconsistent_state = true;
        err
    }

    /// Attach the underlying cause.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Append a diagnostic key/value pair. Order of insertion is preserved.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.push((key.into(), value.to_string()));
        self
    }

    /// Wrap this error under a higher level message, preserving its category
    /// and keeping it as the cause.
    pub fn wrap(self, message: impl Into<String>) -> Self {
        let category = self.category;
        let inconsistent_state = self.inconsistent_state;
        let mut err = Self::new(category, message).with_cause(self);
        err.inconsistent_state = inconsistent_state;
        err
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    /// Look up a context value by key (first match).
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_category(&self, category: ErrorCategory) -> bool {
        self.category == category
    }

    /// Check if the error was caused by cancellation anywhere in its chain.
    pub fn is_cancelled(&self) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> =
            self.cause.as_deref().map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(err) = current {
            if err.is::<Cancelled>() {
                return true;
            }
            current = err.source();
        }
        false
    }

    /// Check if this error is retriable.
    ///
    /// Only transport failures are; cancellations, checksum mismatches and
    /// security rejections never are.
    pub fn is_retriable(&self) -> bool {
        self.category == ErrorCategory::Network && !self.is_cancelled()
    }

    /// True when an update and its rollback both failed, leaving the
    /// installation in an unknown state. Must never be retried automatically.
    pub fn is_inconsistent_state(&self) -> bool {
        self.inconsistent_state
    }
}
