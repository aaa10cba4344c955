//! Centralized HTTP client factory for the updater.
//!
//! Provides factory functions to create HTTP clients with consistent configuration:
//! - `create_default_client()` - Standard 30s timeout, used for release checks
//! - `create_client_with_timeout(duration)` - Custom timeout, used for asset downloads
//!
//! All clients include: User-Agent, tcp_nodelay, and a bounded idle pool so
//! DNS is re-resolved periodically.

use reqwest::Client;
use std::time::Duration;

/// User-Agent string for all HTTP requests
pub const USER_AGENT: &str = concat!("hatch-update/", env!("CARGO_PKG_VERSION"));

/// Default timeout for release metadata requests (30 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a whole asset download attempt (5 minutes)
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection pool idle timeout to ensure DNS is re-resolved periodically.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates an HTTP client with default configuration (30s timeout).
pub fn create_default_client() -> Result<Client, String> {
    create_client_with_timeout(DEFAULT_TIMEOUT)
}

/// Creates an HTTP client with a custom timeout.
///
/// All clients include:
/// - User-Agent: `hatch-update/{version}`
/// - tcp_nodelay: true
/// - pool_idle_timeout: 60s
/// - Read timeout capped at 60s so a stalled body does not hang until `timeout`
pub fn create_client_with_timeout(timeout: Duration) -> Result<Client, String> {
    let read_timeout = timeout.min(Duration::from_secs(60));

    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .read_timeout(read_timeout)
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_default_client_succeeds() {
        let result = create_default_client();
        assert!(result.is_ok(), "create_default_client should succeed");
    }

    #[test]
    fn test_create_client_with_timeout_succeeds() {
        let result = create_client_with_timeout(DOWNLOAD_TIMEOUT);
        assert!(result.is_ok(), "create_client_with_timeout should succeed");
    }

    #[test]
    fn test_user_agent_constant_is_set() {
        assert!(USER_AGENT.starts_with("hatch-update/"));
    }

    #[test]
    fn test_timeout_constants_are_correct() {
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(30));
        assert_eq!(DOWNLOAD_TIMEOUT, Duration::from_secs(300));
        assert_eq!(POOL_IDLE_TIMEOUT, Duration::from_secs(60));
    }
}
