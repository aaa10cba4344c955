//! Common plumbing shared across Hatch crates.

pub mod atomic_write;
pub mod http_client;

pub use atomic_write::{atomic_write, temp_path_for};
pub use http_client::{
    DEFAULT_TIMEOUT, DOWNLOAD_TIMEOUT, POOL_IDLE_TIMEOUT, USER_AGENT, create_client_with_timeout,
    create_default_client,
};
