//! Server configuration constants.

use std::time::Duration;

pub use worktable_types::API_PREFIX;

/// Default HTTP port for the worktable server.
pub const DEFAULT_PORT: u16 = 7878;

/// Default bind address (localhost only).
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// How long a list request waits for the first push of its view.
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Filter used when neither `RUST_LOG` nor the config file sets one.
pub const DEFAULT_LOG_FILTER: &str = "info";
