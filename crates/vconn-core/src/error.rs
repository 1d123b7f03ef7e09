//! Error types for the vconn I/O core
//!
//! Two conventions coexist, following the layering of the syscall surface:
//! raw I/O paths use signed returns (`>= 0` bytes, `< 0` negative errno),
//! while setup and control paths use `NetResult`.

use core::fmt;

/// Result type for connection setup and control operations
pub type NetResult<T> = Result<T, NetError>;

/// Start of the extended errno space, above any OS errno.
pub const NET_ERRNO_BASE: i32 = 20000;

/// The connection-throttle gate refused a new outbound connection.
/// Delivered to the user as `OPEN_FAILED` with `-ENET_THROTTLING`.
pub const ENET_THROTTLING: i32 = NET_ERRNO_BASE + 3;

/// Errors surfaced by connection setup and control operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// An OS call failed; holds the positive errno.
    Os(i32),

    /// The per-process connection limit was reached.
    Throttled,

    /// Operation invoked on a closed connection.
    Closed,

    /// Failed to register the descriptor with the poller.
    PollRegistration(i32),

    /// The target reactor's mutex could not be taken; the caller owns
    /// cleanup of any half-installed state.
    HandlerBusy,

    /// The reactor is shutting down or was never started.
    NotRunning,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Os(e) => write!(f, "os error {}", e),
            NetError::Throttled => write!(f, "connection throttled"),
            NetError::Closed => write!(f, "connection closed"),
            NetError::PollRegistration(e) => write!(f, "poller registration failed: errno {}", e),
            NetError::HandlerBusy => write!(f, "net handler mutex unavailable"),
            NetError::NotRunning => write!(f, "net handler not running"),
        }
    }
}

impl std::error::Error for NetError {}
