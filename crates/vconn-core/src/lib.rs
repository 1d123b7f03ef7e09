//! # vconn-core
//!
//! Platform-agnostic types and primitives for the vconn virtual-connection
//! I/O core. This crate contains no OS-specific code; sockets, epoll and the
//! reactor live in `vconn-net`.
//!
//! ## Modules
//!
//! - `event` - event codes delivered to user continuations
//! - `error` - error types and the extended errno space
//! - `buffer` - chain-of-blocks byte buffer with writer/reader cursors
//! - `colock` - coordinating try-lock mutex with holder tracking
//! - `spinlock` - internal spinlock primitive
//! - `env` - environment variable utilities
//! - `kprint` - kernel-style debug printing macros

pub mod buffer;
pub mod colock;
pub mod env;
pub mod error;
pub mod event;
pub mod kprint;
pub mod spinlock;

// Re-exports for convenience
pub use buffer::{MioBuffer, NET_MAX_IOV};
pub use colock::{current_thread_id, CoGuard, CoMutex};
pub use env::{env_get, env_get_bool};
pub use error::{NetError, NetResult, ENET_THROTTLING};
pub use event::{Dir, NetEvent, SignalResult};
pub use spinlock::SpinLock;
