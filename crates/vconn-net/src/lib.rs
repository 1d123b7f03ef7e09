//! # vconn-net
//!
//! Virtual connections over non-blocking stream sockets, driven by a
//! per-thread reactor.
//!
//! A [`NetVc`](vc::NetVc) owns a socket and two directions of outstanding
//! I/O ([`Vio`](vio::Vio)s). The reactor ([`NetHandler`](handler::NetHandler))
//! polls edge-triggered readiness, drains ready connections into their
//! buffers and delivers lifecycle events to user [`Continuation`](cont::Continuation)s
//! without ever blocking its own thread: every lock is a try-lock, and work
//! that cannot run now is deferred onto a retry timer or the enable queue.
//!
//! ## Modules
//!
//! - `sock` - the socket connection and raw syscall wrappers
//! - `poll` - epoll poller and the per-connection readiness handle
//! - `link` - intrusive connection lists (open list, ready lists)
//! - `vio` - the outstanding-I/O descriptor
//! - `cont` - the continuation trait and event payloads
//! - `state` - one direction's state (VIO, enabled/triggered, links)
//! - `vc` - the virtual connection: `do_io_*`, reenable, timeouts, OOB,
//!   migration
//! - `io` - the read and write drain paths
//! - `handler` - the per-thread reactor: lists, timers, the run loop
//! - `cop` - the inactivity cop
//! - `tls` - the TLS handshake capability consumed by the write path
//! - `config`, `stats`, `throttle` - tunables, counters, the connect gate

pub mod config;
pub mod cont;
pub mod cop;
pub mod handler;
pub mod io;
pub mod link;
pub mod poll;
pub mod sock;
pub mod state;
pub mod stats;
pub mod throttle;
pub mod tls;
pub mod vc;
pub mod vio;

pub use config::ReactorConfig;
pub use cont::{Continuation, ContRef, EventData};
pub use handler::{NetHandler, NetThread};
pub use sock::Connection;
pub use stats::NET_STATS;
pub use tls::{HandshakeOutcome, TlsHooks, TlsSide};
pub use vc::{ApiData, ApiDataId, NetVc, OobResult, ShutdownHow, VcRef};
pub use vio::{Vio, VioOp, VIO_UNBOUNDED};

pub use vconn_core::{Dir, MioBuffer, NetError, NetEvent, NetResult, SignalResult};
