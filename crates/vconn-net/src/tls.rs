//! TLS handshake capability
//!
//! The I/O core does not implement TLS. A connection may carry a
//! [`TlsHooks`] implementation; until it reports the handshake complete,
//! the write drain path delegates one handshake step per readiness edge
//! and reacts to the outcome (reschedule the right direction, surface an
//! error, or start flowing data). A connection with no hooks is always
//! handshake-complete.

/// Which side of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSide {
    Client,
    Server,
}

/// Result of driving the handshake one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Handshake finished; data can flow.
    Done,
    /// Needs bytes from the peer before progressing.
    WantRead,
    /// Server side wants another accept round.
    WantAccept,
    /// Client side wants the connect to finish.
    WantConnect,
    /// Needs socket write room before progressing.
    WantWrite,
    /// Handshake failed; the payload is the error to surface as `lerrno`.
    Error(i32),
}

/// The capability the core consumes from a TLS implementation.
pub trait TlsHooks: Send {
    fn handshake_complete(&self) -> bool;
    fn is_client(&self) -> bool;
    fn start_handshake(&mut self, side: TlsSide) -> HandshakeOutcome;
}
