//! Event codes delivered to user continuations

use core::fmt;

/// Events a virtual connection delivers to user continuations.
///
/// The discriminants start at 1 so that 0 can serve as a "no event"
/// sentinel when an event is stored in an atomic cell (the write-buffer
/// empty trap).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetEvent {
    /// Bytes arrived and the read VIO is not yet complete.
    ReadReady = 1,
    /// The read VIO reached its byte goal.
    ReadComplete = 2,
    /// The write VIO made progress, or the core wants the buffer refilled.
    WriteReady = 3,
    /// The write VIO reached its byte goal.
    WriteComplete = 4,
    /// The peer closed the stream (read of 0, or ECONNRESET).
    Eos = 5,
    /// An I/O error; `lerrno` on the connection holds the OS errno.
    Error = 6,
    /// No activity within the configured inactivity window.
    InactivityTimeout = 7,
    /// The absolute lifetime of the connection expired.
    ActiveTimeout = 8,
    /// An out-of-band send finished.
    OobComplete = 9,
    /// A new inbound connection; payload is the connection itself.
    Accept = 10,
    /// An outbound connection is established.
    Open = 11,
    /// An outbound connection failed; payload is a negative errno.
    OpenFailed = 12,
}

impl NetEvent {
    /// Terminal events end the life of a VIO. Delivering one to a VIO with
    /// no continuation silently closes the connection instead of asserting.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NetEvent::Eos | NetEvent::Error | NetEvent::InactivityTimeout | NetEvent::ActiveTimeout
        )
    }

    /// Decode from the atomic-cell encoding. 0 means "no event".
    #[inline]
    pub fn from_u8(v: u8) -> Option<NetEvent> {
        match v {
            1 => Some(NetEvent::ReadReady),
            2 => Some(NetEvent::ReadComplete),
            3 => Some(NetEvent::WriteReady),
            4 => Some(NetEvent::WriteComplete),
            5 => Some(NetEvent::Eos),
            6 => Some(NetEvent::Error),
            7 => Some(NetEvent::InactivityTimeout),
            8 => Some(NetEvent::ActiveTimeout),
            9 => Some(NetEvent::OobComplete),
            10 => Some(NetEvent::Accept),
            11 => Some(NetEvent::Open),
            12 => Some(NetEvent::OpenFailed),
            _ => None,
        }
    }
}

impl fmt::Display for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetEvent::ReadReady => "READ_READY",
            NetEvent::ReadComplete => "READ_COMPLETE",
            NetEvent::WriteReady => "WRITE_READY",
            NetEvent::WriteComplete => "WRITE_COMPLETE",
            NetEvent::Eos => "EOS",
            NetEvent::Error => "ERROR",
            NetEvent::InactivityTimeout => "INACTIVITY_TIMEOUT",
            NetEvent::ActiveTimeout => "ACTIVE_TIMEOUT",
            NetEvent::OobComplete => "OOB_COMPLETE",
            NetEvent::Accept => "NET_EVENT_ACCEPT",
            NetEvent::Open => "NET_EVENT_OPEN",
            NetEvent::OpenFailed => "NET_EVENT_OPEN_FAILED",
        };
        f.write_str(s)
    }
}

/// Outcome of an event dispatch.
///
/// `Done` means the connection was torn down inside the dispatch and the
/// caller must not touch it again. `Continue` means the connection is still
/// live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResult {
    Continue,
    Done,
}

/// One direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        for v in 1u8..=12 {
            let e = NetEvent::from_u8(v).unwrap();
            assert_eq!(e as u8, v);
        }
        assert_eq!(NetEvent::from_u8(0), None);
        assert_eq!(NetEvent::from_u8(13), None);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(NetEvent::Eos.is_terminal());
        assert!(NetEvent::Error.is_terminal());
        assert!(NetEvent::InactivityTimeout.is_terminal());
        assert!(NetEvent::ActiveTimeout.is_terminal());
        assert!(!NetEvent::ReadReady.is_terminal());
        assert!(!NetEvent::WriteComplete.is_terminal());
        assert!(!NetEvent::Accept.is_terminal());
    }
}
