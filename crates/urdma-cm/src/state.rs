//! Connection endpoint states

use core::fmt;

/// Handshake state of a CEP
///
/// Passive: `Listening` spawns children in `AwaitingPeerHandshakeRequest`,
/// which move through `HandshakeRequestReceived` and `Accepting` to
/// `AwaitingRtr`. Active: `Connecting` -> `AwaitingHandshakeReply` ->
/// `HandshakeReplyReceived` -> `AwaitingRtr`. Both end in `RdmaMode` or
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CepState {
    /// Created, no socket yet
    Idle = 0,

    /// Passive endpoint accepting connections
    Listening = 1,

    /// Active endpoint, transport connect in progress
    Connecting = 2,

    /// Accepted socket waiting for the peer's MPA request
    AwaitingPeerHandshakeRequest = 3,

    /// MPA request parsed; waiting for the application to accept or reject
    HandshakeRequestReceived = 4,

    /// MPA request sent; waiting for the peer's reply
    AwaitingHandshakeReply = 5,

    /// MPA reply parsed on the active side
    HandshakeReplyReceived = 6,

    /// Accept in progress: reply being sent and QP bound
    Accepting = 7,

    /// QP handed to the dataplane; waiting for ready-to-receive
    AwaitingRtr = 8,

    /// Handshake complete (terminal success)
    RdmaMode = 9,

    /// Terminal
    Closed = 10,
}

impl CepState {
    pub const fn name(self) -> &'static str {
        match self {
            CepState::Idle => "Idle",
            CepState::Listening => "Listening",
            CepState::Connecting => "Connecting",
            CepState::AwaitingPeerHandshakeRequest => "AwaitingPeerHandshakeRequest",
            CepState::HandshakeRequestReceived => "HandshakeRequestReceived",
            CepState::AwaitingHandshakeReply => "AwaitingHandshakeReply",
            CepState::HandshakeReplyReceived => "HandshakeReplyReceived",
            CepState::Accepting => "Accepting",
            CepState::AwaitingRtr => "AwaitingRtr",
            CepState::RdmaMode => "RdmaMode",
            CepState::Closed => "Closed",
        }
    }

    /// Check if no further transitions can happen
    #[inline]
    pub const fn is_closed(self) -> bool {
        matches!(self, CepState::Closed)
    }

    /// Check if the CEP is reading an MPA frame from its socket
    #[inline]
    pub const fn is_reading_handshake(self) -> bool {
        matches!(
            self,
            CepState::AwaitingPeerHandshakeRequest | CepState::AwaitingHandshakeReply
        )
    }
}

impl fmt::Display for CepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(CepState::Closed.is_closed());
        assert!(!CepState::RdmaMode.is_closed());
        assert!(CepState::AwaitingPeerHandshakeRequest.is_reading_handshake());
        assert!(CepState::AwaitingHandshakeReply.is_reading_handshake());
        assert!(!CepState::HandshakeRequestReceived.is_reading_handshake());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CepState::AwaitingRtr.to_string(), "AwaitingRtr");
        assert_eq!(format!("{}", CepState::Listening), "Listening");
    }
}
