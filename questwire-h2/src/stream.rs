//! Per-stream bookkeeping (RFC 7540 Section 5.1).

use crate::flowcontrol::Window;

/// Lifecycle of a client-initiated stream. Streams are created open by
/// sending HEADERS, so there is no idle state; closed streams are dropped
/// from the table rather than kept in a `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// The peer sent END_STREAM.
    HalfClosedRemote,
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub state: StreamState,
    pub recv_window: Window,
    pub send_window: Window,
    /// A non-informational response header block has arrived; any further
    /// header block is trailers.
    pub response_seen: bool,
}

impl Stream {
    pub fn new(recv_window: i64, send_window: i64) -> Self {
        Self {
            state: StreamState::Open,
            recv_window: Window::new(recv_window),
            send_window: Window::new(send_window),
            response_seen: false,
        }
    }

    /// Record END_STREAM from our side. Returns true once both sides are done.
    pub fn close_local(&mut self) -> bool {
        match self.state {
            StreamState::HalfClosedRemote => true,
            _ => {
                self.state = StreamState::HalfClosedLocal;
                false
            }
        }
    }

    /// Record END_STREAM from the peer. Returns true once both sides are done.
    pub fn close_remote(&mut self) -> bool {
        match self.state {
            StreamState::HalfClosedLocal => true,
            _ => {
                self.state = StreamState::HalfClosedRemote;
                false
            }
        }
    }

    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }
}
