//! Per-call response state machine.
//!
//! ```text
//!   Sent --headers--> HeadersObserved --data--> Accumulating
//!     \                    |                        |
//!      +--------------- end / error / timeout ------+--> Settled
//! ```
//!
//! A call settles exactly once. A failure status seen in headers or trailers
//! is only recorded; the call settles when the stream ends, fails or times
//! out, and whichever outcome was observed first is the one reported.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use prost_reflect::MessageDescriptor;
use questwire_h2::HeaderField;
use serde_json::Value;
use tokio::time::{Instant, Sleep};

use crate::codec;
use crate::connection::{Stream, StreamEvent};
use crate::error::{Error, Result, TransportError};
use crate::metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Request written, nothing received yet.
    Sent,
    HeadersObserved,
    Accumulating,
    Settled,
}

/// State of one in-flight unary call.
#[derive(Debug)]
pub struct PendingCall {
    state: CallState,
    response: MessageDescriptor,
    timeout: Duration,
    timer: Option<Pin<Box<Sleep>>>,
    body: BytesMut,
    /// First failure observed before the stream ended.
    recorded: Option<Error>,
}

impl PendingCall {
    /// Arm the deadline now.
    pub fn new(response: MessageDescriptor, timeout: Duration) -> Self {
        Self {
            state: CallState::Sent,
            response,
            timeout,
            timer: Some(Box::pin(tokio::time::sleep_until(Instant::now() + timeout))),
            body: BytesMut::new(),
            recorded: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Completes when the deadline passes. Never completes once settled.
    pub async fn expired(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => timer.as_mut().await,
            None => std::future::pending().await,
        }
    }

    pub fn on_headers(&mut self, headers: &[HeaderField]) {
        if self.state == CallState::Settled {
            return;
        }
        self.state = CallState::HeadersObserved;
        if let Some((code, message)) = metadata::header_failure(headers) {
            self.record(Error::Status { code, message });
        }
    }

    pub fn on_data(&mut self, data: &[u8]) {
        if self.state == CallState::Settled {
            return;
        }
        self.state = CallState::Accumulating;
        self.body.extend_from_slice(data);
    }

    pub fn on_trailers(&mut self, trailers: &[HeaderField]) {
        if self.state == CallState::Settled {
            return;
        }
        if let Some((code, message)) = metadata::grpc_status(trailers)
            && code != 0
        {
            self.record(Error::Status { code, message });
        }
    }

    /// The stream ended normally.
    pub fn on_end(&mut self) -> Option<Result<Value>> {
        let outcome = match self.recorded.take() {
            Some(err) => Err(err),
            None => self.decode_body(),
        };
        self.settle(outcome)
    }

    pub fn on_transport_error(&mut self, err: TransportError) -> Option<Result<Value>> {
        let outcome = Err(self.recorded.take().unwrap_or(Error::Transport(err)));
        self.settle(outcome)
    }

    /// The deadline passed; the caller aborts the stream.
    pub fn on_timeout(&mut self) -> Option<Result<Value>> {
        let outcome = Err(self
            .recorded
            .take()
            .unwrap_or(Error::Timeout(self.timeout)));
        self.settle(outcome)
    }

    fn record(&mut self, err: Error) {
        if self.recorded.is_none() {
            self.recorded = Some(err);
        }
    }

    fn decode_body(&self) -> Result<Value> {
        match codec::decode(&self.body)? {
            None => Ok(Value::Object(Default::default())),
            Some(payload) => Ok(codec::to_json(&self.response, &payload)?),
        }
    }

    fn settle(&mut self, outcome: Result<Value>) -> Option<Result<Value>> {
        if self.state == CallState::Settled {
            return None;
        }
        self.state = CallState::Settled;
        self.timer = None;
        self.body.clear();
        Some(outcome)
    }

    /// Feed `stream`'s events until the call settles.
    pub(crate) async fn drive(mut self, stream: &mut Stream) -> Result<Value> {
        loop {
            let settled = tokio::select! {
                event = stream.next() => match event {
                    Some(event) => self.on_event(event),
                    None => self.on_transport_error(TransportError::ConnectionClosed),
                },
                () = self.expired() => {
                    stream.abort();
                    tracing::debug!(
                        stream_id = stream.id(),
                        timeout = ?self.timeout,
                        "call deadline exceeded"
                    );
                    self.on_timeout()
                }
            };
            if let Some(outcome) = settled {
                stream.finish();
                return outcome;
            }
        }
    }

    fn on_event(&mut self, event: StreamEvent) -> Option<Result<Value>> {
        match event {
            StreamEvent::Headers {
                headers,
                end_stream,
            } => {
                self.on_headers(&headers);
                end_stream.then(|| self.on_end()).flatten()
            }
            StreamEvent::Data(data) => {
                self.on_data(&data);
                None
            }
            StreamEvent::End => self.on_end(),
            StreamEvent::Trailers(trailers) => {
                self.on_trailers(&trailers);
                self.on_end()
            }
            StreamEvent::Failed(err) => self.on_transport_error(err),
        }
    }
}

/// Race `fut` against the call's deadline; used while the stream is being
/// opened, before any response can arrive.
pub(crate) async fn before_deadline<T>(
    call: &mut PendingCall,
    fut: impl Future<Output = std::result::Result<T, TransportError>>,
) -> Result<T> {
    tokio::select! {
        out = fut => Ok(out?),
        () = call.expired() => {
            let outcome = call.on_timeout();
            Err(outcome.and_then(Result::err).unwrap_or(Error::Timeout(call.timeout)))
        }
    }
}
