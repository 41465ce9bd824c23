//! Connection lifecycle and the HTTP/2 driver task.
//!
//! Each session is one tokio task that owns the socket and the sans-IO
//! [`questwire_h2::Connection`]. Calls talk to it over a command channel and
//! receive their own stream's events on a per-stream channel, so one call
//! never sees another call's bytes. Connection-level failures are logged
//! here and delivered to the affected streams; they never propagate out of
//! the task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use questwire_h2::{Connection, ErrorCode, Event, HeaderField};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::transport::{self, Io};

const READ_BUF_SIZE: usize = 16 * 1024;

/// What happened on one stream, in arrival order.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Headers {
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    Data(Vec<u8>),
    /// The body ended without trailers.
    End,
    /// Trailers; the stream is complete.
    Trailers(Vec<HeaderField>),
    /// The stream will produce nothing more.
    Failed(TransportError),
}

pub(crate) enum Command {
    Open {
        headers: Vec<HeaderField>,
        body: Bytes,
        events: mpsc::UnboundedSender<StreamEvent>,
        reply: oneshot::Sender<Result<u32, TransportError>>,
    },
    Reset {
        stream_id: u32,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Call-side handle to one open stream.
///
/// Dropping it before the stream finished cancels the stream.
#[derive(Debug)]
pub(crate) struct Stream {
    id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    commands: mpsc::UnboundedSender<Command>,
    finished: bool,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Next event; `None` once the driver is gone.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// The stream reached a terminal event; nothing to clean up.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Reset the stream with CANCEL. Pending events are discarded.
    pub fn abort(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.commands.send(Command::Reset { stream_id: self.id });
            self.events.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(
        id: u32,
    ) -> (
        Self,
        mpsc::UnboundedSender<StreamEvent>,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let stream = Self {
            id,
            events,
            commands,
            finished: false,
        };
        (stream, events_tx, commands_rx)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Handle to a live driver task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    accepting: Arc<AtomicBool>,
}

impl Session {
    /// Connect, exchange SETTINGS and spawn the driver.
    async fn establish(config: &ClientConfig) -> Result<Self, TransportError> {
        let handshake = async {
            let mut io = transport::connect(config).await?;
            let mut h2 = Connection::new(config.h2.clone());
            io.write_all(&h2.take_pending_send()).await?;

            let mut buf = vec![0u8; READ_BUF_SIZE];
            while !h2.is_ready() {
                let n = io.read(&mut buf).await?;
                if n == 0 {
                    return Err(TransportError::ConnectionClosed);
                }
                h2.recv(&buf[..n])?;
                while h2.poll_event().is_some() {}
            }
            io.write_all(&h2.take_pending_send()).await?;
            io.flush().await?;
            Ok::<_, TransportError>((io, h2))
        };
        let (io, h2) = tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::HandshakeTimeout(config.authority.clone()))??;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let accepting = Arc::new(AtomicBool::new(true));
        let driver = Driver {
            io,
            h2,
            authority: config.authority.clone(),
            commands: commands_rx,
            streams: HashMap::new(),
            queued: VecDeque::new(),
            blocked: VecDeque::new(),
            accepting: accepting.clone(),
        };
        tokio::spawn(driver.run());
        Ok(Self {
            commands,
            accepting,
        })
    }

    /// The driver is running and will accept new streams.
    pub fn is_usable(&self) -> bool {
        !self.commands.is_closed() && self.accepting.load(Ordering::Acquire)
    }

    pub(crate) async fn open(
        &self,
        headers: Vec<HeaderField>,
        body: Bytes,
    ) -> Result<Stream, TransportError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Open {
                headers,
                body,
                events: events_tx,
                reply,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;
        let id = reply_rx
            .await
            .map_err(|_| TransportError::ConnectionClosed)??;
        Ok(Stream {
            id,
            events,
            commands: self.commands.clone(),
            finished: false,
        })
    }

    /// Send GOAWAY, fail outstanding streams and stop the driver.
    async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

/// Owns at most one session for a client and replaces it when it dies.
#[derive(Debug)]
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    /// Return the live session, connecting first if there is none or the
    /// previous one has died. Concurrent first use connects once.
    pub async fn connect(&self) -> Result<Session, TransportError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_usable() {
                return Ok(session.clone());
            }
            tracing::debug!(
                authority = %self.config.authority,
                "session no longer usable, reconnecting"
            );
        }
        let session = Session::establish(&self.config).await.inspect_err(|e| {
            tracing::debug!(authority = %self.config.authority, error = %e, "connect failed");
        })?;
        tracing::debug!(authority = %self.config.authority, "connected");
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Close the session, if any. Calling it again is a no-op.
    pub async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.shutdown().await;
            tracing::debug!(authority = %self.config.authority, "closed");
        }
    }

    /// Whether a usable session is currently held.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(Session::is_usable)
    }

    pub(crate) async fn open_stream(
        &self,
        headers: Vec<HeaderField>,
        body: Bytes,
    ) -> Result<Stream, TransportError> {
        self.connect().await?.open(headers, body).await
    }
}

/// A request waiting for a stream slot under the peer's
/// SETTINGS_MAX_CONCURRENT_STREAMS.
struct QueuedOpen {
    headers: Vec<HeaderField>,
    body: Bytes,
    events: mpsc::UnboundedSender<StreamEvent>,
    reply: oneshot::Sender<Result<u32, TransportError>>,
}

/// Body bytes waiting for flow control credit.
struct BlockedSend {
    stream_id: u32,
    data: Bytes,
}

struct Driver {
    io: Box<dyn Io>,
    h2: Connection,
    authority: String,
    commands: mpsc::UnboundedReceiver<Command>,
    streams: HashMap<u32, mpsc::UnboundedSender<StreamEvent>>,
    queued: VecDeque<QueuedOpen>,
    blocked: VecDeque<BlockedSend>,
    accepting: Arc<AtomicBool>,
}

enum Exit {
    /// Every handle is gone, or the server went away and streams drained.
    Idle,
    Shutdown(oneshot::Sender<()>),
    Failed(TransportError),
}

impl Driver {
    async fn run(mut self) {
        let exit = self.drive().await;
        self.accepting.store(false, Ordering::Release);
        match exit {
            Exit::Idle => {
                tracing::debug!(authority = %self.authority, "session idle, closing");
                self.goodbye().await;
            }
            Exit::Shutdown(reply) => {
                self.fail_all(&TransportError::ConnectionClosed);
                self.goodbye().await;
                let _ = reply.send(());
            }
            Exit::Failed(err) => {
                tracing::warn!(
                    authority = %self.authority,
                    streams = self.streams.len(),
                    error = %err,
                    "connection failed"
                );
                self.fail_all(&err);
                // Best effort: a connection error queues GOAWAY.
                let _ = self.flush().await;
            }
        }
    }

    async fn drive(&mut self) -> Exit {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            self.open_queued();
            if let Err(e) = self.flush().await {
                return Exit::Failed(e);
            }
            if !self.h2.is_accepting_streams() {
                self.accepting.store(false, Ordering::Release);
                self.refuse_queued(&TransportError::ConnectionClosed);
                if self.streams.is_empty() {
                    return Exit::Idle;
                }
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Open { headers, body, events, reply }) => {
                        self.queued.push_back(QueuedOpen { headers, body, events, reply });
                    }
                    Some(Command::Reset { stream_id }) => self.cancel(stream_id),
                    Some(Command::Shutdown { reply }) => return Exit::Shutdown(reply),
                    None => return Exit::Idle,
                },
                read = self.io.read(&mut buf) => match read {
                    Ok(0) => return Exit::Failed(TransportError::ConnectionClosed),
                    Ok(n) => {
                        tracing::trace!(authority = %self.authority, bytes = n, "read");
                        if let Err(e) = self.h2.recv(&buf[..n]) {
                            return Exit::Failed(e.into());
                        }
                        self.dispatch();
                        self.retry_blocked();
                    }
                    Err(e) => return Exit::Failed(e.into()),
                },
            }
        }
    }

    /// Open queued requests while the peer has stream slots free.
    fn open_queued(&mut self) {
        while !self.queued.is_empty() {
            if !self.h2.can_open_stream() {
                if self.h2.is_accepting_streams() && self.h2.has_stream_capacity() {
                    // Stream ids are exhausted; this connection is done.
                    self.accepting.store(false, Ordering::Release);
                    self.refuse_queued(&TransportError::H2(questwire_h2::Error::Connection(
                        ErrorCode::RefusedStream,
                    )));
                } else {
                    tracing::trace!(
                        authority = %self.authority,
                        queued = self.queued.len(),
                        active = self.h2.active_streams(),
                        "waiting for a stream slot"
                    );
                }
                return;
            }
            let Some(QueuedOpen {
                headers,
                body,
                events,
                reply,
            }) = self.queued.pop_front()
            else {
                return;
            };
            if reply.is_closed() {
                continue;
            }
            let opened = self.open(&headers, body, events);
            // The caller gave up (deadline) while the stream was opening.
            if let Err(Ok(stream_id)) = reply.send(opened) {
                self.cancel(stream_id);
            }
        }
    }

    /// Fail every request still waiting for a stream slot.
    fn refuse_queued(&mut self, err: &TransportError) {
        for queued in self.queued.drain(..) {
            let _ = queued.reply.send(Err(err.clone()));
        }
    }

    fn open(
        &mut self,
        headers: &[HeaderField],
        body: Bytes,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<u32, TransportError> {
        let stream_id = self.h2.send_request(headers, body.is_empty())?;
        tracing::trace!(stream_id, "stream opened");
        self.streams.insert(stream_id, events);
        if !body.is_empty() {
            self.send_body(stream_id, body);
        }
        Ok(stream_id)
    }

    fn cancel(&mut self, stream_id: u32) {
        self.blocked.retain(|b| b.stream_id != stream_id);
        if self.streams.remove(&stream_id).is_some()
            && self.h2.reset_stream(stream_id, ErrorCode::Cancel)
        {
            tracing::debug!(stream_id, "stream cancelled");
        }
    }

    /// Queue as much of `data` as flow control allows; park the rest.
    fn send_body(&mut self, stream_id: u32, data: Bytes) {
        match self.h2.send_data(stream_id, &data, true) {
            Ok(n) if n < data.len() => self.blocked.push_back(BlockedSend {
                stream_id,
                data: data.slice(n..),
            }),
            Ok(_) => {}
            Err(e) => self.fail_stream(stream_id, e.into()),
        }
    }

    fn retry_blocked(&mut self) {
        for blocked in std::mem::take(&mut self.blocked) {
            if self.streams.contains_key(&blocked.stream_id) {
                self.send_body(blocked.stream_id, blocked.data);
            }
        }
    }

    /// Route h2 events to their streams.
    fn dispatch(&mut self) {
        while let Some(event) = self.h2.poll_event() {
            match event {
                Event::Response {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    self.deliver(stream_id, StreamEvent::Headers { headers, end_stream });
                    if end_stream {
                        self.streams.remove(&stream_id);
                    }
                }
                Event::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    self.deliver(stream_id, StreamEvent::Data(data));
                    if end_stream {
                        self.deliver(stream_id, StreamEvent::End);
                        self.streams.remove(&stream_id);
                    }
                }
                Event::Trailers { stream_id, headers } => {
                    self.deliver(stream_id, StreamEvent::Trailers(headers));
                    self.streams.remove(&stream_id);
                }
                Event::StreamReset {
                    stream_id,
                    error_code,
                } => {
                    tracing::debug!(stream_id, ?error_code, "stream reset by server");
                    self.fail_stream(stream_id, TransportError::StreamReset(error_code));
                }
                Event::StreamRefused {
                    stream_id,
                    error_code,
                } => {
                    tracing::debug!(stream_id, ?error_code, "stream refused by GOAWAY");
                    self.fail_stream(stream_id, TransportError::GoAway(error_code));
                }
                Event::GoAway {
                    last_stream_id,
                    error_code,
                    ..
                } => {
                    self.accepting.store(false, Ordering::Release);
                    self.refuse_queued(&TransportError::GoAway(error_code));
                    if error_code == ErrorCode::NoError {
                        tracing::debug!(
                            authority = %self.authority,
                            last_stream_id,
                            "server going away"
                        );
                    } else {
                        tracing::warn!(
                            authority = %self.authority,
                            last_stream_id,
                            ?error_code,
                            "server going away"
                        );
                    }
                }
                Event::SettingsAcknowledged => {
                    tracing::trace!(authority = %self.authority, "settings acknowledged");
                }
            }
        }
    }

    fn deliver(&mut self, stream_id: u32, event: StreamEvent) {
        if let Some(events) = self.streams.get(&stream_id) {
            // A closed receiver means the call is gone and will reset.
            let _ = events.send(event);
        }
    }

    fn fail_stream(&mut self, stream_id: u32, err: TransportError) {
        self.blocked.retain(|b| b.stream_id != stream_id);
        if let Some(events) = self.streams.remove(&stream_id) {
            let _ = events.send(StreamEvent::Failed(err));
        }
    }

    fn fail_all(&mut self, err: &TransportError) {
        self.refuse_queued(err);
        self.blocked.clear();
        for (_, events) in self.streams.drain() {
            let _ = events.send(StreamEvent::Failed(err.clone()));
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        if self.h2.has_pending_send() {
            let pending = self.h2.take_pending_send();
            self.io.write_all(&pending).await?;
            self.io.flush().await?;
        }
        Ok(())
    }

    async fn goodbye(&mut self) {
        if !self.h2.is_closed() {
            self.h2.send_goaway(ErrorCode::NoError);
        }
        let _ = self.flush().await;
        let _ = self.io.shutdown().await;
    }
}
