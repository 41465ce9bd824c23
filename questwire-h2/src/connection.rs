//! HTTP/2 client connection state machine.
//!
//! `Connection` is sans-IO: feed transport bytes in with [`Connection::recv`],
//! drain the resulting [`Event`]s with [`Connection::poll_event`], and write
//! whatever [`Connection::take_pending_send`] returns back to the transport.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, ErrorCode};
use crate::flowcontrol::{DEFAULT_WINDOW_SIZE, Window};
use crate::frame::Frame;
use crate::hpack::{Decoder, Encoder, HeaderField};
use crate::settings::Settings;
use crate::stream::Stream;

/// Client connection preface (RFC 7540 Section 3.5).
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Upper bound on the HPACK table we keep for the peer, whatever it allows.
const MAX_ENCODER_TABLE: usize = 4096;
const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// What the peer did, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// First (non-informational) header block on a stream. With
    /// `end_stream` set this is a trailers-only response.
    Response {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Body bytes.
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// Header block after the response headers. Always ends the stream.
    Trailers {
        stream_id: u32,
        headers: Vec<HeaderField>,
    },
    /// The stream was terminated by RST_STREAM.
    StreamReset { stream_id: u32, error_code: ErrorCode },
    /// The stream is above a GOAWAY's `last_stream_id` and was never
    /// processed. `error_code` is the GOAWAY's code.
    StreamRefused { stream_id: u32, error_code: ErrorCode },
    /// The peer will not process streams above `last_stream_id`.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// The peer acknowledged our SETTINGS.
    SettingsAcknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the peer's first SETTINGS frame.
    Handshaking,
    Ready,
    /// GOAWAY sent or received; no new streams.
    Closing,
    /// A connection error occurred; nothing more is processed.
    Closed,
}

/// A header block spread over HEADERS + CONTINUATION frames.
#[derive(Debug)]
struct PartialBlock {
    stream_id: u32,
    block: Vec<u8>,
    end_stream: bool,
}

/// Client side of one HTTP/2 connection.
#[derive(Debug)]
pub struct Connection {
    state: State,
    local: Settings,
    remote: Settings,
    streams: HashMap<u32, Stream>,
    next_stream_id: u32,
    recv_window: Window,
    send_window: Window,
    encoder: Encoder,
    decoder: Decoder,
    /// No other frame may interleave with an unfinished header block.
    continuation: Option<PartialBlock>,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    events: VecDeque<Event>,
}

impl Connection {
    /// Create a connection and queue the preface: magic, our SETTINGS, and a
    /// connection WINDOW_UPDATE when our window exceeds the default.
    pub fn new(settings: Settings) -> Self {
        let mut send_buf = CLIENT_PREFACE.to_vec();
        Frame::settings(&settings).encode(&mut send_buf);

        let window = i64::from(settings.initial_window_size);
        if window > DEFAULT_WINDOW_SIZE {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: (window - DEFAULT_WINDOW_SIZE) as u32,
            }
            .encode(&mut send_buf);
        }

        Self {
            state: State::Handshaking,
            decoder: Decoder::new(settings.header_table_size as usize),
            encoder: Encoder::new(MAX_ENCODER_TABLE),
            local: settings,
            remote: Settings::default(),
            streams: HashMap::new(),
            next_stream_id: 1,
            recv_window: Window::new(window.max(DEFAULT_WINDOW_SIZE)),
            send_window: Window::default(),
            continuation: None,
            recv_buf: Vec::new(),
            send_buf,
            events: VecDeque::new(),
        }
    }

    /// Feed bytes read from the transport.
    ///
    /// An error is a connection error: GOAWAY is queued, the connection is
    /// closed, and every later call fails.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == State::Closed {
            return Err(Error::Connection(ErrorCode::NoError));
        }
        self.recv_buf.extend_from_slice(data);
        let mut offset = 0;
        let result = loop {
            match Frame::decode(&self.recv_buf[offset..], self.local.max_frame_size) {
                Ok(Some((frame, used))) => {
                    offset += used;
                    if let Err(e) = self.handle_frame(frame) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.recv_buf.drain(..offset);
        if let Err(e) = &result {
            self.abort(e.code());
        }
        result
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Bytes to write to the transport.
    pub fn take_pending_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.send_buf)
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// The peer's SETTINGS have arrived.
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// New streams may be opened.
    pub fn is_accepting_streams(&self) -> bool {
        matches!(self.state, State::Handshaking | State::Ready)
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Streams that are neither finished nor reset.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }

    /// The peer's SETTINGS_MAX_CONCURRENT_STREAMS leaves room for another
    /// stream. Stream slots free up as streams finish or are reset.
    pub fn has_stream_capacity(&self) -> bool {
        self.remote
            .max_concurrent_streams
            .is_none_or(|limit| self.streams.len() < limit as usize)
    }

    /// `send_request` would succeed now.
    pub fn can_open_stream(&self) -> bool {
        self.is_accepting_streams()
            && self.has_stream_capacity()
            && self.next_stream_id <= MAX_STREAM_ID
    }

    /// Open a stream with `headers` (pseudo-headers first). Returns its id.
    ///
    /// Fails with `RefusedStream` when the connection is closing, the
    /// stream id space is exhausted, or the peer's concurrency limit is
    /// reached; check [`Connection::can_open_stream`] first to wait instead.
    pub fn send_request(
        &mut self,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<u32, Error> {
        if !self.can_open_stream() {
            return Err(Error::Connection(ErrorCode::RefusedStream));
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let mut block = Vec::new();
        self.encoder.encode(headers, &mut block);
        self.write_header_block(stream_id, block, end_stream);

        let mut stream = Stream::new(
            i64::from(self.local.initial_window_size),
            i64::from(self.remote.initial_window_size),
        );
        if end_stream {
            stream.close_local();
        }
        self.streams.insert(stream_id, stream);
        Ok(stream_id)
    }

    /// Split a header block into HEADERS + CONTINUATION frames that fit the
    /// peer's frame size.
    fn write_header_block(&mut self, stream_id: u32, block: Vec<u8>, end_stream: bool) {
        let max = self.remote.max_frame_size as usize;
        if block.len() <= max {
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers: true,
            }
            .encode(&mut self.send_buf);
            return;
        }
        let mut chunks = block.chunks(max).peekable();
        let first = chunks.next().unwrap_or_default();
        Frame::Headers {
            stream_id,
            block: first.to_vec(),
            end_stream,
            end_headers: false,
        }
        .encode(&mut self.send_buf);
        while let Some(chunk) = chunks.next() {
            Frame::Continuation {
                stream_id,
                block: chunk.to_vec(),
                end_headers: chunks.peek().is_none(),
            }
            .encode(&mut self.send_buf);
        }
    }

    /// Bytes that may currently be sent on `stream_id`.
    pub fn send_capacity(&self, stream_id: u32) -> usize {
        self.streams
            .get(&stream_id)
            .filter(|s| s.can_send())
            .map_or(0, |s| s.send_window.available().min(self.send_window.available()))
    }

    /// Send body bytes on a stream, as much as flow control allows.
    ///
    /// Returns how many bytes of `data` were queued; the caller keeps the
    /// rest and retries after the peer opens the window. `end_stream` only
    /// takes effect once the final byte is queued.
    pub fn send_data(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> Result<usize, Error> {
        let capacity = self.send_capacity(stream_id);
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.can_send())
            .ok_or(Error::Stream(stream_id, ErrorCode::StreamClosed))?;

        let n = data.len().min(capacity);
        if n == 0 && !data.is_empty() {
            return Ok(0);
        }
        stream.send_window.consume(n)?;
        self.send_window.consume(n)?;

        let finished = end_stream && n == data.len();
        let max = self.remote.max_frame_size as usize;
        let mut chunks = data[..n].chunks(max).peekable();
        if chunks.peek().is_none() {
            Frame::Data {
                stream_id,
                payload: Vec::new(),
                end_stream: finished,
            }
            .encode(&mut self.send_buf);
        }
        while let Some(chunk) = chunks.next() {
            Frame::Data {
                stream_id,
                payload: chunk.to_vec(),
                end_stream: finished && chunks.peek().is_none(),
            }
            .encode(&mut self.send_buf);
        }

        if finished && stream.close_local() {
            self.streams.remove(&stream_id);
        }
        Ok(n)
    }

    /// Abort a stream with RST_STREAM. Returns false if the stream was
    /// already finished, in which case nothing is sent.
    pub fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> bool {
        if self.streams.remove(&stream_id).is_none() {
            return false;
        }
        Frame::RstStream {
            stream_id,
            error_code,
        }
        .encode(&mut self.send_buf);
        true
    }

    pub fn send_ping(&mut self, opaque_data: [u8; 8]) {
        Frame::Ping {
            ack: false,
            opaque_data,
        }
        .encode(&mut self.send_buf);
    }

    /// Start a graceful shutdown. Open streams may still complete.
    pub fn send_goaway(&mut self, error_code: ErrorCode) {
        // No server-initiated streams are ever accepted.
        Frame::GoAway {
            last_stream_id: 0,
            error_code,
            debug_data: Vec::new(),
        }
        .encode(&mut self.send_buf);
        if self.state != State::Closed {
            self.state = State::Closing;
        }
    }

    fn abort(&mut self, code: ErrorCode) {
        if self.state != State::Closed {
            self.send_goaway(code);
            self.state = State::Closed;
        }
        self.streams.clear();
    }

    // -- Frame handling --

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if let Some(partial) = &self.continuation {
            let expected = partial.stream_id;
            match frame {
                Frame::Continuation { stream_id, .. } if stream_id == expected => {}
                _ => return Err(Error::Protocol("expected CONTINUATION".into())),
            }
        }

        match frame {
            Frame::Settings { ack: true, .. } => {
                self.events.push_back(Event::SettingsAcknowledged);
            }
            Frame::Settings { ack: false, payload } => self.handle_settings(&payload)?,
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.finish_header_block(stream_id, &block, end_stream)?;
                } else {
                    self.continuation = Some(PartialBlock {
                        stream_id,
                        block,
                        end_stream,
                    });
                }
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let Some(partial) = self.continuation.as_mut() else {
                    return Err(Error::Protocol("unexpected CONTINUATION".into()));
                };
                partial.block.extend_from_slice(&block);
                if end_headers
                    && let Some(partial) = self.continuation.take()
                {
                    self.finish_header_block(stream_id, &partial.block, partial.end_stream)?;
                }
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => self.handle_data(stream_id, payload, end_stream)?,
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if self.streams.remove(&stream_id).is_some() {
                    self.events.push_back(Event::StreamReset {
                        stream_id,
                        error_code,
                    });
                }
            }
            Frame::Ping { ack, opaque_data } => {
                if !ack {
                    Frame::Ping {
                        ack: true,
                        opaque_data,
                    }
                    .encode(&mut self.send_buf);
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => self.handle_goaway(last_stream_id, error_code, debug_data),
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => self.send_window.increase(increment)?,
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_window.increase(increment)?;
                }
            }
            Frame::PushPromise { .. } => {
                return Err(Error::Protocol("PUSH_PROMISE with push disabled".into()));
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn handle_settings(&mut self, payload: &[u8]) -> Result<(), Error> {
        let old_window = i64::from(self.remote.initial_window_size);
        self.remote.apply(payload)?;
        let delta = i64::from(self.remote.initial_window_size) - old_window;
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window.shift(delta)?;
            }
        }
        self.encoder
            .set_max_table_size((self.remote.header_table_size as usize).min(MAX_ENCODER_TABLE));

        Frame::settings_ack().encode(&mut self.send_buf);
        if self.state == State::Handshaking {
            self.state = State::Ready;
        }
        Ok(())
    }

    fn finish_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) -> Result<(), Error> {
        // Decode even for unknown streams: the HPACK state is shared by the
        // whole connection.
        let headers = self.decoder.decode(block)?;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if !stream.can_recv() {
            self.reset_closed(stream_id);
            return Ok(());
        }

        let informational = headers
            .iter()
            .any(|h| h.name == b":status" && h.value.first() == Some(&b'1'));
        if informational && !end_stream {
            return Ok(());
        }

        let event = if stream.response_seen {
            Event::Trailers { stream_id, headers }
        } else {
            stream.response_seen = true;
            Event::Response {
                stream_id,
                headers,
                end_stream,
            }
        };
        if end_stream && stream.close_remote() {
            self.streams.remove(&stream_id);
        }
        self.events.push_back(event);
        Ok(())
    }

    fn handle_data(
        &mut self,
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
    ) -> Result<(), Error> {
        let len = payload.len();
        self.recv_window.consume(len)?;
        let target = i64::from(self.local.initial_window_size).max(DEFAULT_WINDOW_SIZE);
        if let Some(increment) = self.recv_window.replenish(target) {
            self.recv_window.increase(increment)?;
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            }
            .encode(&mut self.send_buf);
        }

        // Frames for streams we reset or never opened only cost window.
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if !stream.can_recv() {
            self.reset_closed(stream_id);
            return Ok(());
        }
        stream.recv_window.consume(len)?;

        if end_stream {
            if stream.close_remote() {
                self.streams.remove(&stream_id);
            }
        } else if let Some(increment) = stream
            .recv_window
            .replenish(i64::from(self.local.initial_window_size))
        {
            stream.recv_window.increase(increment)?;
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
            .encode(&mut self.send_buf);
        }

        self.events.push_back(Event::Data {
            stream_id,
            data: payload,
            end_stream,
        });
        Ok(())
    }

    /// The peer kept sending after END_STREAM: a stream error, not a
    /// connection error.
    fn reset_closed(&mut self, stream_id: u32) {
        self.reset_stream(stream_id, ErrorCode::StreamClosed);
        self.events.push_back(Event::StreamReset {
            stream_id,
            error_code: ErrorCode::StreamClosed,
        });
    }

    fn handle_goaway(&mut self, last_stream_id: u32, error_code: ErrorCode, debug_data: Vec<u8>) {
        if self.state != State::Closed {
            self.state = State::Closing;
        }
        let mut refused: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        refused.sort_unstable();
        for stream_id in refused {
            self.streams.remove(&stream_id);
            self.events.push_back(Event::StreamRefused {
                stream_id,
                error_code,
            });
        }
        self.events.push_back(Event::GoAway {
            last_stream_id,
            error_code,
            debug_data,
        });
    }

    #[cfg(test)]
    pub(crate) fn stream_state(&self, stream_id: u32) -> Option<crate::stream::StreamState> {
        self.streams.get(&stream_id).map(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;
    use crate::frame::{FRAME_CONTINUATION, FRAME_DATA, FRAME_HEADERS, FRAME_SETTINGS, FrameHeader};

    fn frames(buf: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut rest = buf;
        while let Some((frame, used)) = Frame::decode(rest, 1 << 24).unwrap() {
            out.push(frame);
            rest = &rest[used..];
        }
        assert!(rest.is_empty());
        out
    }

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        buf
    }

    fn ready(settings: Settings) -> Connection {
        let mut conn = Connection::new(Settings::client_default());
        conn.take_pending_send();
        conn.recv(&encode(Frame::settings(&settings))).unwrap();
        conn.take_pending_send();
        conn
    }

    fn response_block(headers: &[HeaderField]) -> Vec<u8> {
        let mut block = Vec::new();
        Encoder::new(4096).encode(headers, &mut block);
        block
    }

    fn post() -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", "POST"),
            HeaderField::new(":path", "/svc/Method"),
        ]
    }

    #[test]
    fn preface_carries_settings_and_window() {
        let mut conn = Connection::new(Settings::client_default());
        let send = conn.take_pending_send();
        assert!(send.starts_with(CLIENT_PREFACE));
        let frames = frames(&send[CLIENT_PREFACE.len()..]);
        assert!(matches!(frames[0], Frame::Settings { ack: false, .. }));
        assert_eq!(
            frames[1],
            Frame::WindowUpdate {
                stream_id: 0,
                increment: (1 << 20) - 65_535,
            }
        );
    }

    #[test]
    fn settings_are_acknowledged() {
        let mut conn = Connection::new(Settings::client_default());
        conn.take_pending_send();
        assert!(!conn.is_ready());
        conn.recv(&encode(Frame::settings(&Settings::default())))
            .unwrap();
        assert!(conn.is_ready());
        let send = conn.take_pending_send();
        let header = FrameHeader::decode(&send).unwrap();
        assert_eq!(header.frame_type, FRAME_SETTINGS);
        assert_eq!(frames(&send), [Frame::settings_ack()]);

        conn.recv(&encode(Frame::settings_ack())).unwrap();
        assert_eq!(conn.poll_event(), Some(Event::SettingsAcknowledged));
    }

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let mut conn = ready(Settings::default());
        let ids: Vec<u32> = (0..3)
            .map(|_| conn.send_request(&post(), true).unwrap())
            .collect();
        assert_eq!(ids, [1, 3, 5]);
    }

    #[test]
    fn unary_exchange_closes_the_stream() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), false).unwrap();
        assert_eq!(conn.send_data(id, b"\0\0\0\0\0", true).unwrap(), 5);
        assert_eq!(conn.stream_state(id), Some(StreamState::HalfClosedLocal));
        let sent = frames(&conn.take_pending_send());
        assert!(matches!(sent[0], Frame::Headers { end_stream: false, .. }));
        assert!(matches!(sent[1], Frame::Data { end_stream: true, .. }));

        let mut inbound = encode(Frame::Headers {
            stream_id: id,
            block: response_block(&[HeaderField::new(":status", "200")]),
            end_stream: false,
            end_headers: true,
        });
        inbound.extend(encode(Frame::Data {
            stream_id: id,
            payload: b"body".to_vec(),
            end_stream: false,
        }));
        inbound.extend(encode(Frame::Headers {
            stream_id: id,
            block: response_block(&[HeaderField::new("grpc-status", "0")]),
            end_stream: true,
            end_headers: true,
        }));
        conn.recv(&inbound).unwrap();

        assert!(matches!(conn.poll_event(), Some(Event::Response { end_stream: false, .. })));
        assert!(matches!(conn.poll_event(), Some(Event::Data { ref data, .. }) if data == b"body"));
        match conn.poll_event() {
            Some(Event::Trailers { stream_id, headers }) => {
                assert_eq!(stream_id, id);
                assert_eq!(headers, [HeaderField::new("grpc-status", "0")]);
            }
            other => panic!("expected trailers, got {other:?}"),
        }
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn trailers_only_response() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), true).unwrap();
        conn.recv(&encode(Frame::Headers {
            stream_id: id,
            block: response_block(&[
                HeaderField::new(":status", "200"),
                HeaderField::new("grpc-status", "5"),
            ]),
            end_stream: true,
            end_headers: true,
        }))
        .unwrap();
        assert!(matches!(conn.poll_event(), Some(Event::Response { end_stream: true, .. })));
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn continuation_frames_are_reassembled() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), true).unwrap();
        let block = response_block(&[
            HeaderField::new(":status", "200"),
            HeaderField::new("x-long", "v".repeat(40)),
        ]);
        let (head, tail) = block.split_at(3);
        let mut inbound = encode(Frame::Headers {
            stream_id: id,
            block: head.to_vec(),
            end_stream: false,
            end_headers: false,
        });
        inbound.extend(encode(Frame::Continuation {
            stream_id: id,
            block: tail.to_vec(),
            end_headers: true,
        }));
        conn.recv(&inbound).unwrap();
        match conn.poll_event() {
            Some(Event::Response { headers, .. }) => assert_eq!(headers.len(), 2),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn interleaving_a_header_block_is_fatal() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), true).unwrap();
        let mut inbound = encode(Frame::Headers {
            stream_id: id,
            block: vec![0x88],
            end_stream: false,
            end_headers: false,
        });
        inbound.extend(encode(Frame::Ping {
            ack: false,
            opaque_data: [0; 8],
        }));
        assert!(matches!(conn.recv(&inbound), Err(Error::Protocol(_))));
        assert!(conn.is_closed());
        let sent = frames(&conn.take_pending_send());
        assert!(matches!(
            sent.last(),
            Some(Frame::GoAway {
                error_code: ErrorCode::ProtocolError,
                ..
            })
        ));
    }

    #[test]
    fn large_header_blocks_use_continuation() {
        let mut conn = ready(Settings::default());
        let mut headers = post();
        headers.push(HeaderField::new("x-big", "z".repeat(40_000)));
        conn.send_request(&headers, true).unwrap();
        let send = conn.take_pending_send();
        let first = FrameHeader::decode(&send).unwrap();
        assert_eq!(first.frame_type, FRAME_HEADERS);
        assert_eq!(first.length, 16_384);
        let sent = frames(&send);
        assert!(sent.len() >= 3);
        assert!(matches!(
            sent.last(),
            Some(Frame::Continuation {
                end_headers: true,
                ..
            })
        ));
        let continuation = FrameHeader::decode(&send[9 + 16_384..]).unwrap();
        assert_eq!(continuation.frame_type, FRAME_CONTINUATION);
    }

    #[test]
    fn send_data_respects_windows_and_frame_size() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), false).unwrap();
        conn.take_pending_send();

        let body = vec![7u8; 70_000];
        let queued = conn.send_data(id, &body, true).unwrap();
        assert_eq!(queued, 65_535);
        let send = conn.take_pending_send();
        let sent = frames(&send);
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|f| matches!(f, Frame::Data { end_stream: false, .. })));
        assert_eq!(FrameHeader::decode(&send).unwrap().frame_type, FRAME_DATA);
        assert_eq!(conn.send_capacity(id), 0);
        assert_eq!(conn.send_data(id, &body[queued..], true).unwrap(), 0);

        let mut updates = encode(Frame::WindowUpdate {
            stream_id: 0,
            increment: 10_000,
        });
        updates.extend(encode(Frame::WindowUpdate {
            stream_id: id,
            increment: 10_000,
        }));
        conn.recv(&updates).unwrap();
        assert_eq!(conn.send_capacity(id), 10_000);
        assert_eq!(conn.send_data(id, &body[queued..], true).unwrap(), 4_465);
        assert!(matches!(
            frames(&conn.take_pending_send()).last(),
            Some(Frame::Data {
                end_stream: true,
                ..
            })
        ));
    }

    #[test]
    fn reset_forgets_the_stream_but_keeps_hpack_in_sync() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), true).unwrap();
        assert!(conn.reset_stream(id, ErrorCode::Cancel));
        assert!(!conn.reset_stream(id, ErrorCode::Cancel));
        let sent = frames(&conn.take_pending_send());
        assert!(sent.contains(&Frame::RstStream {
            stream_id: id,
            error_code: ErrorCode::Cancel,
        }));

        // The server's late response inserts into the dynamic table; a later
        // response that references it must still decode.
        let mut server = Encoder::new(4096);
        let mut late = Vec::new();
        server.encode(&[HeaderField::new("x-trace", "abc")], &mut late);
        conn.recv(&encode(Frame::Headers {
            stream_id: id,
            block: late,
            end_stream: false,
            end_headers: true,
        }))
        .unwrap();
        conn.recv(&encode(Frame::Data {
            stream_id: id,
            payload: vec![0; 100],
            end_stream: true,
        }))
        .unwrap();
        assert_eq!(conn.poll_event(), None);

        let next = conn.send_request(&post(), true).unwrap();
        let mut block = Vec::new();
        server.encode(
            &[
                HeaderField::new(":status", "200"),
                HeaderField::new("x-trace", "abc"),
            ],
            &mut block,
        );
        conn.recv(&encode(Frame::Headers {
            stream_id: next,
            block,
            end_stream: false,
            end_headers: true,
        }))
        .unwrap();
        match conn.poll_event() {
            Some(Event::Response { headers, .. }) => {
                assert_eq!(headers[1], HeaderField::new("x-trace", "abc"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn peer_reset_is_reported() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), true).unwrap();
        conn.recv(&encode(Frame::RstStream {
            stream_id: id,
            error_code: ErrorCode::RefusedStream,
        }))
        .unwrap();
        assert_eq!(
            conn.poll_event(),
            Some(Event::StreamReset {
                stream_id: id,
                error_code: ErrorCode::RefusedStream,
            })
        );
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn goaway_refuses_later_streams() {
        let mut conn = ready(Settings::default());
        let a = conn.send_request(&post(), true).unwrap();
        let b = conn.send_request(&post(), true).unwrap();
        conn.recv(&encode(Frame::GoAway {
            last_stream_id: a,
            error_code: ErrorCode::NoError,
            debug_data: Vec::new(),
        }))
        .unwrap();
        assert_eq!(
            conn.poll_event(),
            Some(Event::StreamRefused {
                stream_id: b,
                error_code: ErrorCode::NoError,
            })
        );
        assert!(matches!(conn.poll_event(), Some(Event::GoAway { .. })));
        assert!(!conn.is_accepting_streams());
        assert_eq!(conn.active_streams(), 1);
        assert!(conn.send_request(&post(), true).is_err());
    }

    #[test]
    fn concurrency_limit_frees_slots_as_streams_finish() {
        let mut conn = ready(Settings {
            max_concurrent_streams: Some(1),
            ..Settings::default()
        });
        let a = conn.send_request(&post(), true).unwrap();
        assert!(!conn.has_stream_capacity());
        assert!(!conn.can_open_stream());
        assert!(conn.send_request(&post(), true).is_err());

        conn.recv(&encode(Frame::Headers {
            stream_id: a,
            block: response_block(&[
                HeaderField::new(":status", "200"),
                HeaderField::new("grpc-status", "0"),
            ]),
            end_stream: true,
            end_headers: true,
        }))
        .unwrap();
        assert_eq!(conn.active_streams(), 0);
        assert!(conn.can_open_stream());
        let b = conn.send_request(&post(), true).unwrap();
        assert_eq!(b, a + 2);

        conn.reset_stream(b, ErrorCode::Cancel);
        assert!(conn.can_open_stream());

        conn.recv(&encode(Frame::settings(&Settings {
            max_concurrent_streams: Some(0),
            ..Settings::default()
        })))
        .unwrap();
        assert!(!conn.can_open_stream());
    }

    #[test]
    fn ping_is_answered() {
        let mut conn = ready(Settings::default());
        conn.recv(&encode(Frame::Ping {
            ack: false,
            opaque_data: *b"12345678",
        }))
        .unwrap();
        assert_eq!(
            frames(&conn.take_pending_send()),
            [Frame::Ping {
                ack: true,
                opaque_data: *b"12345678",
            }]
        );
    }

    #[test]
    fn receive_window_is_replenished() {
        let mut conn = Connection::new(Settings::default());
        conn.take_pending_send();
        conn.recv(&encode(Frame::settings(&Settings::default())))
            .unwrap();
        conn.take_pending_send();
        let id = conn.send_request(&post(), true).unwrap();
        conn.take_pending_send();

        let mut inbound = Vec::new();
        for _ in 0..4 {
            inbound.extend(encode(Frame::Data {
                stream_id: id,
                payload: vec![0; 10_000],
                end_stream: false,
            }));
        }
        conn.recv(&inbound).unwrap();
        let updates: Vec<Frame> = frames(&conn.take_pending_send());
        assert!(updates.contains(&Frame::WindowUpdate {
            stream_id: 0,
            increment: 40_000,
        }));
        assert!(updates.contains(&Frame::WindowUpdate {
            stream_id: id,
            increment: 40_000,
        }));
    }

    #[test]
    fn push_promise_is_a_connection_error() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), true).unwrap();
        let err = conn
            .recv(&encode(Frame::PushPromise {
                stream_id: id,
                promised_stream_id: 2,
            }))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(conn.recv(&[]).is_err());
    }

    #[test]
    fn peer_window_change_shifts_open_streams() {
        let mut conn = ready(Settings::default());
        let id = conn.send_request(&post(), false).unwrap();
        conn.recv(&encode(Frame::settings(&Settings {
            initial_window_size: 1000,
            ..Settings::default()
        })))
        .unwrap();
        assert_eq!(conn.send_capacity(id), 1000);
    }
}
