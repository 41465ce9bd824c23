//! Mock gRPC server for integration tests.
//!
//! Speaks just enough HTTP/2 over TLS (frames and HPACK from questwire-h2)
//! to accept unary requests and play back a scripted reply per request.
//! Everything the client sends that matters to the tests (requests,
//! RST_STREAM, GOAWAY, connection count) is recorded in a [`Log`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet, OneofDescriptorProto,
};
use questwire_grpc::{ClientConfig, Credential, GrpcClient, SchemaRegistry, SchemaSource};
use questwire_h2::connection::CLIENT_PREFACE;
use questwire_h2::hpack::{Decoder, Encoder, find};
use questwire_h2::{ErrorCode, Frame, HeaderField, Settings};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

// -- Schema --

fn field(
    name: &str,
    number: i32,
    ty: Type,
    label: Label,
    type_name: Option<&str>,
) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.into()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(ty as i32),
        type_name: type_name.map(Into::into),
        ..Default::default()
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.into()),
        field: fields,
        ..Default::default()
    }
}

/// `Quest`, whose `bonus` is a proto3 `optional` field: explicit presence
/// through a synthetic oneof.
fn quest() -> DescriptorProto {
    let mut bonus = field("bonus", 4, Type::Int64, Label::Optional, None);
    bonus.proto3_optional = Some(true);
    bonus.oneof_index = Some(0);
    let mut quest = message(
        "Quest",
        vec![
            field("id", 1, Type::String, Label::Optional, None),
            field("state", 2, Type::Enum, Label::Optional, Some(".game.QuestState")),
            field("reward", 3, Type::Int64, Label::Optional, None),
            bonus,
        ],
    );
    quest.oneof_decl = vec![OneofDescriptorProto {
        name: Some("_bonus".into()),
        ..Default::default()
    }];
    quest
}

/// `game.proto` with `QuestRequest`, `Quest`, `QuestList` and `Empty`.
pub fn game_schema() -> FileDescriptorSet {
    let state = EnumDescriptorProto {
        name: Some("QuestState".into()),
        value: ["QUEST_STATE_UNSPECIFIED", "ACTIVE", "DONE"]
            .iter()
            .enumerate()
            .map(|(i, n)| EnumValueDescriptorProto {
                name: Some((*n).into()),
                number: Some(i as i32),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    FileDescriptorSet {
        file: vec![FileDescriptorProto {
            name: Some("game.proto".into()),
            package: Some("game".into()),
            syntax: Some("proto3".into()),
            enum_type: vec![state],
            message_type: vec![
                message(
                    "QuestRequest",
                    vec![
                        field("quest_id", 1, Type::String, Label::Optional, None),
                        field("account_id", 2, Type::Int64, Label::Optional, None),
                    ],
                ),
                quest(),
                message(
                    "QuestList",
                    vec![field("data", 1, Type::Message, Label::Repeated, Some(".game.Quest"))],
                ),
                message("Empty", Vec::new()),
            ],
            ..Default::default()
        }],
    }
}

pub fn registry() -> SchemaRegistry {
    SchemaRegistry::load([SchemaSource::Set(game_schema())]).unwrap()
}

// -- Wire helpers --

pub fn grpc_frame(flag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![flag];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Framed, uncompressed encoding of `value` as `type_name`.
pub fn encode(type_name: &str, value: &serde_json::Value) -> Vec<u8> {
    let desc = registry().lookup(type_name).unwrap();
    questwire_grpc::codec::encode(&desc, value).unwrap().to_vec()
}

// -- Scripted replies --

/// One action of a scripted reply.
#[derive(Debug, Clone)]
pub enum Step {
    Headers {
        fields: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        payload: Vec<u8>,
        end_stream: bool,
    },
    Trailers(Vec<(String, String)>),
    Reset(ErrorCode),
    /// GOAWAY that lets this stream finish.
    GoAway(ErrorCode),
    /// GOAWAY whose last stream id is below this stream, refusing it.
    Refuse(ErrorCode),
    Sleep(Duration),
    /// Close the whole connection.
    CloseConnection,
    /// Stop replying; the stream stays open.
    Hang,
}

fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn response_headers() -> Step {
    Step::Headers {
        fields: fields(&[(":status", "200"), ("content-type", "application/grpc")]),
        end_stream: false,
    }
}

pub fn trailers(code: u32, message: &str) -> Step {
    let code = code.to_string();
    let mut pairs = vec![("grpc-status", code.as_str())];
    if !message.is_empty() {
        pairs.push(("grpc-message", message));
    }
    Step::Trailers(fields(&pairs))
}

pub fn data(payload: Vec<u8>) -> Step {
    Step::Data {
        payload,
        end_stream: false,
    }
}

/// Headers, one DATA frame carrying `body`, OK trailers.
pub fn ok(body: Vec<u8>) -> Vec<Step> {
    vec![response_headers(), data(body), trailers(0, "")]
}

/// Response headers that already carry a failure status; the body and
/// trailers still follow.
pub fn headers_with_status(code: u32, message: &str) -> Step {
    let code = code.to_string();
    Step::Headers {
        fields: fields(&[
            (":status", "200"),
            ("content-type", "application/grpc"),
            ("grpc-status", &code),
            ("grpc-message", message),
        ]),
        end_stream: false,
    }
}

/// A trailers-only response carrying `code`.
pub fn status_only(code: u32, message: &str) -> Vec<Step> {
    let code = code.to_string();
    vec![Step::Headers {
        fields: fields(&[
            (":status", "200"),
            ("content-type", "application/grpc"),
            ("grpc-status", &code),
            ("grpc-message", message),
        ]),
        end_stream: true,
    }]
}

// -- Server --

/// A request as received by the server.
#[derive(Debug, Clone)]
pub struct Request {
    pub stream_id: u32,
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<String> {
        find(&self.headers, name).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn path(&self) -> String {
        self.header(":path").unwrap_or_default()
    }

    /// The request message decoded as `type_name`.
    pub fn message(&self, type_name: &str) -> serde_json::Value {
        let desc = registry().lookup(type_name).unwrap();
        let payload = questwire_grpc::codec::decode(&self.body).unwrap().unwrap();
        questwire_grpc::codec::to_json(&desc, &payload).unwrap()
    }
}

#[derive(Debug, Default)]
pub struct Log {
    pub connections: usize,
    pub requests: Vec<Request>,
    pub resets: Vec<(u32, ErrorCode)>,
    pub goaways: Vec<ErrorCode>,
}

type Handler = Arc<dyn Fn(&Request) -> Vec<Step> + Send + Sync>;

enum Out {
    Frame(Frame),
    Step(u32, Step),
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub cert: CertificateDer<'static>,
    log: Arc<Mutex<Log>>,
}

impl MockServer {
    pub async fn start(handler: impl Fn(&Request) -> Vec<Step> + Send + Sync + 'static) -> Self {
        Self::start_with(Settings::default(), handler).await
    }

    /// Start a server that advertises `settings` to every connection.
    pub async fn start_with(
        settings: Settings,
        handler: impl Fn(&Request) -> Vec<Step> + Send + Sync + 'static,
    ) -> Self {
        let (cert, key) = generate_self_signed();
        let acceptor = TlsAcceptor::from(server_tls_config(cert.clone(), key));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Log::default()));
        let handler: Handler = Arc::new(handler);

        let accept_log = log.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accept_log.lock().unwrap().connections += 1;
                tokio::spawn(serve(
                    tcp,
                    acceptor.clone(),
                    settings.clone(),
                    handler.clone(),
                    accept_log.clone(),
                ));
            }
        });

        Self { addr, cert, log }
    }

    /// Client config trusting this server's certificate. Connects by IP and
    /// verifies the certificate against `localhost`.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.addr.to_string())
            .server_name("localhost")
            .add_root_certificate(self.cert.clone())
            .credential(Credential::bearer("test-token").unwrap())
            .timeout(Duration::from_secs(5))
    }

    pub fn client(&self) -> GrpcClient {
        GrpcClient::new(self.config(), registry()).unwrap()
    }

    pub fn log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap()
    }

    /// Poll the log until `done` holds, failing after a few seconds.
    pub async fn wait_for(&self, what: &str, done: impl Fn(&Log) -> bool) {
        for _ in 0..500 {
            if done(&self.log()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}: {:?}", *self.log());
    }
}

fn generate_self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (CertificateDer::from(cert.cert), key.into())
}

fn server_tls_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
) -> Arc<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Arc::new(config)
}

async fn serve(
    tcp: TcpStream,
    acceptor: TlsAcceptor,
    settings: Settings,
    handler: Handler,
    log: Arc<Mutex<Log>>,
) {
    let Ok(tls) = acceptor.accept(tcp).await else {
        return;
    };
    let (mut reader, writer) = tokio::io::split(tls);
    let (out, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, out_rx));
    let _ = out.send(Out::Frame(Frame::settings(&settings)));

    let mut decoder = Decoder::new(4096);
    let mut inbound = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    let mut preface_seen = false;
    let mut open: HashMap<u32, Request> = HashMap::new();
    let mut partial: Option<(u32, Vec<u8>, bool)> = None;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        inbound.extend_from_slice(&chunk[..n]);
        if !preface_seen {
            if inbound.len() < CLIENT_PREFACE.len() {
                continue;
            }
            assert!(inbound.starts_with(CLIENT_PREFACE), "bad client preface");
            inbound.drain(..CLIENT_PREFACE.len());
            preface_seen = true;
        }

        while let Some((frame, used)) = Frame::decode(&inbound, 1 << 20).unwrap() {
            inbound.drain(..used);
            let finished = match frame {
                Frame::Settings { ack: false, .. } => {
                    let _ = out.send(Out::Frame(Frame::settings_ack()));
                    None
                }
                Frame::Ping {
                    ack: false,
                    opaque_data,
                } => {
                    let _ = out.send(Out::Frame(Frame::Ping {
                        ack: true,
                        opaque_data,
                    }));
                    None
                }
                Frame::Headers {
                    stream_id,
                    block,
                    end_stream,
                    end_headers,
                } => {
                    if end_headers {
                        let headers = decoder.decode(&block).unwrap();
                        open.insert(
                            stream_id,
                            Request {
                                stream_id,
                                headers,
                                body: Vec::new(),
                            },
                        );
                        end_stream.then_some(stream_id)
                    } else {
                        partial = Some((stream_id, block, end_stream));
                        None
                    }
                }
                Frame::Continuation {
                    stream_id,
                    block,
                    end_headers,
                } => {
                    let (_, mut whole, end_stream) = partial.take().unwrap();
                    whole.extend_from_slice(&block);
                    if end_headers {
                        let headers = decoder.decode(&whole).unwrap();
                        open.insert(
                            stream_id,
                            Request {
                                stream_id,
                                headers,
                                body: Vec::new(),
                            },
                        );
                        end_stream.then_some(stream_id)
                    } else {
                        partial = Some((stream_id, whole, end_stream));
                        None
                    }
                }
                Frame::Data {
                    stream_id,
                    payload,
                    end_stream,
                } => {
                    if let Some(request) = open.get_mut(&stream_id) {
                        request.body.extend_from_slice(&payload);
                    }
                    end_stream.then_some(stream_id)
                }
                Frame::RstStream {
                    stream_id,
                    error_code,
                } => {
                    open.remove(&stream_id);
                    log.lock().unwrap().resets.push((stream_id, error_code));
                    None
                }
                Frame::GoAway { error_code, .. } => {
                    log.lock().unwrap().goaways.push(error_code);
                    None
                }
                _ => None,
            };

            if let Some(request) = finished.and_then(|id| open.remove(&id)) {
                let steps = handler(&request);
                log.lock().unwrap().requests.push(request.clone());
                tokio::spawn(play(request.stream_id, steps, out.clone()));
            }
        }
    }
}

/// Play a scripted reply for one stream.
async fn play(stream_id: u32, steps: Vec<Step>, out: mpsc::UnboundedSender<Out>) {
    for step in steps {
        match step {
            Step::Sleep(d) => tokio::time::sleep(d).await,
            Step::Hang => return,
            step => {
                if out.send(Out::Step(stream_id, step)).is_err() {
                    return;
                }
            }
        }
    }
}

/// Owns the write half and the HPACK encoder, so header blocks are encoded
/// in the order they hit the wire.
async fn write_loop(
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    mut rx: mpsc::UnboundedReceiver<Out>,
) {
    let mut encoder = Encoder::new(4096);
    while let Some(out) = rx.recv().await {
        let frame = match out {
            Out::Frame(frame) => frame,
            Out::Step(stream_id, step) => match step {
                Step::Headers { fields, end_stream } => {
                    headers_frame(&mut encoder, stream_id, &fields, end_stream)
                }
                Step::Trailers(fields) => headers_frame(&mut encoder, stream_id, &fields, true),
                Step::Data {
                    payload,
                    end_stream,
                } => Frame::Data {
                    stream_id,
                    payload,
                    end_stream,
                },
                Step::Reset(error_code) => Frame::RstStream {
                    stream_id,
                    error_code,
                },
                Step::GoAway(error_code) => Frame::GoAway {
                    last_stream_id: stream_id,
                    error_code,
                    debug_data: Vec::new(),
                },
                Step::Refuse(error_code) => Frame::GoAway {
                    last_stream_id: stream_id.saturating_sub(2),
                    error_code,
                    debug_data: Vec::new(),
                },
                Step::CloseConnection => {
                    let _ = writer.shutdown().await;
                    return;
                }
                Step::Sleep(_) | Step::Hang => continue,
            },
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        if writer.write_all(&buf).await.is_err() || writer.flush().await.is_err() {
            return;
        }
    }
}

fn headers_frame(
    encoder: &mut Encoder,
    stream_id: u32,
    fields: &[(String, String)],
    end_stream: bool,
) -> Frame {
    let headers: Vec<HeaderField> = fields
        .iter()
        .map(|(k, v)| HeaderField::new(k.as_str(), v.as_str()))
        .collect();
    let mut block = Vec::new();
    encoder.encode(&headers, &mut block);
    Frame::Headers {
        stream_id,
        block,
        end_stream,
        end_headers: true,
    }
}
