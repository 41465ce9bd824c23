//! Sans-IO HTTP/2 client connection.
//!
//! No sockets and no runtime: the caller feeds transport bytes in with
//! `recv()`, drains [`Event`]s, and writes whatever `take_pending_send()`
//! returns. PING and SETTINGS are answered and receive windows are
//! replenished internally.
//!
//! ```text
//!   TCP / TLS bytes
//!        |
//!   +----v---------------+
//!   | questwire-h2       |  framing, HPACK, flow control
//!   | Connection         |  Event: Response, Data, Trailers, StreamReset, GoAway
//!   +--------------------+
//! ```
//!
//! ```rust,ignore
//! use questwire_h2::{Connection, Event, HeaderField, Settings};
//!
//! let mut h2 = Connection::new(Settings::client_default());
//! transport.write_all(&h2.take_pending_send())?;
//!
//! let id = h2.send_request(&[
//!     HeaderField::new(":method", "POST"),
//!     HeaderField::new(":scheme", "https"),
//!     HeaderField::new(":path", "/pkg.Service/Method"),
//!     HeaderField::new(":authority", "example.com"),
//! ], false)?;
//! h2.send_data(id, &body, true)?;
//! transport.write_all(&h2.take_pending_send())?;
//!
//! h2.recv(&bytes_read)?;
//! while let Some(event) = h2.poll_event() {
//!     match event {
//!         Event::Data { stream_id, data, .. } => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod connection;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod hpack;
mod huffman;
pub mod settings;
mod stream;

pub use connection::{Connection, Event};
pub use error::{Error, ErrorCode};
pub use frame::Frame;
pub use hpack::HeaderField;
pub use settings::Settings;
