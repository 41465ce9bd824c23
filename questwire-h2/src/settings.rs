//! SETTINGS parameters (RFC 7540 Section 6.5).

use crate::error::Error;

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Smallest and largest legal SETTINGS_MAX_FRAME_SIZE.
pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Largest legal flow control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// One endpoint's SETTINGS. `Default` is the protocol default every peer
/// starts from before its first SETTINGS frame arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `None` means unlimited.
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// `None` means unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Settings advertised by an RPC client: push disabled and a 1 MiB
    /// receive window so typical unary responses never stall on
    /// WINDOW_UPDATE round trips.
    pub fn client_default() -> Self {
        Self {
            enable_push: false,
            initial_window_size: 1 << 20,
            ..Default::default()
        }
    }

    /// The (identifier, value) pairs this value puts on the wire. Optional
    /// limits are omitted when unset.
    fn pairs(&self) -> impl Iterator<Item = (u16, u32)> {
        [
            Some((HEADER_TABLE_SIZE, self.header_table_size)),
            Some((ENABLE_PUSH, u32::from(self.enable_push))),
            self.max_concurrent_streams
                .map(|v| (MAX_CONCURRENT_STREAMS, v)),
            Some((INITIAL_WINDOW_SIZE, self.initial_window_size)),
            Some((MAX_FRAME_SIZE, self.max_frame_size)),
            self.max_header_list_size.map(|v| (MAX_HEADER_LIST_SIZE, v)),
        ]
        .into_iter()
        .flatten()
    }

    /// Append the SETTINGS payload (6 bytes per parameter) to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        for (id, value) in self.pairs() {
            buf.extend_from_slice(&id.to_be_bytes());
            buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    /// Apply a received SETTINGS payload on top of `self`.
    ///
    /// Parameters absent from the frame keep their previous values
    /// (RFC 7540 Section 6.5.3); unknown identifiers are ignored.
    pub fn apply(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize);
        }
        for pair in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([pair[0], pair[1]]);
            let value = u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]);
            match id {
                HEADER_TABLE_SIZE => self.header_table_size = value,
                ENABLE_PUSH => match value {
                    0 => self.enable_push = false,
                    1 => self.enable_push = true,
                    _ => return Err(Error::Protocol("ENABLE_PUSH must be 0 or 1".into())),
                },
                MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(Error::FlowControl);
                    }
                    self.initial_window_size = value;
                }
                MAX_FRAME_SIZE => {
                    if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(Error::Protocol("MAX_FRAME_SIZE out of range".into()));
                    }
                    self.max_frame_size = value;
                }
                MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// Decode a SETTINGS payload starting from protocol defaults.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut settings = Self::default();
        settings.apply(payload)?;
        Ok(settings)
    }
}
