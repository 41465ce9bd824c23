//! HPACK header compression (RFC 7541).
//!
//! Static table, size-bounded dynamic table, Huffman string literals and
//! prefix integers. The encoder indexes everything except fields marked
//! sensitive, which go out as "never indexed" literals.

use std::collections::VecDeque;

use crate::error::Error;
use crate::huffman;

/// One header name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    /// Never add this field to a compression table (RFC 7541 Section 7.1.3).
    /// Set for credentials on the way out and for fields the peer sent as
    /// never-indexed on the way in.
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    /// A field that must never be stored in either side's dynamic table.
    pub fn sensitive(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            sensitive: true,
            ..Self::new(name, value)
        }
    }

    /// Value as UTF-8, if it is.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Table accounting size (RFC 7541 Section 4.1).
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// Find the value of the first field called `name`.
pub fn find<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name == name.as_bytes())
        .map(|h| h.value.as_slice())
}

// -- Prefix integers (RFC 7541 Section 5.1) --

pub(crate) fn encode_int(buf: &mut Vec<u8>, value: usize, prefix_bits: u8, pattern: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        buf.push(pattern | value as u8);
        return;
    }
    buf.push(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        buf.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    buf.push(rest as u8);
}

/// Decode a prefix integer; returns the value and bytes consumed.
pub(crate) fn decode_int(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), Error> {
    let max = (1usize << prefix_bits) - 1;
    let first = *buf.first().ok_or(Error::Compression)?;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok((value, 1));
    }
    for (i, &b) in buf[1..].iter().enumerate() {
        // Four continuation octets cover any length this endpoint accepts.
        if i >= 4 {
            return Err(Error::Compression);
        }
        value += usize::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
    }
    Err(Error::Compression)
}

// -- Static table (RFC 7541 Appendix A) --

#[rustfmt::skip]
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""), (":method", "GET"), (":method", "POST"), (":path", "/"),
    (":path", "/index.html"), (":scheme", "http"), (":scheme", "https"), (":status", "200"),
    (":status", "204"), (":status", "206"), (":status", "304"), (":status", "400"),
    (":status", "404"), (":status", "500"), ("accept-charset", ""), ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""), ("accept-ranges", ""), ("accept", ""), ("access-control-allow-origin", ""),
    ("age", ""), ("allow", ""), ("authorization", ""), ("cache-control", ""),
    ("content-disposition", ""), ("content-encoding", ""), ("content-language", ""), ("content-length", ""),
    ("content-location", ""), ("content-range", ""), ("content-type", ""), ("cookie", ""),
    ("date", ""), ("etag", ""), ("expect", ""), ("expires", ""),
    ("from", ""), ("host", ""), ("if-match", ""), ("if-modified-since", ""),
    ("if-none-match", ""), ("if-range", ""), ("if-unmodified-since", ""), ("last-modified", ""),
    ("link", ""), ("location", ""), ("max-forwards", ""), ("proxy-authenticate", ""),
    ("proxy-authorization", ""), ("range", ""), ("referer", ""), ("refresh", ""),
    ("retry-after", ""), ("server", ""), ("set-cookie", ""), ("strict-transport-security", ""),
    ("transfer-encoding", ""), ("user-agent", ""), ("vary", ""), ("via", ""),
    ("www-authenticate", ""),
];

/// Best table match for a field: an index whose entry matches the whole
/// field, or failing that one that matches the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Full(usize),
    Name(usize),
    None,
}

impl Match {
    fn better(self, other: Match) -> Match {
        match (self, other) {
            (Match::Full(_), _) => self,
            (_, Match::Full(_)) => other,
            (Match::Name(_), _) => self,
            _ => other,
        }
    }
}

fn static_match(name: &[u8], value: &[u8]) -> Match {
    let mut found = Match::None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if n.as_bytes() != name {
            continue;
        }
        if v.as_bytes() == value {
            return Match::Full(i + 1);
        }
        if found == Match::None {
            found = Match::Name(i + 1);
        }
    }
    found
}

// -- Dynamic table (RFC 7541 Section 2.3.2) --

/// Newest entry first; entry `i` has HPACK index `62 + i`.
#[derive(Debug, Default)]
struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    fn insert(&mut self, mut field: HeaderField) {
        field.sensitive = false;
        let needed = field.size();
        if needed > self.max_size {
            // An oversized entry empties the table (RFC 7541 Section 4.4).
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - needed);
        self.size += needed;
        self.entries.push_front(field);
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some(old) => self.size -= old.size(),
                None => break,
            }
        }
    }

    fn find(&self, name: &[u8], value: &[u8]) -> Match {
        let mut found = Match::None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name != name {
                continue;
            }
            if entry.value == value {
                return Match::Full(i + STATIC_TABLE.len() + 1);
            }
            if found == Match::None {
                found = Match::Name(i + STATIC_TABLE.len() + 1);
            }
        }
        found
    }
}

// -- String literals (RFC 7541 Section 5.2) --

fn encode_string(buf: &mut Vec<u8>, data: &[u8]) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_int(buf, huffman_len, 7, 0x80);
        huffman::encode(data, buf);
    } else {
        encode_int(buf, data.len(), 7, 0x00);
        buf.extend_from_slice(data);
    }
}

fn decode_string(buf: &[u8]) -> Result<(Vec<u8>, usize), Error> {
    let huffman_coded = buf.first().is_some_and(|b| b & 0x80 != 0);
    let (len, n) = decode_int(buf, 7)?;
    let raw = buf.get(n..n + len).ok_or(Error::Compression)?;
    let value = if huffman_coded {
        huffman::decode(raw)?
    } else {
        raw.to_vec()
    };
    Ok((value, n + len))
}

// -- Encoder --

/// HPACK encoder for one direction of one connection.
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Size updates owed to the peer before the next header block: the
    /// smallest size reached since the last block, then the current size.
    pending_resize: Option<(usize, usize)>,
}

impl Encoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            pending_resize: None,
        }
    }

    /// Adopt a new table limit, announced to the decoder at the start of the
    /// next block (RFC 7541 Section 4.2).
    pub fn set_max_table_size(&mut self, size: usize) {
        if size == self.table.max_size && self.pending_resize.is_none() {
            return;
        }
        let smallest = self.pending_resize.map_or(size, |(min, _)| min.min(size));
        self.pending_resize = Some((smallest, size));
        self.table.resize(size);
    }

    /// Encode `headers` as one header block appended to `buf`.
    pub fn encode(&mut self, headers: &[HeaderField], buf: &mut Vec<u8>) {
        if let Some((smallest, size)) = self.pending_resize.take() {
            if smallest < size {
                encode_int(buf, smallest, 5, 0x20);
            }
            encode_int(buf, size, 5, 0x20);
        }
        for field in headers {
            self.encode_field(field, buf);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, buf: &mut Vec<u8>) {
        let found = if field.sensitive {
            // Name-only lookup: the value must not be matched or stored.
            match static_match(&field.name, &[]).better(self.table.find(&field.name, &[])) {
                Match::Full(i) | Match::Name(i) => Match::Name(i),
                Match::None => Match::None,
            }
        } else {
            static_match(&field.name, &field.value)
                .better(self.table.find(&field.name, &field.value))
        };

        if field.sensitive {
            // Literal never indexed: 0001xxxx.
            match found {
                Match::Name(i) => encode_int(buf, i, 4, 0x10),
                _ => {
                    buf.push(0x10);
                    encode_string(buf, &field.name);
                }
            }
            encode_string(buf, &field.value);
            return;
        }

        match found {
            // Indexed field: 1xxxxxxx.
            Match::Full(i) => encode_int(buf, i, 7, 0x80),
            // Literal with incremental indexing: 01xxxxxx.
            Match::Name(i) => {
                encode_int(buf, i, 6, 0x40);
                encode_string(buf, &field.value);
                self.table.insert(field.clone());
            }
            Match::None => {
                buf.push(0x40);
                encode_string(buf, &field.name);
                encode_string(buf, &field.value);
                self.table.insert(field.clone());
            }
        }
    }
}

// -- Decoder --

/// HPACK decoder for one direction of one connection.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Ceiling the peer may raise the table to, from our SETTINGS.
    limit: usize,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            limit: max_table_size,
        }
    }

    /// Decode one complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, Error> {
        let mut headers = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let rest = &block[pos..];
            let first = rest[0];
            if first & 0x80 != 0 {
                let (index, n) = decode_int(rest, 7)?;
                headers.push(self.entry(index)?);
                pos += n;
            } else if first & 0x40 != 0 {
                let (field, n) = self.literal(rest, 6)?;
                self.table.insert(field.clone());
                headers.push(field);
                pos += n;
            } else if first & 0x20 != 0 {
                let (size, n) = decode_int(rest, 5)?;
                if size > self.limit {
                    return Err(Error::Compression);
                }
                self.table.resize(size);
                pos += n;
            } else {
                let (mut field, n) = self.literal(rest, 4)?;
                field.sensitive = first & 0x10 != 0;
                headers.push(field);
                pos += n;
            }
        }
        Ok(headers)
    }

    /// A literal field whose name is either indexed or inline.
    fn literal(&self, buf: &[u8], prefix_bits: u8) -> Result<(HeaderField, usize), Error> {
        let (index, mut pos) = decode_int(buf, prefix_bits)?;
        let name = if index == 0 {
            let (name, n) = decode_string(&buf[pos..])?;
            pos += n;
            name
        } else {
            self.entry(index)?.name
        };
        let (value, n) = decode_string(&buf[pos..])?;
        Ok((HeaderField::new(name, value), pos + n))
    }

    fn entry(&self, index: usize) -> Result<HeaderField, Error> {
        match index {
            0 => Err(Error::Compression),
            i if i <= STATIC_TABLE.len() => {
                let (name, value) = STATIC_TABLE[i - 1];
                Ok(HeaderField::new(name, value))
            }
            i => self
                .table
                .get(i - STATIC_TABLE.len() - 1)
                .cloned()
                .ok_or(Error::Compression),
        }
    }
}
