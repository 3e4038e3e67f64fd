//! NDEF message framing.
//!
//! Only the subset a script tag needs: unchunked records, short and long
//! payload forms, optional ids. Chunked records are rejected on parse.

const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_CF: u8 = 0x20;
const FLAG_SR: u8 = 0x10;
const FLAG_IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tnf {
    Empty,
    WellKnown,
    MediaType,
    AbsoluteUri,
    External,
    Unknown,
    Unchanged,
    Reserved,
}

impl Tnf {
    fn from_bits(bits: u8) -> Self {
        match bits & TNF_MASK {
            0x00 => Tnf::Empty,
            0x01 => Tnf::WellKnown,
            0x02 => Tnf::MediaType,
            0x03 => Tnf::AbsoluteUri,
            0x04 => Tnf::External,
            0x05 => Tnf::Unknown,
            0x06 => Tnf::Unchanged,
            _ => Tnf::Reserved,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Tnf::Empty => 0x00,
            Tnf::WellKnown => 0x01,
            Tnf::MediaType => 0x02,
            Tnf::AbsoluteUri => 0x03,
            Tnf::External => 0x04,
            Tnf::Unknown => 0x05,
            Tnf::Unchanged => 0x06,
            Tnf::Reserved => 0x07,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NdefError {
    #[error("empty NDEF message")]
    Empty,
    #[error("first record is missing the message-begin flag")]
    MissingBegin,
    #[error("record {0} is chunked; chunked records are not supported")]
    Chunked(usize),
    #[error("record {index} truncated: needed {needed} more bytes")]
    Truncated { index: usize, needed: usize },
    #[error("{0} bytes after the message-end record")]
    TrailingBytes(usize),
    #[error("message has no message-end record")]
    MissingEnd,
    #[error("record type is {0} bytes; at most 255 allowed")]
    TypeTooLong(usize),
    #[error("record id is {0} bytes; at most 255 allowed")]
    IdTooLong(usize),
    #[error("record payload is {0} bytes; at most 4294967295 allowed")]
    PayloadTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl NdefRecord {
    /// A media-type record with no id, e.g. `mime("text/tagsh", bytes)`.
    pub fn mime(content_type: &str, payload: Vec<u8>) -> Self {
        Self {
            tnf: Tnf::MediaType,
            record_type: content_type.as_bytes().to_vec(),
            id: Vec::new(),
            payload,
        }
    }

    fn encoded_len(&self) -> usize {
        let header = 1 + 1 + if self.payload.len() < 256 { 1 } else { 4 };
        let id_len = if self.id.is_empty() { 0 } else { 1 };
        header + id_len + self.record_type.len() + self.id.len() + self.payload.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>, first: bool, last: bool) -> Result<(), NdefError> {
        if self.record_type.len() > u8::MAX as usize {
            return Err(NdefError::TypeTooLong(self.record_type.len()));
        }
        if self.id.len() > u8::MAX as usize {
            return Err(NdefError::IdTooLong(self.id.len()));
        }
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| NdefError::PayloadTooLong(self.payload.len()))?;
        let short = payload_len < 256;

        let mut header = self.tnf.bits();
        if first {
            header |= FLAG_MB;
        }
        if last {
            header |= FLAG_ME;
        }
        if short {
            header |= FLAG_SR;
        }
        if !self.id.is_empty() {
            header |= FLAG_IL;
        }

        out.push(header);
        out.push(self.record_type.len() as u8);
        if short {
            out.push(payload_len as u8);
        } else {
            out.extend_from_slice(&payload_len.to_be_bytes());
        }
        if !self.id.is_empty() {
            out.push(self.id.len() as u8);
        }
        out.extend_from_slice(&self.record_type);
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefMessage {
    pub records: Vec<NdefRecord>,
}

impl NdefMessage {
    pub fn new(records: Vec<NdefRecord>) -> Self {
        Self { records }
    }

    pub fn single(record: NdefRecord) -> Self {
        Self {
            records: vec![record],
        }
    }

    pub fn first_record(&self) -> Option<&NdefRecord> {
        self.records.first()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NdefError> {
        if self.records.is_empty() {
            return Err(NdefError::Empty);
        }
        let total = self.records.iter().map(NdefRecord::encoded_len).sum();
        let mut out = Vec::with_capacity(total);
        let last = self.records.len() - 1;
        for (idx, record) in self.records.iter().enumerate() {
            record.encode_into(&mut out, idx == 0, idx == last)?;
        }
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, NdefError> {
        if bytes.is_empty() {
            return Err(NdefError::Empty);
        }
        let mut cursor = Cursor { bytes, pos: 0 };
        let mut records = Vec::new();
        loop {
            let index = records.len();
            let header = cursor.take(index, 1)?[0];
            if index == 0 && header & FLAG_MB == 0 {
                return Err(NdefError::MissingBegin);
            }
            if header & FLAG_CF != 0 {
                return Err(NdefError::Chunked(index));
            }
            let type_len = cursor.take(index, 1)?[0] as usize;
            let payload_len = if header & FLAG_SR != 0 {
                cursor.take(index, 1)?[0] as usize
            } else {
                let raw = cursor.take(index, 4)?;
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
            };
            let id_len = if header & FLAG_IL != 0 {
                cursor.take(index, 1)?[0] as usize
            } else {
                0
            };
            let record_type = cursor.take(index, type_len)?.to_vec();
            let id = cursor.take(index, id_len)?.to_vec();
            let payload = cursor.take(index, payload_len)?.to_vec();
            records.push(NdefRecord {
                tnf: Tnf::from_bits(header),
                record_type,
                id,
                payload,
            });

            if header & FLAG_ME != 0 {
                let rest = bytes.len() - cursor.pos;
                if rest != 0 {
                    return Err(NdefError::TrailingBytes(rest));
                }
                return Ok(Self { records });
            }
            if cursor.pos == bytes.len() {
                return Err(NdefError::MissingEnd);
            }
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, index: usize, len: usize) -> Result<&'a [u8], NdefError> {
        let available = self.bytes.len() - self.pos;
        if len > available {
            return Err(NdefError::Truncated {
                index,
                needed: len - available,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
