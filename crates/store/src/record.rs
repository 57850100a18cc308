//! Event records and their index keys.
//!
//! A record is a fixed 64-byte, little-endian block:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     timestamp (microseconds since the Unix epoch)
//! 8       4     client_hash
//! 12      4     sequence
//! 16      48    payload (NUL padded)
//! ```
//!
//! Records are written once and never modified.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Size of an encoded record.
pub const RECORD_SIZE: usize = 64;

/// Payload bytes stored per record.
pub const PAYLOAD_CAPACITY: usize = 48;

/// The three event streams a client produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Keystroke events.
    Keystroke,
    /// Clipboard contents.
    Clipboard,
    /// Window-focus changes.
    Window,
}

impl EventKind {
    /// Number of kinds.
    pub const COUNT: usize = 3;

    /// All kinds in header order.
    pub const ALL: [EventKind; Self::COUNT] =
        [EventKind::Keystroke, EventKind::Clipboard, EventKind::Window];

    /// Position of this kind in header and client-slot arrays.
    pub fn index(self) -> usize {
        match self {
            EventKind::Keystroke => 0,
            EventKind::Clipboard => 1,
            EventKind::Window => 2,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Keystroke => "keystroke",
            EventKind::Clipboard => "clipboard",
            EventKind::Window => "window",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tree key: client hash major, sequence minor.
///
/// Packs into a `u64` as `(client_hash << 32) | sequence`, so the numeric
/// order of the packed value is the index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey {
    /// Client hash.
    pub client_hash: u32,
    /// Per-client sequence number.
    pub sequence: u32,
}

impl IndexKey {
    /// Creates a key.
    pub fn new(client_hash: u32, sequence: u32) -> Self {
        Self { client_hash, sequence }
    }

    /// Packed representation stored in tree nodes.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.client_hash) << 32) | u64::from(self.sequence)
    }

    /// Unpacks a stored key.
    pub fn from_u64(raw: u64) -> Self {
        Self { client_hash: (raw >> 32) as u32, sequence: raw as u32 }
    }
}

/// A fixed-size value indexed by the event tree.
///
/// The tree stores only `(key, offset)` pairs; this trait lets it read back
/// and verify the value behind an offset.
pub trait IndexedRecord: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Key under which the value is indexed.
    fn index_key(&self) -> IndexKey;

    /// Encodes into exactly [`Self::SIZE`] bytes.
    fn encode(&self) -> Vec<u8>;

    /// Strictly decodes [`Self::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the buffer has the wrong length.
    fn decode(buf: &[u8]) -> Result<Self>;
}

/// One stored event.
#[derive(Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Hash of the owning client.
    pub client_hash: u32,
    /// Per-client, per-kind sequence number.
    pub sequence: u32,
    payload: [u8; PAYLOAD_CAPACITY],
    payload_len: usize,
}

impl EventRecord {
    /// Builds a record, truncating the payload to fit.
    ///
    /// Returns the record and whether truncation happened.
    pub fn new(timestamp: u64, client_hash: u32, sequence: u32, payload: &[u8]) -> (Self, bool) {
        let kept = truncate_payload(payload);
        let mut buf = [0u8; PAYLOAD_CAPACITY];
        buf[..kept.len()].copy_from_slice(kept);
        let record =
            Self { timestamp, client_hash, sequence, payload: buf, payload_len: padded_len(&buf) };
        (record, kept.len() < payload.len())
    }

    /// Payload bytes without padding.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len]
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(self.payload()).into_owned()
    }
}

impl IndexedRecord for EventRecord {
    const SIZE: usize = RECORD_SIZE;

    fn index_key(&self) -> IndexKey {
        IndexKey::new(self.client_hash, self.sequence)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.timestamp);
        LittleEndian::write_u32(&mut buf[8..12], self.client_hash);
        LittleEndian::write_u32(&mut buf[12..16], self.sequence);
        buf[16..].copy_from_slice(&self.payload);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != RECORD_SIZE {
            return Err(Error::Decode {
                what: "event record",
                reason: format!("expected {RECORD_SIZE} bytes, got {}", buf.len()),
            });
        }

        let mut payload = [0u8; PAYLOAD_CAPACITY];
        payload.copy_from_slice(&buf[16..]);
        Ok(Self {
            timestamp: LittleEndian::read_u64(&buf[0..8]),
            client_hash: LittleEndian::read_u32(&buf[8..12]),
            sequence: LittleEndian::read_u32(&buf[12..16]),
            payload,
            payload_len: padded_len(&payload),
        })
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("timestamp", &self.timestamp)
            .field("client_hash", &format_args!("{:#010x}", self.client_hash))
            .field("sequence", &self.sequence)
            .field("payload", &self.payload_lossy())
            .finish()
    }
}

// Trailing NULs are padding, not content.
fn padded_len(payload: &[u8; PAYLOAD_CAPACITY]) -> usize {
    payload.iter().rposition(|&b| b != 0).map_or(0, |last| last + 1)
}

/// Returns the prefix of `payload` that fits in a record.
///
/// Valid UTF-8 is cut at a character boundary so stored text stays valid;
/// anything else is cut at [`PAYLOAD_CAPACITY`] bytes.
pub fn truncate_payload(payload: &[u8]) -> &[u8] {
    if payload.len() <= PAYLOAD_CAPACITY {
        return payload;
    }
    match std::str::from_utf8(payload) {
        Ok(text) => {
            let mut end = PAYLOAD_CAPACITY;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &payload[..end]
        },
        Err(_) => &payload[..PAYLOAD_CAPACITY],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_record_layout() {
        let (record, truncated) = EventRecord::new(0x0102_0304_0506_0708, 0xAABB_CCDD, 7, b"hi");
        assert!(!truncated);

        let buf = record.encode();
        assert_eq!(buf.len(), RECORD_SIZE);
        assert_eq!(LittleEndian::read_u64(&buf[0..8]), 0x0102_0304_0506_0708);
        assert_eq!(LittleEndian::read_u32(&buf[8..12]), 0xAABB_CCDD);
        assert_eq!(LittleEndian::read_u32(&buf[12..16]), 7);
        assert_eq!(&buf[16..18], b"hi");
        assert!(buf[18..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_trims_padding() {
        let (record, _) = EventRecord::new(1, 2, 3, b"notepad.exe");
        let decoded = EventRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.payload(), b"notepad.exe");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = EventRecord::decode(&[0u8; 63]).unwrap_err();
        assert!(matches!(err, Error::Decode { what: "event record", .. }));
    }

    #[test]
    fn test_long_ascii_payload_truncated_to_capacity() {
        let payload = vec![b'x'; 100];
        let (record, truncated) = EventRecord::new(1, 1, 0, &payload);
        assert!(truncated);
        assert_eq!(record.payload().len(), PAYLOAD_CAPACITY);
    }

    #[test]
    fn test_utf8_payload_cut_at_char_boundary() {
        // 47 ASCII bytes then a 3-byte character straddling the limit.
        let text = format!("{}€tail", "a".repeat(47));
        let kept = truncate_payload(text.as_bytes());
        assert_eq!(kept.len(), 47);
        assert!(std::str::from_utf8(kept).is_ok());
    }

    #[test]
    fn test_binary_payload_cut_at_capacity() {
        let payload: Vec<u8> = (0..=255u8).collect();
        assert_eq!(truncate_payload(&payload).len(), PAYLOAD_CAPACITY);
    }

    #[test]
    fn test_index_key_packing() {
        let key = IndexKey::new(0x1234_5678, 9);
        assert_eq!(key.to_u64(), 0x1234_5678_0000_0009);
        assert_eq!(IndexKey::from_u64(key.to_u64()), key);
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Keystroke.to_string(), "keystroke");
        assert_eq!(EventKind::Window.index(), 2);
        assert_eq!(EventKind::ALL.len(), EventKind::COUNT);
    }

    proptest! {
        #[test]
        fn prop_packed_order_matches_key_order(
            a in any::<(u32, u32)>(),
            b in any::<(u32, u32)>(),
        ) {
            let ka = IndexKey::new(a.0, a.1);
            let kb = IndexKey::new(b.0, b.1);
            prop_assert_eq!(ka.cmp(&kb), ka.to_u64().cmp(&kb.to_u64()));
        }

        #[test]
        fn prop_truncated_text_stays_valid(text in "\\PC{0,80}") {
            let kept = truncate_payload(text.as_bytes());
            prop_assert!(kept.len() <= PAYLOAD_CAPACITY);
            prop_assert!(std::str::from_utf8(kept).is_ok());
            prop_assert!(text.as_bytes().starts_with(kept));
        }
    }
}
