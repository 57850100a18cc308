//! Error types for the meowkey event store.

use std::io;

use snafu::Snafu;

use crate::record::EventKind;

/// Byte offset into the store file.
pub type Offset = u64;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The header is structurally invalid. Opening the store is aborted.
    #[snafu(display("Corrupt header: {reason}"))]
    CorruptHeader {
        /// Description of what failed validation.
        reason: String,
    },

    /// The header carries a format version newer than this build understands.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The version found in the header.
        version: u32,
    },

    /// Every client slot is taken and none is tombstoned.
    #[snafu(display("Client table full ({max_clients} slots)"))]
    TableFull {
        /// Capacity of the client table.
        max_clients: u32,
    },

    /// The identifier does not belong to an active client.
    #[snafu(display("Unknown client: {identifier}"))]
    UnknownClient {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// Two distinct identifiers hash to the same value.
    #[snafu(display("Identifier {identifier} collides with slot {slot} (hash {hash:#010x})"))]
    HashCollision {
        /// The identifier being registered.
        identifier: String,
        /// The colliding hash.
        hash: u32,
        /// The slot already holding that hash.
        slot: u32,
    },

    /// The identifier is empty or does not fit the fixed-width slot field.
    #[snafu(display("Invalid client identifier ({len} bytes, max {max})"))]
    InvalidIdentifier {
        /// Length of the rejected identifier in bytes.
        len: usize,
        /// Maximum identifier length.
        max: usize,
    },

    /// A tree node is inconsistent with the file bounds or its own layout.
    ///
    /// Only the traversal that touched the node is aborted.
    #[snafu(display("Corrupt tree node at offset {offset}: {reason}"))]
    CorruptTree {
        /// Offset of the offending node or record.
        offset: Offset,
        /// Description of the inconsistency.
        reason: String,
    },

    /// The tree has no published root.
    #[snafu(display("{kind} tree is empty"))]
    EmptyTree {
        /// Which event tree was queried.
        kind: EventKind,
    },

    /// The key is absent from a non-empty tree, or the client slot is absent.
    #[snafu(display("Not found"))]
    NotFound,

    /// The allocator cannot satisfy the request.
    #[snafu(display("Allocation of {requested} bytes failed: {reason}"))]
    AllocationFailure {
        /// Requested size in bytes.
        requested: u64,
        /// Why the request was refused.
        reason: String,
    },

    /// A gap or duplicate in a client's sequence numbers.
    ///
    /// Diagnostic only: ingestion never fails with this variant.
    #[snafu(display("Sequence anomaly in {kind} tree for client {client_hash:#010x}: {anomaly}"))]
    SequenceAnomaly {
        /// Tree the anomaly was found in.
        kind: EventKind,
        /// Client whose sequence is irregular.
        client_hash: u32,
        /// What was observed.
        anomaly: crate::btree::Anomaly,
    },

    /// A fixed-layout buffer could not be decoded.
    #[snafu(display("Cannot decode {what}: {reason}"))]
    Decode {
        /// The structure being decoded.
        what: &'static str,
        /// Why decoding failed.
        reason: String,
    },

    /// Configuration value out of range.
    #[snafu(display("Invalid config: {message}"))]
    InvalidConfig {
        /// Description of the validation failure.
        message: String,
    },

    /// The store was opened read-only.
    #[snafu(display("Store is read-only"))]
    ReadOnly,

    /// An earlier operation in this write transaction failed part-way.
    ///
    /// The transaction can only be dropped; nothing it did is published.
    #[snafu(display("Transaction aborted after a failed operation"))]
    Aborted,

    /// A commit failed after it started writing; storage may hold a header
    /// this handle never adopted.
    ///
    /// Every later write is refused. Reopen the store to continue from what
    /// is durable.
    #[snafu(display("Store poisoned by a failed commit; reopen required"))]
    Poisoned,
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::btree::Anomaly;

    #[test]
    fn test_error_display_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        let display = format!("{err}");
        assert!(display.starts_with("I/O error:"), "got: {display}");
    }

    #[test]
    fn test_error_display_corrupt_header() {
        let err = Error::CorruptHeader { reason: "bad magic".to_string() };
        assert_eq!(format!("{err}"), "Corrupt header: bad magic");
    }

    #[test]
    fn test_error_display_unsupported_version() {
        let err = Error::UnsupportedVersion { version: 9 };
        assert_eq!(format!("{err}"), "Unsupported format version: 9");
    }

    #[test]
    fn test_error_display_table_full() {
        let err = Error::TableFull { max_clients: 2 };
        assert_eq!(format!("{err}"), "Client table full (2 slots)");
    }

    #[test]
    fn test_error_display_hash_collision() {
        let err = Error::HashCollision { identifier: "abc".to_string(), hash: 0xBEEF, slot: 3 };
        assert_eq!(format!("{err}"), "Identifier abc collides with slot 3 (hash 0x0000beef)");
    }

    #[test]
    fn test_error_display_poisoned() {
        assert_eq!(format!("{}", Error::Poisoned), "Store poisoned by a failed commit; reopen required");
    }

    #[test]
    fn test_error_display_empty_tree() {
        let err = Error::EmptyTree { kind: EventKind::Clipboard };
        assert_eq!(format!("{err}"), "clipboard tree is empty");
    }

    #[test]
    fn test_error_display_sequence_anomaly() {
        let err = Error::SequenceAnomaly {
            kind: EventKind::Keystroke,
            client_hash: 1,
            anomaly: Anomaly::Gap { expected: 3, found: 5 },
        };
        let display = format!("{err}");
        assert!(display.contains("keystroke"), "got: {display}");
        assert!(display.contains("expected 3"), "got: {display}");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        match err {
            Error::Io { source } => assert_eq!(source.kind(), io::ErrorKind::PermissionDenied),
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as StdError;

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.source().is_some(), "Error::Io should have a source");
    }
}
