//! Fuzz target for the on-disk decoders.
//!
//! Every structure read back from storage goes through one of these, so
//! none of them may panic on arbitrary bytes. Whatever decodes successfully
//! must re-encode to something that decodes to the same value.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meowkey_store::{
    ClientSlot, EventRecord, Header, IndexedRecord, Node, RECORD_SIZE, client::CLIENT_SLOT_SIZE, header::HEADER_SIZE,
    page::Entry,
};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let selector = data[0] % 5;
    let payload = &data[1..];

    match selector {
        0 => fuzz_header(payload),
        1 => fuzz_node(payload),
        2 => fuzz_node_roundtrip(payload),
        3 => fuzz_record(payload),
        _ => fuzz_client_slot(payload),
    }
});

fn fuzz_header(data: &[u8]) {
    let mut buf = [0u8; HEADER_SIZE];
    let len = data.len().min(HEADER_SIZE);
    buf[..len].copy_from_slice(&data[..len]);

    let _ = Header::from_bytes(data);
    if let Ok(header) = Header::from_bytes(&buf) {
        let again = Header::from_bytes(&header.to_bytes()).expect("re-encoded header must decode");
        assert_eq!(again, header, "header roundtrip mismatch");
    }
}

fn fuzz_node(data: &[u8]) {
    let _ = Node::decode(4096, data);
    for size in [128usize, 256, 4096] {
        let mut buf = vec![0u8; size];
        let len = data.len().min(size);
        buf[..len].copy_from_slice(&data[..len]);
        let _ = Node::decode(4096, &buf);
    }
}

/// Builds a leaf from fuzzed keys so the checksum is valid and decoding
/// reaches the structural checks.
fn fuzz_node_roundtrip(data: &[u8]) {
    const NODE_SIZE: u32 = 256;

    let mut node = Node::leaf(8192, u64::from(data.first().copied().unwrap_or(0)));
    let mut keys: Vec<u64> = data
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("chunk of 8")))
        .take(Node::capacity(node.kind, NODE_SIZE))
        .collect();
    keys.sort_unstable();
    node.entries = keys.into_iter().map(|key| Entry { key, offset: key.wrapping_mul(64) }).collect();

    let decoded = Node::decode(node.offset, &node.encode(NODE_SIZE)).expect("encoded leaf must decode");
    assert_eq!(decoded, node, "node roundtrip mismatch");
}

fn fuzz_record(data: &[u8]) {
    let _ = EventRecord::decode(data);
    if data.len() < RECORD_SIZE {
        return;
    }
    if let Ok(record) = EventRecord::decode(&data[..RECORD_SIZE]) {
        let again = EventRecord::decode(&record.encode()).expect("re-encoded record must decode");
        assert_eq!(again, record, "record roundtrip mismatch");
    }
}

fn fuzz_client_slot(data: &[u8]) {
    let _ = ClientSlot::decode(0, data);
    let mut buf = [0u8; CLIENT_SLOT_SIZE];
    let len = data.len().min(CLIENT_SLOT_SIZE);
    buf[..len].copy_from_slice(&data[..len]);
    if let Ok(slot) = ClientSlot::decode(7, &buf) {
        let again = ClientSlot::decode(7, &slot.encode()).expect("re-encoded slot must decode");
        assert_eq!(again, slot, "client slot roundtrip mismatch");
    }
}
