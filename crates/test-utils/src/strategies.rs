//! Proptest strategies for event store tests.
//!
//! Generators for client identifiers, payloads and ingestion workloads. Event
//! kinds are produced as indices (`0..3`) so this crate stays independent of
//! the store crate; map them with `EventKind::ALL[i]`.
//!
//! # Usage
//!
//! ```no_run
//! use meowkey_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(events in strategies::arb_workload(4, 64)) {
//!         // replay events against a store and check an invariant
//!     }
//! }
//! ```

use proptest::prelude::*;

/// Number of event kinds the store indexes.
pub const EVENT_KINDS: usize = 3;

/// One generated event: which client, which kind, what payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedEvent {
    /// Index into the workload's client list.
    pub client: usize,
    /// Event kind index, `0..EVENT_KINDS`.
    pub kind: usize,
    /// Raw payload, possibly longer than a record holds.
    pub payload: Vec<u8>,
}

/// Generates a client identifier of 1-64 characters matching `[A-Za-z0-9_-]`.
pub fn arb_identifier() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,64}"
}

/// Generates a short numeric identifier like the ones capture agents send.
pub fn arb_numeric_identifier() -> impl Strategy<Value = String> {
    (0u32..10_000).prop_map(|n| format!("{n:03}"))
}

/// Generates an arbitrary payload of 0-95 bytes, often over record capacity.
pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..96)
}

/// Generates a UTF-8 payload of up to 40 characters, multi-byte ones included.
pub fn arb_text_payload() -> impl Strategy<Value = String> {
    "[a-zé日本😀 ]{0,40}"
}

/// Generates an event kind index.
pub fn arb_kind() -> impl Strategy<Value = usize> {
    0..EVENT_KINDS
}

/// Generates `1..=max_clients` distinct identifiers.
pub fn arb_clients(max_clients: usize) -> impl Strategy<Value = Vec<String>> {
    proptest::collection::btree_set(arb_identifier(), 1..=max_clients.max(1))
        .prop_map(|set| set.into_iter().collect())
}

/// Generates up to `max_events` events spread over `clients` clients.
pub fn arb_workload(clients: usize, max_events: usize) -> impl Strategy<Value = Vec<GeneratedEvent>> {
    let clients = clients.max(1);
    proptest::collection::vec(
        (0..clients, arb_kind(), arb_payload()).prop_map(|(client, kind, payload)| GeneratedEvent {
            client,
            kind,
            payload,
        }),
        0..=max_events,
    )
}
