//! Client table: a fixed-capacity array of client slots.
//!
//! Each image of the table is an array of slots with a 256-byte stride:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       64    identifier (NUL padded)
//! 64      4     hash (djb2 of the identifier)
//! 68      1     state (0 = empty, 1 = active, 2 = tombstoned)
//! 69      3     reserved
//! 72      4     session_count
//! 76      4     reserved
//! 80      8     first_seen (microseconds)
//! 88      8     last_seen (microseconds)
//! 96      12    next_sequence, one u32 per event kind
//! 108     4     reserved
//! 112     24    totals, one u64 per event kind
//! 136     120   reserved
//! ```
//!
//! The store keeps two images of the table. The header names the committed
//! one and a commit writes the other, so slot changes become visible in the
//! same header publish as the events that caused them. The committed image
//! is never written.
//!
//! The in-memory table mirrors the committed slots. A write transaction
//! mutates it directly and keeps an undo journal so an abandoned transaction
//! can be rolled back. The table also remembers which slots the inactive
//! image lacks, so a commit writes only those plus its own changes.

use std::collections::{BTreeSet, HashMap};

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    backend::StorageBackend,
    error::{Error, Offset, Result},
    header::Header,
    record::EventKind,
};

/// Stride of one slot in the table.
pub const CLIENT_SLOT_SIZE: usize = 256;

/// Longest identifier a slot can hold.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SlotState {
    /// Never used.
    #[default]
    Empty = 0,
    /// Registered and connected.
    Active = 1,
    /// Disconnected; reusable, identifier retained.
    Tombstoned = 2,
}

impl TryFrom<u8> for SlotState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(Self::Empty),
            1 => Ok(Self::Active),
            2 => Ok(Self::Tombstoned),
            other => Err(other),
        }
    }
}

/// djb2 hash of a client identifier.
pub fn client_hash(identifier: &[u8]) -> u32 {
    identifier.iter().fold(5381u32, |hash, &byte| hash.wrapping_mul(33).wrapping_add(u32::from(byte)))
}

/// One client slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientSlot {
    /// Position in the table.
    pub index: u32,
    /// Client identifier, empty for never-used slots.
    pub identifier: String,
    /// Hash of the identifier.
    pub hash: u32,
    /// Slot state.
    pub state: SlotState,
    /// Number of registrations, including reconnects.
    pub session_count: u32,
    /// Timestamp of the first registration.
    pub first_seen: u64,
    /// Timestamp of the latest registration or event.
    pub last_seen: u64,
    /// Next sequence number per event kind.
    pub next_sequence: [u32; EventKind::COUNT],
    /// Events recorded per kind.
    pub totals: [u64; EventKind::COUNT],
}

impl ClientSlot {
    /// True if the client is registered.
    pub fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }

    /// Total events across all kinds.
    pub fn total_events(&self) -> u64 {
        self.totals.iter().sum()
    }

    /// Encodes the slot into its on-disk form.
    pub fn encode(&self) -> [u8; CLIENT_SLOT_SIZE] {
        let mut buf = [0u8; CLIENT_SLOT_SIZE];
        let id = self.identifier.as_bytes();
        let id_len = id.len().min(MAX_IDENTIFIER_LEN);
        buf[..id_len].copy_from_slice(&id[..id_len]);
        LittleEndian::write_u32(&mut buf[64..68], self.hash);
        buf[68] = self.state as u8;
        LittleEndian::write_u32(&mut buf[72..76], self.session_count);
        LittleEndian::write_u64(&mut buf[80..88], self.first_seen);
        LittleEndian::write_u64(&mut buf[88..96], self.last_seen);
        for (i, next) in self.next_sequence.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[96 + i * 4..100 + i * 4], *next);
        }
        for (i, total) in self.totals.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[112 + i * 8..120 + i * 8], *total);
        }
        buf
    }

    /// Strictly decodes slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on a wrong buffer length, an unknown state
    /// byte, a non-UTF-8 identifier or a hash that does not match the
    /// identifier of a used slot.
    pub fn decode(index: u32, buf: &[u8]) -> Result<Self> {
        let invalid = |reason: String| Error::Decode { what: "client slot", reason };

        if buf.len() != CLIENT_SLOT_SIZE {
            return Err(invalid(format!("expected {CLIENT_SLOT_SIZE} bytes, got {}", buf.len())));
        }

        let state = SlotState::try_from(buf[68])
            .map_err(|tag| invalid(format!("slot {index} has unknown state {tag}")))?;
        if state == SlotState::Empty {
            return Ok(Self { index, ..Self::default() });
        }

        let id_len = buf[..MAX_IDENTIFIER_LEN].iter().position(|&b| b == 0).unwrap_or(MAX_IDENTIFIER_LEN);
        let identifier = std::str::from_utf8(&buf[..id_len])
            .map_err(|e| invalid(format!("slot {index} identifier: {e}")))?
            .to_string();
        let hash = LittleEndian::read_u32(&buf[64..68]);
        if id_len == 0 || hash != client_hash(identifier.as_bytes()) {
            return Err(invalid(format!("slot {index} hash does not match its identifier")));
        }

        let mut next_sequence = [0u32; EventKind::COUNT];
        for (i, next) in next_sequence.iter_mut().enumerate() {
            *next = LittleEndian::read_u32(&buf[96 + i * 4..100 + i * 4]);
        }
        let mut totals = [0u64; EventKind::COUNT];
        for (i, total) in totals.iter_mut().enumerate() {
            *total = LittleEndian::read_u64(&buf[112 + i * 8..120 + i * 8]);
        }

        Ok(Self {
            index,
            identifier,
            hash,
            state,
            session_count: LittleEndian::read_u32(&buf[72..76]),
            first_seen: LittleEndian::read_u64(&buf[80..88]),
            last_seen: LittleEndian::read_u64(&buf[88..96]),
            next_sequence,
            totals,
        })
    }
}

/// What [`ClientTable::register`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// A free slot was claimed.
    Registered,
    /// The client was already active; the same slot was returned.
    Reconnected,
    /// The client's tombstoned slot was reactivated.
    Reactivated,
}

/// Result of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Slot index.
    pub slot: u32,
    /// Client hash.
    pub hash: u32,
    /// How the slot was obtained.
    pub outcome: RegistrationOutcome,
}

/// Client table image a commit writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableImage {
    /// Start of the image; published as `client_table_offset`.
    pub offset: Offset,
    /// Encoded slots with their file offsets.
    pub slots: Vec<(Offset, [u8; CLIENT_SLOT_SIZE])>,
}

/// In-memory mirror of the committed client table image.
#[derive(Debug, Clone)]
pub struct ClientTable {
    images: [Offset; 2],
    current: Offset,
    slots: Vec<ClientSlot>,
    undo: HashMap<u32, ClientSlot>,
    dirty: BTreeSet<u32>,
    /// Slots whose inactive image differs from the committed one.
    stale: BTreeSet<u32>,
}

impl ClientTable {
    /// Creates an all-empty table for a freshly initialized `header`.
    pub fn empty(header: &Header) -> Self {
        let slots = (0..header.max_clients).map(|index| ClientSlot { index, ..ClientSlot::default() }).collect();
        Self {
            images: header.client_table_images(),
            current: header.client_table_offset,
            slots,
            undo: HashMap::new(),
            dirty: BTreeSet::new(),
            stale: BTreeSet::new(),
        }
    }

    /// Reads the image `header` commits to.
    ///
    /// The inactive image is compared slot by slot so the next commit
    /// rewrites whatever an interrupted commit left there.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on a failed read and [`Error::Decode`] for an
    /// undecodable slot.
    pub fn load<B: StorageBackend>(backend: &B, header: &Header) -> Result<Self> {
        let len = header.max_clients as usize * CLIENT_SLOT_SIZE;
        let raw = backend.read_vec(header.client_table_offset, len)?;
        let slots = raw
            .chunks_exact(CLIENT_SLOT_SIZE)
            .enumerate()
            .map(|(i, chunk)| ClientSlot::decode(i as u32, chunk))
            .collect::<Result<Vec<_>>>()?;

        let other = backend.read_vec(header.next_client_table_offset(), len)?;
        let stale = raw
            .chunks_exact(CLIENT_SLOT_SIZE)
            .zip(other.chunks_exact(CLIENT_SLOT_SIZE))
            .enumerate()
            .filter(|(_, (committed, inactive))| committed != inactive)
            .map(|(i, _)| i as u32)
            .collect();

        Ok(Self {
            images: header.client_table_images(),
            current: header.client_table_offset,
            slots,
            undo: HashMap::new(),
            dirty: BTreeSet::new(),
            stale,
        })
    }


    /// Capacity.
    pub fn max_clients(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of active slots.
    pub fn num_active(&self) -> u32 {
        self.slots.iter().filter(|slot| slot.is_active()).count() as u32
    }

    /// Active clients in slot order.
    pub fn clients(&self) -> impl Iterator<Item = &ClientSlot> {
        self.slots.iter().filter(|slot| slot.is_active())
    }

    /// Every slot, including empty and tombstoned ones.
    pub fn slots(&self) -> &[ClientSlot] {
        &self.slots
    }

    /// Slot by index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `index` is past the table.
    pub fn slot(&self, index: u32) -> Result<&ClientSlot> {
        self.slots.get(index as usize).ok_or(Error::NotFound)
    }

    /// Finds the used slot holding `hash`, preferring an active one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no used slot carries the hash.
    pub fn lookup(&self, hash: u32) -> Result<&ClientSlot> {
        let mut used = self.slots.iter().filter(|s| s.state != SlotState::Empty && s.hash == hash);
        let first = used.next().ok_or(Error::NotFound)?;
        if first.is_active() {
            return Ok(first);
        }
        Ok(used.find(|s| s.is_active()).unwrap_or(first))
    }

    /// Finds the used slot holding `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no used slot carries the identifier.
    pub fn lookup_identifier(&self, identifier: &str) -> Result<&ClientSlot> {
        let hash = client_hash(identifier.as_bytes());
        self.slots
            .iter()
            .find(|s| s.state != SlotState::Empty && s.hash == hash && s.identifier == identifier)
            .ok_or(Error::NotFound)
    }

    /// Returns the active slot for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] unless the identifier is active.
    pub fn active(&self, identifier: &str) -> Result<&ClientSlot> {
        match self.lookup_identifier(identifier) {
            Ok(slot) if slot.is_active() => Ok(slot),
            _ => Err(Error::UnknownClient { identifier: identifier.to_string() }),
        }
    }

    /// Registers `identifier`.
    ///
    /// `start_sequences` is consulted only when a free slot is claimed and
    /// yields the first sequence per kind for the new client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] for an empty, oversized or
    /// NUL-containing identifier, [`Error::HashCollision`] if another
    /// identifier already owns the hash, and [`Error::TableFull`] when no slot
    /// is free.
    pub fn register<F>(&mut self, identifier: &str, now: u64, start_sequences: F) -> Result<Registration>
    where
        F: FnOnce(u32) -> Result<[u32; EventKind::COUNT]>,
    {
        validate_identifier(identifier)?;
        let hash = client_hash(identifier.as_bytes());

        let holder = self.slots.iter().find(|s| s.state != SlotState::Empty && s.hash == hash);
        if let Some(slot) = holder {
            if slot.identifier != identifier {
                return Err(Error::HashCollision {
                    identifier: identifier.to_string(),
                    hash,
                    slot: slot.index,
                });
            }
            let index = slot.index;
            let outcome = if slot.is_active() {
                RegistrationOutcome::Reconnected
            } else {
                RegistrationOutcome::Reactivated
            };
            let slot = self.touch(index);
            slot.state = SlotState::Active;
            slot.session_count = slot.session_count.saturating_add(1);
            slot.last_seen = now;
            return Ok(Registration { slot: index, hash, outcome });
        }

        let free = self
            .slots
            .iter()
            .find(|s| s.state != SlotState::Active)
            .map(|s| s.index)
            .ok_or(Error::TableFull { max_clients: self.max_clients() })?;

        let next_sequence = start_sequences(hash)?;
        let slot = self.touch(free);
        *slot = ClientSlot {
            index: free,
            identifier: identifier.to_string(),
            hash,
            state: SlotState::Active,
            session_count: 1,
            first_seen: now,
            last_seen: now,
            next_sequence,
            totals: [0; EventKind::COUNT],
        };
        Ok(Registration { slot: free, hash, outcome: RegistrationOutcome::Registered })
    }

    /// Tombstones the active slot at `index`. The identifier is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the slot is not active.
    pub fn deregister(&mut self, index: u32) -> Result<&ClientSlot> {
        let slot = self.slot(index)?;
        if !slot.is_active() {
            return Err(Error::UnknownClient { identifier: slot.identifier.clone() });
        }
        let slot = self.touch(index);
        slot.state = SlotState::Tombstoned;
        Ok(slot)
    }

    /// Takes the next sequence for an event of `kind` and updates counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the slot is not active and
    /// [`Error::AllocationFailure`] once the sequence space is exhausted.
    pub fn next_sequence(&mut self, index: u32, kind: EventKind, now: u64) -> Result<u32> {
        let slot = self.slot(index)?;
        if !slot.is_active() {
            return Err(Error::UnknownClient { identifier: slot.identifier.clone() });
        }
        let sequence = slot.next_sequence[kind.index()];
        let next = sequence.checked_add(1).ok_or_else(|| Error::AllocationFailure {
            requested: 1,
            reason: format!("{kind} sequence space exhausted for {}", slot.identifier),
        })?;

        let slot = self.touch(index);
        slot.next_sequence[kind.index()] = next;
        slot.totals[kind.index()] += 1;
        slot.last_seen = now;
        Ok(sequence)
    }

    /// Sets the next sequence for `kind`. Moving it back also removes the
    /// skipped events from the total.
    #[cfg(test)]
    pub(crate) fn reset_sequence(&mut self, index: u32, kind: EventKind, next: u32) -> Result<&ClientSlot> {
        self.slot(index)?;
        let slot = self.touch(index);
        let current = slot.next_sequence[kind.index()];
        if next < current {
            let total = &mut slot.totals[kind.index()];
            *total = total.saturating_sub(u64::from(current - next));
        }
        slot.next_sequence[kind.index()] = next;
        Ok(slot)
    }

    fn touch(&mut self, index: u32) -> &mut ClientSlot {
        let slot = &mut self.slots[index as usize];
        self.undo.entry(index).or_insert_with(|| slot.clone());
        self.dirty.insert(index);
        slot
    }

    /// True if slots were modified since the last commit or rollback.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// The inactive image with every slot it must be brought up to date on:
    /// the ones modified since the last commit and the ones it was already
    /// behind on.
    pub fn next_image(&self) -> TableImage {
        let offset = if self.current == self.images[0] { self.images[1] } else { self.images[0] };
        let slots = self
            .dirty
            .union(&self.stale)
            .map(|&index| {
                let at = offset + u64::from(index) * CLIENT_SLOT_SIZE as u64;
                (at, self.slots[index as usize].encode())
            })
            .collect();
        TableImage { offset, slots }
    }

    /// Records that a header naming `offset` was published.
    ///
    /// The image just replaced lacks exactly this commit's changes.
    pub fn committed(&mut self, offset: Offset) {
        if offset != self.current {
            self.current = offset;
            self.stale = std::mem::take(&mut self.dirty);
        }
        self.dirty.clear();
        self.undo.clear();
    }

    /// Restores every slot modified since the last commit.
    ///
    /// The inactive image may hold some of those changes, so they stay
    /// pending for the next commit.
    pub fn rollback(&mut self) {
        for (index, slot) in self.undo.drain() {
            self.slots[index as usize] = slot;
        }
        self.stale.append(&mut self.dirty);
    }
}

fn validate_identifier(identifier: &str) -> Result<()> {
    let len = identifier.len();
    if len == 0 || len > MAX_IDENTIFIER_LEN || identifier.as_bytes().contains(&0) {
        return Err(Error::InvalidIdentifier { len, max: MAX_IDENTIFIER_LEN });
    }
    Ok(())
}
