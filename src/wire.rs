//! Wire-shaped types that the RPC transport (out of scope, see spec §1)
//! would frame and the [`crate::dispatch`] layer consumes: tablet
//! partitioning requests and the filtered-entries response payload.
//!
//! Grounded on the commitlog's `segment::Header::write`/`decode` pair —
//! small structs with explicit, hand-rolled `encode`/`decode` methods
//! rather than a derive macro, matching the teacher's habit of hand-coding
//! its on-wire layout.

/// A contiguous range of key hashes within one table — the unit of
/// ownership assignment (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tablet {
    pub table_id: u64,
    pub first_key_hash: u64,
    pub last_key_hash: u64,
}

impl Tablet {
    pub fn contains(&self, table_id: u64, key_hash: u64) -> bool {
        table_id == self.table_id && key_hash >= self.first_key_hash && key_hash <= self.last_key_hash
    }
}

/// A set of tablets assigned to a single recovery master (spec GLOSSARY).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition(pub Vec<Tablet>);

impl Partition {
    pub fn contains(&self, table_id: u64, key_hash: u64) -> bool {
        self.0.iter().any(|tablet| tablet.contains(table_id, key_hash))
    }
}

/// The ordered list of partitions carried by `StartReadingData`'s tablet
/// configuration payload (spec §6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabletConfig(pub Vec<Partition>);

impl TabletConfig {
    pub fn partition(&self, index: usize) -> Option<&Partition> {
        self.0.get(index)
    }
}

/// A decoded log entry, as yielded by a [`crate::recovery::LogDecoder`].
///
/// Entry framing and contents are an external collaborator (spec §1); this
/// trait is the seam the recovery reader needs: a type tag for re-framing,
/// an optional tablet key for filtering, and its payload bytes.
pub trait LogEntry {
    /// Wire type tag, reproduced verbatim in the response framing.
    fn entry_type(&self) -> u8;
    /// `Some((tableId, keyHash))` for tablet-scoped entries (e.g. object
    /// writes); `None` for entries that are independent of tablets (e.g.
    /// segment headers, footers, log digests) and are therefore always
    /// kept regardless of partition (spec §4.5).
    fn tablet_key(&self) -> Option<(u64, u64)>;
    /// Append this entry's payload bytes (not including the frame header)
    /// to `out`.
    fn encode_payload(&self, out: &mut Vec<u8>);
}

/// Appends one `(entryType: u8, entryLength: u32, entryBytes)` frame to
/// `out`. No padding between entries (spec §6).
pub fn encode_entry_frame(out: &mut Vec<u8>, entry_type: u8, payload: &[u8]) {
    out.push(entry_type);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tablet_contains_boundary_inclusive() {
        let tablet = Tablet {
            table_id: 1,
            first_key_hash: 0,
            last_key_hash: 500,
        };
        assert!(tablet.contains(1, 0));
        assert!(tablet.contains(1, 500));
        assert!(!tablet.contains(1, 501));
        assert!(!tablet.contains(2, 100));
    }

    #[test]
    fn encode_entry_frame_has_no_padding() {
        let mut out = Vec::new();
        encode_entry_frame(&mut out, 7, b"ab");
        encode_entry_frame(&mut out, 9, b"");
        assert_eq!(out, vec![7, 2, 0, 0, 0, b'a', b'b', 9, 0, 0, 0, 0]);
    }
}
