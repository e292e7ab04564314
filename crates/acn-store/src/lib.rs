//! Persistent agent record store.
//!
//! A Peer appends every accepted relay registration to a flat file of
//! `[u32 big-endian length][JSON AgentRecord]` frames and replays it on
//! startup. The file is only ever appended to; readers fold the sequence in
//! order so the last record for an address wins.

pub mod records;

pub use records::{read_records, RecordStore, StoreError, StoreResult};
