//! Peer identity: the identify wire record and the TTL cache built on it

pub mod cache;
pub mod record;

pub use cache::{IdentityCacheStats, PeerIdentityCache, PeerIdentityEntry};
pub use record::{read_identify_record, write_identify_record, IdentifyRecord, LENGTH_PREFIX_LEN};
