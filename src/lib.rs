//! An authoritative primary zone DNSSEC engine: RRSet storage, NSEC/NSEC3
//! denial-of-existence maintenance, a key lifecycle state machine, SOA
//! serial management with IXFR history, and outbound NOTIFY dispatch.
//!
//! This crate is the "hard core" described in `SPEC_FULL.md`: it owns
//! signing and key lifecycle, and reaches every external surface — an HTTP
//! admin API, zone-file persistence, query dispatch, recursive resolution —
//! only through the traits in [`interfaces`].

pub mod committer;
pub mod config;
pub mod denial;
pub mod error;
pub mod history;
pub mod interfaces;
pub mod keys;
pub mod log;
pub mod notify;
pub mod rr;
pub mod signer;
pub mod zone;
pub mod zonetree;

pub use config::EngineConfig;
pub use error::EngineError;
pub use keys::{KeyAlgorithm, KeyKind, KeyState};
pub use rr::{OwnedRr, StoredName};
pub use zone::{ApexZone, DenialKind, DnssecStatus};
