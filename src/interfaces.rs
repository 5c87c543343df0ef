//! External collaborator interfaces (spec §6).
//!
//! The engine is the "hard core" the spec describes; everything in this
//! module is a seam where a hosting process plugs in the surfaces the spec
//! calls out as out of scope (HTTP admin API, zone-file persistence, query
//! dispatch, outbound transports). Modeling them as traits rather than
//! concrete types keeps this crate free of a dependency on any particular
//! transport or storage stack.

use std::future::Future;
use std::pin::Pin;

use crate::rr::StoredName;

/// A future boxed for storage in a trait object, since `async fn` in traits
/// is not dyn-compatible without a helper crate — and this crate otherwise
/// has no reason to depend on one.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Looks up whether the parent zone's DS RRset currently contains a given
/// key tag — the guard for a KSK's Ready → Active transition (spec §4.E,
/// §6 "Parent DS query for KSK activation check").
pub trait DsLookup: Send + Sync {
    fn contains_key_tag<'a>(&'a self, apex: &'a StoredName, key_tag: u16) -> BoxFuture<'a, bool>;
}

/// A `DsLookup` that never observes any key — useful for zones operated
/// without a delegation, or in tests that do not exercise KSK activation.
pub struct NeverObservesDs;

impl DsLookup for NeverObservesDs {
    fn contains_key_tag<'a>(&'a self, _apex: &'a StoredName, _key_tag: u16) -> BoxFuture<'a, bool> {
        Box::pin(async { false })
    }
}

/// Sends an outbound NOTIFY datagram to one target and reports whether it
/// was acknowledged (spec §6, "NOTIFY datagram").
pub trait NotifyTransport: Send + Sync {
    fn send_notify<'a>(
        &'a self,
        target: std::net::SocketAddr,
        apex: &'a StoredName,
        serial: u32,
    ) -> BoxFuture<'a, Result<(), String>>;
}

/// The persistence callback the engine invokes after every commit (spec §6,
/// "Persistence callback"). The collaborator owns durability; the engine
/// only needs to know the call happened.
pub trait ZonePersister: Send + Sync {
    fn save_zone<'a>(&'a self, apex: &'a StoredName) -> BoxFuture<'a, ()>;
}

/// A `ZonePersister` that does nothing — the default for zones whose host
/// process handles persistence out of band (e.g. in tests).
pub struct NoopPersister;

impl ZonePersister for NoopPersister {
    fn save_zone<'a>(&'a self, _apex: &'a StoredName) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}
