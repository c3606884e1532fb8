//! The zone snapshot catalog: one shared pointer to an immutable
//! `ZoneSet`, swapped atomically on reload.
//!
//! Readers take a [`Lease`] for the duration of one query and resolve
//! every question of that query against the same snapshot.  Writers
//! publish a whole new snapshot and never touch the old one; the old
//! snapshot is reclaimed when the last lease against it is released,
//! so readers are never blocked and never observe a torn zone.

use arc_swap::ArcSwap;
use std::ops::Deref;
use std::sync::Arc;

use dns_types::zones::types::ZoneSet;

/// The current-zones cell.  This is the only state shared between
/// worker tasks.
#[derive(Debug)]
pub struct Catalog {
    current: ArcSwap<ZoneSet>,
}

impl Catalog {
    pub fn new(zones: ZoneSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(zones),
        }
    }

    /// Pin the current snapshot.  Wait-free; holders must not keep the
    /// lease across a blocking wait (transports acquire it after a
    /// message has been read and release it before sending).
    pub fn lease(&self) -> Lease {
        Lease {
            zones: self.current.load_full(),
        }
    }

    /// Install a new snapshot.  Queries whose lease was taken before
    /// the swap keep answering from the old zones; queries leased
    /// after it observe the new ones.  The old snapshot is dropped
    /// here and freed once the final lease goes away.
    pub fn publish(&self, zones: ZoneSet) {
        self.current.store(Arc::new(zones));
    }
}

/// A pinned zone snapshot.  Holding one defers reclamation of the
/// snapshot it points at, nothing more.
#[derive(Debug, Clone)]
pub struct Lease {
    zones: Arc<ZoneSet>,
}

impl Deref for Lease {
    type Target = ZoneSet;

    fn deref(&self) -> &ZoneSet {
        &self.zones
    }
}
