//! MAC-keyed forwarding state: the adjacency table and the route cache.
//!
//! Both tables point at shared [`PeerLink`] entries. Removal marks the entry
//! invalid and erases the adjacency; routes still holding the entry treat an
//! invalid link as absent and are evicted on their next touch or by the
//! scavenger. The link itself is torn down when the last reference drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use eth_frame::MacAddr;
use parking_lot::Mutex;

pub const SCAVENGE_INTERVAL: Duration = Duration::from_secs(120);

/// Routes untouched for this long are dropped by the scavenger.
pub const ROUTE_IDLE_LIMIT: Duration = Duration::from_secs(3 * 120);

/// The stored link type; the tables only need its MAC.
pub trait LinkKey {
    fn mac(&self) -> MacAddr;
}

impl LinkKey for vlink::VirtualLink {
    fn mac(&self) -> MacAddr {
        self.mac()
    }
}

/// A link plus its validity flag, shared between the adjacency table and any
/// number of route entries.
pub struct PeerLink<L> {
    link: L,
    valid: AtomicBool,
}

impl<L> PeerLink<L> {
    fn new(link: L) -> Arc<Self> {
        Arc::new(Self {
            link,
            valid: AtomicBool::new(true),
        })
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("a route's destination and path must differ")]
    RouteToSelf,
    #[error("{0} is not an adjacent node")]
    NotAdjacent(MacAddr),
    #[error("the link to {0} is no longer valid")]
    LinkInvalid(MacAddr),
}

struct RouteEntry<L> {
    hub: Arc<PeerLink<L>>,
    last_accessed: Instant,
}

pub struct PeerNetwork<L> {
    name: String,
    tables: Mutex<Tables<L>>,
}

struct Tables<L> {
    adjacency: HashMap<MacAddr, Arc<PeerLink<L>>>,
    routes: HashMap<MacAddr, RouteEntry<L>>,
}

impl<L> PeerNetwork<L>
where
    L: LinkKey + Clone,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Mutex::new(Tables {
                adjacency: HashMap::new(),
                routes: HashMap::new(),
            }),
        }
    }

    /// Inserts the adjacency entry for `link.mac()`, replacing (and
    /// invalidating) any previous entry for that peer.
    pub fn add(&self, link: L) {
        let mac = link.mac();
        let mut tables = self.tables.lock();

        if let Some(previous) = tables.adjacency.insert(mac, PeerLink::new(link)) {
            previous.invalidate();
            tracing::warn!(%mac, network = %self.name, "Replaced an existing adjacency entry");
        } else {
            tracing::debug!(%mac, network = %self.name, "Added adjacent node");
        }
    }

    /// Invalidates and erases the adjacency entry. Routes through it are
    /// evicted lazily.
    pub fn remove(&self, mac: MacAddr) -> Result<(), TopologyError> {
        let mut tables = self.tables.lock();

        let hub = tables
            .adjacency
            .remove(&mac)
            .ok_or(TopologyError::NotAdjacent(mac))?;
        hub.invalidate();

        tracing::debug!(%mac, network = %self.name, refs = Arc::strong_count(&hub), "Removed adjacent node");

        Ok(())
    }

    /// Points `dest` at the adjacency entry of `via`.
    pub fn update_route(&self, dest: MacAddr, via: MacAddr) -> Result<(), TopologyError> {
        if dest == via {
            return Err(TopologyError::RouteToSelf);
        }

        let mut tables = self.tables.lock();
        let hub = tables
            .adjacency
            .get(&via)
            .ok_or(TopologyError::NotAdjacent(via))?;

        if !hub.is_valid() {
            return Err(TopologyError::LinkInvalid(via));
        }

        let entry = RouteEntry {
            hub: hub.clone(),
            last_accessed: Instant::now(),
        };
        tables.routes.insert(dest, entry);

        tracing::debug!(%dest, %via, network = %self.name, "Updated route");

        Ok(())
    }

    pub fn get_vlink(&self, mac: MacAddr) -> Option<L> {
        let tables = self.tables.lock();
        let hub = tables.adjacency.get(&mac)?;

        Some(hub.link().clone())
    }

    /// Returns the link a route points at, refreshing its access time.
    /// A route whose link became invalid is evicted instead.
    pub fn get_route(&self, mac: MacAddr) -> Option<L> {
        let mut tables = self.tables.lock();

        let is_valid = tables.routes.get(&mac)?.hub.is_valid();
        if !is_valid {
            tables.routes.remove(&mac);
            return None;
        }

        let entry = tables.routes.get_mut(&mac)?;
        entry.last_accessed = Instant::now();
        Some(entry.hub.link().clone())
    }

    pub fn is_adjacent(&self, mac: MacAddr) -> bool {
        self.tables.lock().adjacency.contains_key(&mac)
    }

    /// Evicts the entry if its link became invalid.
    pub fn is_route_exists(&self, mac: MacAddr) -> bool {
        let mut tables = self.tables.lock();

        match tables.routes.get(&mac) {
            Some(entry) if entry.hub.is_valid() => true,
            Some(_) => {
                tables.routes.remove(&mac);
                false
            }
            None => false,
        }
    }

    /// Drops routes whose link is invalid or which sat untouched past the
    /// idle limit.
    pub fn scavenge(&self, now: Instant) {
        let mut tables = self.tables.lock();

        tables.routes.retain(|mac, entry| {
            let keep = entry.hub.is_valid()
                && now.saturating_duration_since(entry.last_accessed) <= ROUTE_IDLE_LIMIT;
            if !keep {
                tracing::debug!(%mac, network = %self.name, "Scavenging route");
            }
            keep
        });
    }

    /// Invalidates and drops every entry; part of network shutdown.
    pub fn clear(&self) {
        let mut tables = self.tables.lock();

        for hub in tables.adjacency.values() {
            hub.invalidate();
        }
        tables.adjacency.clear();
        tables.routes.clear();
    }

    pub fn adjacent_count(&self) -> usize {
        self.tables.lock().adjacency.len()
    }

    pub fn route_count(&self) -> usize {
        self.tables.lock().routes.len()
    }
}

/// Periodic route sweep; ends when the network is dropped by everyone else.
pub fn spawn_scavenger<L>(peers: Arc<PeerNetwork<L>>) -> tokio::task::JoinHandle<()>
where
    L: LinkKey + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SCAVENGE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            peers.scavenge(Instant::now());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct DummyLink {
        mac: MacAddr,
    }

    impl DummyLink {
        fn new(last_octet: u8) -> Self {
            Self {
                mac: MacAddr::new([2, 0, 0, 0, 0, last_octet]),
            }
        }
    }

    impl LinkKey for DummyLink {
        fn mac(&self) -> MacAddr {
            self.mac
        }
    }

    fn network() -> PeerNetwork<DummyLink> {
        PeerNetwork::new("tnl0")
    }

    #[test]
    fn get_route_implies_adjacency() {
        let peers = network();
        let via = DummyLink::new(1);
        let dest = MacAddr::new([2, 0, 0, 0, 0, 9]);

        peers.add(via.clone());
        peers.update_route(dest, via.mac()).unwrap();

        let routed = peers.get_route(dest).unwrap();
        assert!(peers.is_adjacent(routed.mac()));
    }

    #[test]
    fn route_to_self_is_rejected_without_mutation() {
        let peers = network();
        let link = DummyLink::new(1);
        peers.add(link.clone());

        let err = peers.update_route(link.mac(), link.mac()).unwrap_err();

        assert_eq!(err, TopologyError::RouteToSelf);
        assert_eq!(peers.route_count(), 0);
    }

    #[test]
    fn route_via_unknown_peer_is_rejected() {
        let peers = network();
        let dest = MacAddr::new([2, 0, 0, 0, 0, 9]);
        let via = MacAddr::new([2, 0, 0, 0, 0, 8]);

        assert_eq!(
            peers.update_route(dest, via),
            Err(TopologyError::NotAdjacent(via))
        );
    }

    #[test]
    fn removal_evicts_routes_on_next_lookup() {
        let peers = network();
        let via = DummyLink::new(1);
        let dest = MacAddr::new([2, 0, 0, 0, 0, 9]);

        peers.add(via.clone());
        peers.update_route(dest, via.mac()).unwrap();
        peers.remove(via.mac()).unwrap();

        assert!(peers.get_vlink(via.mac()).is_none());
        assert!(!peers.is_route_exists(dest));
        assert!(peers.get_route(dest).is_none());
        assert_eq!(peers.route_count(), 0);
    }

    #[test]
    fn removal_evicts_routes_by_scavenger() {
        let peers = network();
        let via = DummyLink::new(1);
        let dest = MacAddr::new([2, 0, 0, 0, 0, 9]);

        peers.add(via.clone());
        peers.update_route(dest, via.mac()).unwrap();
        peers.remove(via.mac()).unwrap();

        peers.scavenge(Instant::now());

        assert_eq!(peers.route_count(), 0);
    }

    #[test]
    fn idle_routes_are_scavenged_after_three_intervals() {
        let peers = network();
        let via = DummyLink::new(1);
        let dest = MacAddr::new([2, 0, 0, 0, 0, 9]);

        peers.add(via.clone());
        peers.update_route(dest, via.mac()).unwrap();

        peers.scavenge(Instant::now() + ROUTE_IDLE_LIMIT / 2);
        assert_eq!(peers.route_count(), 1);

        peers.scavenge(Instant::now() + ROUTE_IDLE_LIMIT + Duration::from_secs(1));
        assert_eq!(peers.route_count(), 0);
    }

    #[test]
    fn lookups_refresh_route_access_time() {
        let peers = network();
        let via = DummyLink::new(1);
        let dest = MacAddr::new([2, 0, 0, 0, 0, 9]);

        peers.add(via.clone());
        peers.update_route(dest, via.mac()).unwrap();

        let later = Instant::now() + ROUTE_IDLE_LIMIT - Duration::from_secs(1);
        assert!(peers.get_route(dest).is_some());

        // Accessed just now, so a sweep close to the limit keeps it.
        peers.scavenge(later);
        assert_eq!(peers.route_count(), 1);
    }

    #[test]
    fn replacing_an_adjacency_invalidates_the_old_entry_routes() {
        let peers = network();
        let old = DummyLink::new(1);
        let dest = MacAddr::new([2, 0, 0, 0, 0, 9]);

        peers.add(old.clone());
        peers.update_route(dest, old.mac()).unwrap();

        // Same MAC, fresh link: the route through the old entry dies.
        peers.add(DummyLink::new(1));

        assert!(!peers.is_route_exists(dest));
        assert!(peers.is_adjacent(old.mac()));
    }

    #[test]
    fn clear_invalidates_everything() {
        let peers = network();
        peers.add(DummyLink::new(1));
        peers.add(DummyLink::new(2));
        peers
            .update_route(MacAddr::new([2, 0, 0, 0, 0, 9]), DummyLink::new(1).mac())
            .unwrap();

        peers.clear();

        assert_eq!(peers.adjacent_count(), 0);
        assert_eq!(peers.route_count(), 0);
    }
}
