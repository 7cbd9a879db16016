//! Process-wide zone registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::{ensure_fqdn, ZoneIndex};

/// Registry of zones keyed by lowercase zone FQDN.
///
/// Many readers, rare writer: readers take the read lock just long enough
/// to clone out an `Arc<ZoneIndex>` handle, then resolve against the
/// immutable index without any lock. [`ZoneStore::swap_zone`] under the
/// write lock is the linearization point for zone visibility.
#[derive(Debug, Default)]
pub struct ZoneStore {
    zones: RwLock<HashMap<String, Arc<ZoneIndex>>>,
}

impl ZoneStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the zone whose FQDN is the longest suffix of `qname`,
    /// together with that FQDN. Zone FQDNs are unique, so ties cannot
    /// occur. Linear in the number of zones.
    pub fn get_zone_for_name(&self, qname: &str) -> Option<(Arc<ZoneIndex>, String)> {
        let name = qname.to_ascii_lowercase();
        let zones = self.zones.read();
        let mut best: Option<(&String, &Arc<ZoneIndex>)> = None;
        for (zone, index) in zones.iter() {
            if name.ends_with(zone.as_str())
                && best.map(|(b, _)| zone.len() > b.len()).unwrap_or(true)
            {
                best = Some((zone, index));
            }
        }
        best.map(|(zone, index)| (Arc::clone(index), zone.clone()))
    }

    /// Returns the zone registered under exactly this FQDN.
    pub fn get(&self, zone_fqdn: &str) -> Option<Arc<ZoneIndex>> {
        self.zones.read().get(zone_fqdn).cloned()
    }

    /// Inserts or replaces the zone keyed by `index.zone_fqdn`.
    pub fn swap_zone(&self, index: Arc<ZoneIndex>) {
        self.zones.write().insert(index.zone_fqdn.clone(), index);
    }

    /// Removes a zone. The name is coerced to lowercase FQDN form.
    pub fn remove_zone(&self, zone: &str) {
        let key = ensure_fqdn(zone).to_ascii_lowercase();
        self.zones.write().remove(&key);
    }

    /// Returns a shallow copy of the current zone map.
    pub fn snapshot(&self) -> HashMap<String, Arc<ZoneIndex>> {
        self.zones.read().clone()
    }

    /// Returns the number of registered zones.
    pub fn len(&self) -> usize {
        self.zones.read().len()
    }

    /// Returns true if no zones are registered.
    pub fn is_empty(&self) -> bool {
        self.zones.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ZoneFile;

    fn index(zone: &str, serial: u32) -> Arc<ZoneIndex> {
        let zf: ZoneFile = serde_json::from_value(serde_json::json!({
            "zone": zone,
            "serial": serial,
            "ttl_default": 300,
            "soa": {
                "mname": format!("ns1.{zone}."),
                "rname": format!("hostmaster.{zone}."),
                "refresh": 3600,
                "retry": 600,
                "expire": 604800,
                "negative_ttl": 60
            },
            "ns": [format!("ns1.{zone}.")],
            "records": []
        }))
        .unwrap();
        Arc::new(zf.to_index().unwrap())
    }

    #[test]
    fn longest_suffix_wins() {
        let store = ZoneStore::new();
        store.swap_zone(index("example.com", 1));
        store.swap_zone(index("sub.example.com", 1));

        let (zone, fqdn) = store.get_zone_for_name("www.sub.example.com.").unwrap();
        assert_eq!(fqdn, "sub.example.com.");
        assert_eq!(zone.zone_fqdn, "sub.example.com.");

        let (_, fqdn) = store.get_zone_for_name("www.example.com.").unwrap();
        assert_eq!(fqdn, "example.com.");

        assert!(store.get_zone_for_name("www.example.org.").is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let store = ZoneStore::new();
        store.swap_zone(index("example.com", 1));
        assert!(store.get_zone_for_name("WWW.EXAMPLE.COM.").is_some());
    }

    #[test]
    fn swap_replaces_and_remove_deletes() {
        let store = ZoneStore::new();
        store.swap_zone(index("example.com", 1));
        store.swap_zone(index("example.com", 2));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("example.com.").unwrap().serial, 2);

        // Removal accepts the bare zone name.
        store.remove_zone("example.com");
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_is_detached() {
        let store = ZoneStore::new();
        store.swap_zone(index("example.com", 1));
        let snap = store.snapshot();
        store.remove_zone("example.com.");
        assert_eq!(snap.len(), 1);
    }
}
