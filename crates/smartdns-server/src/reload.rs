//! Hot-reload coordinator for the zones directory.
//!
//! Filesystem events for `.dns` files are debounced and then applied:
//! removals drop the zone and punch a cache hole, updates re-parse the
//! file and install the new index only when its serial strictly increases.
//! A zone that fails to parse leaves the last good index serving.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use smartdns_cache::ResponseCache;
use smartdns_metrics::metrics;
use smartdns_zone::{ensure_fqdn, is_zone_file, read_zone_file, ZoneStore};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::Result;

/// Editor saves arrive in bursts; each event waits this long before the
/// file is read.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Applies zone-file changes to the store and cache.
pub struct ReloadCoordinator {
    store: Arc<ZoneStore>,
    cache: Arc<ResponseCache<Message>>,
}

impl ReloadCoordinator {
    /// Creates a coordinator over the given store and cache.
    pub fn new(store: Arc<ZoneStore>, cache: Arc<ResponseCache<Message>>) -> Self {
        Self { store, cache }
    }

    /// Watches `dir` until shutdown is signaled. Watch errors are logged
    /// and the loop continues.
    pub async fn watch(
        self: Arc<Self>,
        dir: PathBuf,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(64);
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.blocking_send(event);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "watching zones directory");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("zone watcher stopping");
                    return Ok(());
                }
                event = rx.recv() => match event {
                    Some(Ok(event)) => self.dispatch(event),
                    Some(Err(e)) => warn!(error = %e, "zone watch error"),
                    None => return Ok(()),
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, event: Event) {
        let removal = is_removal(&event.kind);
        for path in event.paths {
            if !is_zone_file(&path) {
                continue;
            }
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(DEBOUNCE).await;
                if removal {
                    this.handle_removed(&path);
                } else {
                    this.handle_updated(&path);
                }
            });
        }
    }

    /// Re-parses a changed zone file and installs it if its serial
    /// strictly exceeds the currently installed one.
    pub fn handle_updated(&self, path: &Path) {
        let zone_file = match read_zone_file(path) {
            Ok(zf) => zf,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "zone parse failed, keeping last good");
                return;
            }
        };
        let index = match zone_file.to_index() {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "zone rejected, keeping last good");
                return;
            }
        };

        if let Some(old) = self.store.get(&index.zone_fqdn) {
            if index.serial <= old.serial {
                debug!(
                    zone = %index.zone_fqdn,
                    old_serial = old.serial,
                    new_serial = index.serial,
                    "serial did not increase, dropping reload"
                );
                return;
            }
        }

        let zone_fqdn = index.zone_fqdn.clone();
        let serial = index.serial;
        self.store.swap_zone(Arc::new(index));
        self.cache.invalidate_zone(&zone_fqdn);
        metrics().record_zone_reload();
        info!(zone = %zone_fqdn, serial, "zone reloaded");
    }

    /// Drops the zone named by the file stem and invalidates its cache
    /// slice.
    pub fn handle_removed(&self, path: &Path) {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            return;
        };
        let zone = ensure_fqdn(&stem.to_ascii_lowercase());
        self.store.remove_zone(&zone);
        self.cache.invalidate_zone(&zone);
        info!(zone = %zone, "zone removed");
    }
}

fn is_removal(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Remove(_))
        || matches!(kind, EventKind::Modify(ModifyKind::Name(RenameMode::From)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::RecordType;
    use smartdns_zone::ZoneFile;
    use std::fs;

    fn coordinator() -> (Arc<ReloadCoordinator>, Arc<ZoneStore>, Arc<ResponseCache<Message>>) {
        let store = Arc::new(ZoneStore::new());
        let cache = Arc::new(ResponseCache::new(16));
        let coordinator = Arc::new(ReloadCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
        ));
        (coordinator, store, cache)
    }

    fn zone_json(zone: &str, serial: u32) -> String {
        serde_json::json!({
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
            "records": [
                {"name": "@", "type": "A", "values": ["192.0.2.1"]}
            ]
        })
        .to_string()
    }

    fn install(store: &ZoneStore, zone: &str, serial: u32) {
        let zf: ZoneFile = serde_json::from_str(&zone_json(zone, serial)).unwrap();
        store.swap_zone(Arc::new(zf.to_index().unwrap()));
    }

    #[test]
    fn update_with_greater_serial_swaps_and_invalidates() {
        let (coordinator, store, cache) = coordinator();
        install(&store, "example.com", 1);
        cache.put_positive(
            "www.example.com.",
            RecordType::A,
            Message::new(),
            Duration::from_secs(60),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com.dns");
        fs::write(&path, zone_json("example.com", 2)).unwrap();
        coordinator.handle_updated(&path);

        assert_eq!(store.get("example.com.").unwrap().serial, 2);
        assert!(cache.get_positive("www.example.com.", RecordType::A).is_none());
    }

    #[test]
    fn stale_or_equal_serial_is_dropped() {
        let (coordinator, store, cache) = coordinator();
        install(&store, "example.com", 5);
        cache.put_positive(
            "www.example.com.",
            RecordType::A,
            Message::new(),
            Duration::from_secs(60),
        );

        let dir = tempfile::tempdir().unwrap();
        for serial in [5, 4] {
            let path = dir.path().join("example.com.dns");
            fs::write(&path, zone_json("example.com", serial)).unwrap();
            coordinator.handle_updated(&path);
            assert_eq!(store.get("example.com.").unwrap().serial, 5);
        }
        // The cache keeps serving too.
        assert!(cache.get_positive("www.example.com.", RecordType::A).is_some());
    }

    #[test]
    fn broken_file_keeps_last_good() {
        let (coordinator, store, _cache) = coordinator();
        install(&store, "example.com", 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com.dns");
        fs::write(&path, "{broken").unwrap();
        coordinator.handle_updated(&path);

        assert_eq!(store.get("example.com.").unwrap().serial, 3);
    }

    #[test]
    fn removal_drops_zone_and_cache_slice() {
        let (coordinator, store, cache) = coordinator();
        install(&store, "example.com", 1);
        cache.put_positive(
            "www.example.com.",
            RecordType::A,
            Message::new(),
            Duration::from_secs(60),
        );

        coordinator.handle_removed(Path::new("/zones/Example.com.dns"));

        assert!(store.get("example.com.").is_none());
        assert!(cache.get_positive("www.example.com.", RecordType::A).is_none());
    }

    #[test]
    fn new_zone_installs_without_predecessor() {
        let (coordinator, store, _cache) = coordinator();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.test.dns");
        fs::write(&path, zone_json("fresh.test", 1)).unwrap();
        coordinator.handle_updated(&path);
        assert!(store.get("fresh.test.").is_some());
    }
}
