//! Directory loader for `.dns` zone files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::model::{ZoneFile, ZoneIndex};
use crate::{Result, ZoneError};

/// Loads every zone file under `dir`, recursively.
///
/// A zone file is any file whose name ends in `.dns` (case-insensitive).
/// Files are processed in sorted path order so repeated loads of an
/// unchanged directory are deterministic. A file that fails to parse or
/// validate is logged and skipped; the load as a whole fails only when no
/// zone loads at all.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<HashMap<String, Arc<ZoneIndex>>> {
    let dir = dir.as_ref();
    let mut paths = Vec::new();
    collect_zone_files(dir, &mut paths)?;
    paths.sort();

    let mut zones = HashMap::new();
    for path in &paths {
        match load_zone(path) {
            Ok(index) => {
                debug!(
                    zone = %index.zone_fqdn,
                    serial = index.serial,
                    records = index.record_count(),
                    path = %path.display(),
                    "loaded zone"
                );
                zones.insert(index.zone_fqdn.clone(), Arc::new(index));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping zone file");
            }
        }
    }

    if zones.is_empty() {
        return Err(ZoneError::NoZones {
            dir: dir.to_path_buf(),
        });
    }
    Ok(zones)
}

/// Reads and decodes a single zone file.
pub fn read_zone_file(path: impl AsRef<Path>) -> Result<ZoneFile> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn load_zone(path: &Path) -> Result<ZoneIndex> {
    read_zone_file(path)?.to_index()
}

/// Returns true for names ending in `.dns`, case-insensitive.
pub fn is_zone_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_ascii_lowercase().ends_with(".dns"))
        .unwrap_or(false)
}

fn collect_zone_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_zone_files(&path, out)?;
        } else if is_zone_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}
