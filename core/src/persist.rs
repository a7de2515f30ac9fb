use crate::error::{SearchError, SearchResult};
use crate::store::StoreValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk image of the whole store.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: String,
    pub entries: BTreeMap<String, Arc<StoreValue>>,
}

impl Snapshot {
    pub fn new(entries: BTreeMap<String, Arc<StoreValue>>) -> Self {
        let saved_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        Self { version: SNAPSHOT_VERSION, saved_at, entries }
    }
}

/// Writes the snapshot next to `path` and renames it into place, so readers
/// only ever see a complete file.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> SearchResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let bytes = bincode::serialize(snapshot)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SearchError::from(e.error))?;
    Ok(())
}

/// `Ok(None)` when no snapshot exists; `StoreUnavailable` when it cannot be decoded.
pub fn load_snapshot(path: &Path) -> SearchResult<Option<Snapshot>> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SearchError::StoreUnavailable(e.to_string())),
    };
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).map_err(|e| SearchError::StoreUnavailable(e.to_string()))?;
    let snapshot: Snapshot =
        bincode::deserialize(&buf).map_err(|e| SearchError::StoreUnavailable(format!("corrupt snapshot: {e}")))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SearchError::StoreUnavailable(format!("unsupported snapshot version {}", snapshot.version)));
    }
    Ok(Some(snapshot))
}

/// Moves an unreadable snapshot aside as `<file>.corrupt`.
pub fn quarantine(path: &Path) -> SearchResult<PathBuf> {
    let mut name = path.as_os_str().to_os_string();
    name.push(".corrupt");
    let target = PathBuf::from(name);
    fs::rename(path, &target)?;
    Ok(target)
}
