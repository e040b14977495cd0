// ===============================
// src/trade_state.rs
// ===============================
//
// Idempotency record per coin, disimpan sebagai satu dokumen JSON:
//
//   { "ETH": { "opened": true, "timestamp": "2025-01-01T00:00:00+00:00", "order_id": "8389765" } }
//
// Setiap mutasi ditulis ke `<file>.tmp`, di-fsync, lalu di-rename atomik.
// Peta in-memory baru diganti SETELAH tulis sukses.
// File dibaca ulang tiap akses, jadi `state reset` dari proses lain langsung
// berlaku untuk proses yang sedang jalan (dan tidak tertimpa tulis berikutnya).
//
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub opened: bool,
    #[serde(rename = "timestamp")]
    pub timestamp_iso: String,
    #[serde(rename = "order_id")]
    pub action_ref: String,
}

pub type TradeMap = BTreeMap<String, TradeRecord>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("serialize trade state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> PersistenceError + 'a {
    move |source| PersistenceError::Io { op, path: path.to_path_buf(), source }
}

enum Disk {
    Missing,
    Loaded(TradeMap),
    Bad(String),
}

fn read_disk(path: &Path) -> Disk {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Disk::Missing,
        Err(e) => return Disk::Bad(format!("unreadable: {e}")),
    };
    match serde_json::from_str::<TradeMap>(&raw) {
        Ok(m) => Disk::Loaded(m),
        Err(e) => Disk::Bad(format!("corrupt: {e}")),
    }
}

/// Read the state file. Missing, unreadable or corrupt -> empty map (with a warning).
pub fn load_file(path: &Path) -> TradeMap {
    match read_disk(path) {
        Disk::Missing => TradeMap::new(),
        Disk::Loaded(m) => m,
        Disk::Bad(why) => {
            warn!(path = %path.display(), error = %why, "trade state unusable, starting empty");
            TradeMap::new()
        }
    }
}

pub fn write_atomic(path: &Path, state: &TradeMap) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err("create dir", parent))?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let payload = serde_json::to_vec_pretty(state)?;

    {
        let mut file = File::create(&tmp).map_err(io_err("create", &tmp))?;
        file.write_all(&payload).map_err(io_err("write", &tmp))?;
        file.sync_all().map_err(io_err("sync", &tmp))?;
    }

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err("rename", path)(err));
    }
    Ok(())
}

#[derive(Debug)]
pub struct TradeStateStore {
    path: PathBuf,
    state: Mutex<TradeMap>,
}

impl TradeStateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_file(&path);
        let opened = state.values().filter(|r| r.opened).count();
        info!(path = %path.display(), records = state.len(), opened, "trade state loaded");
        Self { path, state: Mutex::new(state) }
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Lock, then pick up whatever `state reset` (another process) wrote.
    /// File hilang = semua di-reset; file rusak = pakai salinan in-memory.
    fn lock(&self) -> std::sync::MutexGuard<'_, TradeMap> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match read_disk(&self.path) {
            Disk::Missing => guard.clear(),
            Disk::Loaded(m) => {
                if *guard != m {
                    debug!(path = %self.path.display(), records = m.len(), "trade state changed on disk, reloaded");
                    *guard = m;
                }
            }
            Disk::Bad(why) => {
                warn!(path = %self.path.display(), error = %why, "trade state file unusable, keeping in-memory copy");
            }
        }
        guard
    }

    pub fn is_opened(&self, subject: &str) -> bool {
        self.lock().get(subject).map(|r| r.opened).unwrap_or(false)
    }

    #[cfg(test)]
    pub fn get(&self, subject: &str) -> Option<TradeRecord> { self.lock().get(subject).cloned() }

    pub fn list(&self) -> TradeMap { self.lock().clone() }

    pub fn opened_subjects(&self) -> Vec<String> {
        self.lock().iter().filter(|(_, r)| r.opened).map(|(k, _)| k.clone()).collect()
    }

    /// Apply `f` to a copy, persist it, then swap it in. On error nothing changes.
    fn mutate<R>(&self, f: impl FnOnce(&mut TradeMap) -> R) -> Result<R, PersistenceError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next);
        write_atomic(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    pub fn mark_opened(&self, subject: &str, action_ref: &str) -> Result<(), PersistenceError> {
        let record = TradeRecord {
            opened: true,
            timestamp_iso: Utc::now().to_rfc3339(),
            action_ref: action_ref.to_string(),
        };
        self.mutate(|m| {
            m.insert(subject.to_string(), record);
        })
    }

    /// `true` if a record existed.
    pub fn reset(&self, subject: &str) -> Result<bool, PersistenceError> {
        self.mutate(|m| m.remove(subject).is_some())
    }

    /// Number of records cleared.
    pub fn reset_all(&self) -> Result<usize, PersistenceError> {
        self.mutate(|m| {
            let n = m.len();
            m.clear();
            n
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = TradeStateStore::open(dir.path().join("trade_state.json"));
        assert!(!store.is_opened("ETH"));
        store.mark_opened("ETH", "ord-1").unwrap();
        assert!(store.is_opened("ETH"));
        assert!(!store.is_opened("BTC"));
        assert!(store.reset("ETH").unwrap());
        assert!(!store.is_opened("ETH"));
        assert!(!store.reset("ETH").unwrap());
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trade_state.json");
        let store = TradeStateStore::open(&path);
        store.mark_opened("ETH", "ord-1").unwrap();
        store.mark_opened("BTC", "ord-2").unwrap();

        let reloaded = TradeStateStore::open(&path);
        assert_eq!(reloaded.list(), store.list());
        assert_eq!(reloaded.get("BTC").unwrap().action_ref, "ord-2");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn file_uses_original_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = TradeStateStore::open(&path);
        store.mark_opened("ETH", "42").unwrap();
        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["ETH"]["opened"], true);
        assert_eq!(raw["ETH"]["order_id"], "42");
        assert!(raw["ETH"]["timestamp"].is_string());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        fs::write(&path, "{\"ETH\": {\"opened\": tr").unwrap();
        let store = TradeStateStore::open(&path);
        assert!(store.list().is_empty());
        // still usable afterwards
        store.mark_opened("ETH", "x").unwrap();
        assert!(TradeStateStore::open(&path).is_opened("ETH"));
    }

    #[test]
    fn failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // parent "directory" is a regular file, so every write fails
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let store = TradeStateStore::open(blocker.join("trade_state.json"));

        let err = store.mark_opened("ETH", "ord-1").unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
        assert!(!store.is_opened("ETH"));
        assert!(store.list().is_empty());
    }

    #[test]
    fn reset_from_another_store_rearms_running_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade_state.json");
        let daemon = TradeStateStore::open(&path);
        daemon.mark_opened("ETH", "ord-1").unwrap();

        // `state reset ETH` dari proses lain
        let admin = TradeStateStore::open(&path);
        assert!(admin.reset("ETH").unwrap());

        assert!(!daemon.is_opened("ETH"));
        daemon.mark_opened("BTC", "ord-2").unwrap();
        let on_disk = load_file(&path);
        assert!(!on_disk.contains_key("ETH"));
        assert!(on_disk["BTC"].opened);
    }

    #[test]
    fn deleted_file_means_reset_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = TradeStateStore::open(&path);
        store.mark_opened("ETH", "1").unwrap();
        fs::remove_file(&path).unwrap();
        assert!(!store.is_opened("ETH"));
    }

    #[test]
    fn corrupt_file_mid_run_keeps_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = TradeStateStore::open(&path);
        store.mark_opened("ETH", "1").unwrap();
        fs::write(&path, b"{ half").unwrap();
        assert!(store.is_opened("ETH"));
    }

    #[test]
    fn reset_all_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = TradeStateStore::open(&path);
        store.mark_opened("ETH", "1").unwrap();
        store.mark_opened("BTC", "2").unwrap();
        assert_eq!(store.reset_all().unwrap(), 2);
        assert!(TradeStateStore::open(&path).list().is_empty());
    }
}
