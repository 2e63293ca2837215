//! Versioned key-value store backing all control-plane state
//!
//! A thin layer over redb that adds a process-wide monotonic revision,
//! per-key compare-and-set, atomic multi-key batches, and prefix watches.
//! The store is the only authoritative state in the system; everything else
//! is cache or derivation. Failure of a write surfaces as
//! `storage_unavailable` and is fatal for the mutation path that hit it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{KestrelError, KestrelResult};

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const REV_KEY: &str = "rev";
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Expected revision for a compare-and-set operation.
///
/// `Absent` asserts the key does not exist; `Rev(n)` asserts the key's
/// last-modified revision is exactly `n`; `Any` skips the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Any,
    Absent,
    Rev(u64),
}

/// One operation inside an atomic batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        key: String,
        value: Vec<u8>,
        expected: Expected,
    },
    Delete {
        key: String,
        expected: Expected,
    },
}

impl BatchOp {
    /// Serialize a typed value into a put op.
    pub fn put_typed<T: Serialize>(
        key: impl Into<String>,
        value: &T,
        expected: Expected,
    ) -> KestrelResult<Self> {
        Ok(BatchOp::Put {
            key: key.into(),
            value: bincode::serialize(value)?,
            expected,
        })
    }

    pub fn delete(key: impl Into<String>, expected: Expected) -> Self {
        BatchOp::Delete {
            key: key.into(),
            expected,
        }
    }
}

/// A change notification; `value` of `None` means the key was deleted.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub rev: u64,
}

#[derive(Serialize, Deserialize)]
struct Versioned {
    rev: u64,
    data: Vec<u8>,
}

/// The versioned store
pub struct Store {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> KestrelResult<Self> {
        let db = Database::create(path)?;
        // Make sure the tables exist so first reads do not fail.
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(KV_TABLE)?;
            let _ = txn.open_table(META_TABLE)?;
        }
        txn.commit()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(db),
            events,
        })
    }

    /// Current store revision. Zero for an empty store.
    pub fn current_rev(&self) -> KestrelResult<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        Ok(table.get(REV_KEY)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Get a raw value and the revision it was last written at.
    pub fn get(&self, key: &str) -> KestrelResult<Option<(Vec<u8>, u64)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        match table.get(key)? {
            Some(guard) => {
                let versioned: Versioned = bincode::deserialize(guard.value())?;
                Ok(Some((versioned.data, versioned.rev)))
            }
            None => Ok(None),
        }
    }

    /// Get a typed value.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> KestrelResult<Option<(T, u64)>> {
        match self.get(key)? {
            Some((data, rev)) => Ok(Some((bincode::deserialize(&data)?, rev))),
            None => Ok(None),
        }
    }

    /// Put a single value with a CAS check. Returns the new revision.
    pub fn put(&self, key: &str, value: Vec<u8>, expected: Expected) -> KestrelResult<u64> {
        self.batch(vec![BatchOp::Put {
            key: key.to_string(),
            value,
            expected,
        }])
    }

    /// Put a typed value with a CAS check.
    pub fn put_typed<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expected: Expected,
    ) -> KestrelResult<u64> {
        self.put(key, bincode::serialize(value)?, expected)
    }

    /// Delete a key with a CAS check.
    pub fn delete(&self, key: &str, expected: Expected) -> KestrelResult<u64> {
        self.batch(vec![BatchOp::Delete {
            key: key.to_string(),
            expected,
        }])
    }

    /// Apply a batch atomically. Either every op commits under one new
    /// revision, or the whole batch fails with `conflict` and nothing is
    /// written.
    pub fn batch(&self, ops: Vec<BatchOp>) -> KestrelResult<u64> {
        if ops.is_empty() {
            return self.current_rev();
        }
        let txn = self.db.begin_write()?;
        let new_rev;
        let mut pending: Vec<(String, Option<Vec<u8>>)> = Vec::with_capacity(ops.len());
        {
            let mut table = txn.open_table(KV_TABLE)?;
            let mut meta = txn.open_table(META_TABLE)?;
            let current = meta.get(REV_KEY)?.map(|g| g.value()).unwrap_or(0);
            new_rev = current + 1;

            for op in &ops {
                let (key, expected) = match op {
                    BatchOp::Put { key, expected, .. } => (key, expected),
                    BatchOp::Delete { key, expected } => (key, expected),
                };
                let found = match table.get(key.as_str())? {
                    Some(guard) => Some(bincode::deserialize::<Versioned>(guard.value())?.rev),
                    None => None,
                };
                match (*expected, found) {
                    (Expected::Any, _) => {}
                    (Expected::Absent, None) => {}
                    (Expected::Absent, Some(rev)) => {
                        return Err(KestrelError::conflict(
                            key.clone(),
                            format!("expected absent, found rev {}", rev),
                        ));
                    }
                    (Expected::Rev(want), Some(have)) if want == have => {}
                    (Expected::Rev(want), Some(have)) => {
                        return Err(KestrelError::conflict(
                            key.clone(),
                            format!("expected rev {}, found rev {}", want, have),
                        ));
                    }
                    (Expected::Rev(_), None) => {
                        return Err(KestrelError::not_found(key.clone()));
                    }
                }
                if matches!(op, BatchOp::Delete { .. }) && found.is_none() {
                    return Err(KestrelError::not_found(key.clone()));
                }
            }

            for op in ops {
                match op {
                    BatchOp::Put { key, value, .. } => {
                        let versioned = bincode::serialize(&Versioned {
                            rev: new_rev,
                            data: value.clone(),
                        })?;
                        table.insert(key.as_str(), versioned.as_slice())?;
                        pending.push((key, Some(value)));
                    }
                    BatchOp::Delete { key, .. } => {
                        table.remove(key.as_str())?;
                        pending.push((key, None));
                    }
                }
            }
            meta.insert(REV_KEY, new_rev)?;
        }
        txn.commit()?;

        for (key, value) in pending {
            // Nobody listening is fine; watches attach lazily.
            let _ = self.events.send(StoreEvent {
                key,
                value,
                rev: new_rev,
            });
        }
        Ok(new_rev)
    }

    /// List all keys under a prefix with their values and revisions.
    pub fn list_prefix(&self, prefix: &str) -> KestrelResult<Vec<(String, Vec<u8>, u64)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (key_guard, value_guard) = entry?;
            let key = key_guard.value();
            if !key.starts_with(prefix) {
                break;
            }
            let versioned: Versioned = bincode::deserialize(value_guard.value())?;
            out.push((key.to_string(), versioned.data, versioned.rev));
        }
        Ok(out)
    }

    /// Typed prefix listing.
    pub fn list_typed<T: DeserializeOwned>(&self, prefix: &str) -> KestrelResult<Vec<(T, u64)>> {
        self.list_prefix(prefix)?
            .into_iter()
            .map(|(_, data, rev)| Ok((bincode::deserialize(&data)?, rev)))
            .collect()
    }

    /// Watch a prefix from a revision. Entries whose last-modified revision
    /// exceeds `from_rev` are replayed first (in revision order), then live
    /// events stream in. Deletions that happened while detached are not
    /// replayed; restarting watchers should re-list first.
    pub fn watch(&self, prefix: &str, from_rev: u64) -> KestrelResult<Watch> {
        // Subscribe before scanning so no commit between scan and subscribe
        // is lost; duplicates are tolerated because events are idempotent
        // upserts keyed by revision.
        let rx = self.events.subscribe();
        let mut replay: Vec<StoreEvent> = self
            .list_prefix(prefix)?
            .into_iter()
            .filter(|(_, _, rev)| *rev > from_rev)
            .map(|(key, value, rev)| StoreEvent {
                key,
                value: Some(value),
                rev,
            })
            .collect();
        replay.sort_by_key(|e| e.rev);
        Ok(Watch {
            prefix: prefix.to_string(),
            replay: replay.into(),
            last_rev: from_rev,
            rx,
        })
    }
}

/// A restartable, monotone stream of changes under one prefix
pub struct Watch {
    prefix: String,
    replay: VecDeque<StoreEvent>,
    last_rev: u64,
    rx: broadcast::Receiver<StoreEvent>,
}

impl Watch {
    /// Receive the next event. Returns `None` when the store is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        if let Some(event) = self.replay.pop_front() {
            self.last_rev = self.last_rev.max(event.rev);
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if !event.key.starts_with(&self.prefix) || event.rev <= self.last_rev {
                        continue;
                    }
                    self.last_rev = event.rev;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, prefix = %self.prefix, "store watch lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Revision of the last delivered event.
    pub fn last_rev(&self) -> u64 {
        self.last_rev
    }
}

/// Namespaced key builders. All store access goes through these so the key
/// layout stays in one place.
pub mod keys {
    use crate::types::{DiskId, HostId, IpScope, RuleId, SubnetId, VmId};
    use std::net::Ipv4Addr;

    pub const VPC_PREFIX: &str = "/vpc/";
    pub const SUBNET_PREFIX: &str = "/subnet/";
    pub const VM_PREFIX: &str = "/vm/";
    pub const DISK_PREFIX: &str = "/disk/";
    pub const HOST_PREFIX: &str = "/host/";
    pub const IMAGE_PREFIX: &str = "/image/";
    pub const ALLOC_PREFIX: &str = "/alloc/";
    pub const FIP_PREFIX: &str = "/fip/";
    pub const FWRULE_PREFIX: &str = "/fwrule/";
    pub const MIGRATION_PREFIX: &str = "/migration/";

    pub fn vpc(name: &str) -> String {
        format!("{}{}", VPC_PREFIX, name)
    }

    pub fn subnet(id: &SubnetId) -> String {
        format!("{}{}", SUBNET_PREFIX, id)
    }

    pub fn vm(id: &VmId) -> String {
        format!("{}{}", VM_PREFIX, id)
    }

    pub fn disk(id: &DiskId) -> String {
        format!("{}{}", DISK_PREFIX, id)
    }

    pub fn host(id: &HostId) -> String {
        format!("{}{}", HOST_PREFIX, id)
    }

    pub fn image(id: &str) -> String {
        format!("{}{}", IMAGE_PREFIX, id)
    }

    pub fn alloc(scope: &IpScope, addr: &Ipv4Addr) -> String {
        format!("{}{}/{}", ALLOC_PREFIX, scope.key_fragment(), addr)
    }

    pub fn alloc_scope_prefix(scope: &IpScope) -> String {
        format!("{}{}/", ALLOC_PREFIX, scope.key_fragment())
    }

    pub fn fip(addr: &Ipv4Addr) -> String {
        format!("{}{}", FIP_PREFIX, addr)
    }

    pub fn fwrule(vpc: &str, id: &RuleId) -> String {
        format!("{}{}/{}", FWRULE_PREFIX, vpc, id)
    }

    pub fn fwrule_vpc_prefix(vpc: &str) -> String {
        format!("{}{}/", FWRULE_PREFIX, vpc)
    }

    pub fn migration(vm: &VmId) -> String {
        format!("{}{}", MIGRATION_PREFIX, vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip_with_revisions() {
        let (_dir, store) = open_store();
        assert_eq!(store.current_rev().unwrap(), 0);

        let rev1 = store.put("/vm/a", b"one".to_vec(), Expected::Absent).unwrap();
        assert_eq!(rev1, 1);
        let (value, rev) = store.get("/vm/a").unwrap().unwrap();
        assert_eq!(value, b"one");
        assert_eq!(rev, 1);

        let rev2 = store.put("/vm/a", b"two".to_vec(), Expected::Rev(1)).unwrap();
        assert_eq!(rev2, 2);
        assert!(store.get("/vm/missing").unwrap().is_none());
    }

    #[test]
    fn cas_conflicts() {
        let (_dir, store) = open_store();
        store.put("/vm/a", b"one".to_vec(), Expected::Absent).unwrap();

        let err = store
            .put("/vm/a", b"x".to_vec(), Expected::Absent)
            .unwrap_err();
        assert_eq!(err.code(), "conflict");

        let err = store
            .put("/vm/a", b"x".to_vec(), Expected::Rev(99))
            .unwrap_err();
        assert_eq!(err.code(), "conflict");

        let err = store
            .put("/vm/b", b"x".to_vec(), Expected::Rev(1))
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn batch_commits_atomically_or_not_at_all() {
        let (_dir, store) = open_store();
        store.put("/vm/a", b"one".to_vec(), Expected::Absent).unwrap();

        // Second op conflicts; first must not be applied.
        let err = store
            .batch(vec![
                BatchOp::Put {
                    key: "/vm/b".into(),
                    value: b"new".to_vec(),
                    expected: Expected::Absent,
                },
                BatchOp::Put {
                    key: "/vm/a".into(),
                    value: b"clobber".to_vec(),
                    expected: Expected::Rev(42),
                },
            ])
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert!(store.get("/vm/b").unwrap().is_none());
        assert_eq!(store.get("/vm/a").unwrap().unwrap().0, b"one");

        // A clean batch lands everything under one revision.
        let rev = store
            .batch(vec![
                BatchOp::Put {
                    key: "/vm/b".into(),
                    value: b"b".to_vec(),
                    expected: Expected::Absent,
                },
                BatchOp::Delete {
                    key: "/vm/a".into(),
                    expected: Expected::Rev(1),
                },
            ])
            .unwrap();
        assert_eq!(store.get("/vm/b").unwrap().unwrap().1, rev);
        assert!(store.get("/vm/a").unwrap().is_none());
    }

    #[test]
    fn prefix_listing_is_bounded() {
        let (_dir, store) = open_store();
        store.put("/vm/a", b"1".to_vec(), Expected::Any).unwrap();
        store.put("/vm/b", b"2".to_vec(), Expected::Any).unwrap();
        store.put("/vpc/v1", b"3".to_vec(), Expected::Any).unwrap();

        let vms = store.list_prefix("/vm/").unwrap();
        assert_eq!(vms.len(), 2);
        assert!(vms.iter().all(|(k, _, _)| k.starts_with("/vm/")));
    }

    #[tokio::test]
    async fn watch_replays_then_streams() {
        let (_dir, store) = open_store();
        store.put("/vm/a", b"1".to_vec(), Expected::Any).unwrap();
        store.put("/vm/b", b"2".to_vec(), Expected::Any).unwrap();

        let mut watch = store.watch("/vm/", 1).unwrap();
        // Only /vm/b (rev 2) is past from_rev=1.
        let replayed = watch.recv().await.unwrap();
        assert_eq!(replayed.key, "/vm/b");
        assert_eq!(replayed.rev, 2);

        store.put("/vm/c", b"3".to_vec(), Expected::Any).unwrap();
        store.put("/vpc/v", b"x".to_vec(), Expected::Any).unwrap();
        store.delete("/vm/c", Expected::Any).unwrap();

        let live = watch.recv().await.unwrap();
        assert_eq!(live.key, "/vm/c");
        assert!(live.value.is_some());
        let deleted = watch.recv().await.unwrap();
        assert_eq!(deleted.key, "/vm/c");
        assert!(deleted.value.is_none());
        assert!(watch.last_rev() >= 4);
    }
}
