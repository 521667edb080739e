use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::coordinate::{Address, Coordinate, Record};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("duplicate address conflict: {address} already stores different content")]
    DuplicateAddressConflict { address: Address },
    #[error("record integrity violation: {0}")]
    Integrity(String),
    #[error("record store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Inserted,
    AlreadyPresent,
}

/// Content-addressed record storage. Implementations are shared across threads.
pub trait RecordStore: Send + Sync {
    /// # Errors
    /// Returns `StoreError` when the backend cannot be read.
    fn get(&self, address: &Address) -> Result<Option<Record>, StoreError>;

    /// Stores `record` under its address. Re-putting identical content is a no-op.
    ///
    /// # Errors
    /// Returns `StoreError::Integrity` when the address does not match the content and
    /// `StoreError::DuplicateAddressConflict` when different content already owns it.
    fn put(&self, record: &Record) -> Result<PutOutcome, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<Address, Record>>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `StoreError::Backend` when the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|_| StoreError::Backend("record store lock poisoned".to_string()))?
            .len())
    }

    /// # Errors
    /// Returns `StoreError::Backend` when the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, address: &Address) -> Result<Option<Record>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|_| StoreError::Backend("record store lock poisoned".to_string()))?
            .get(address)
            .cloned())
    }

    fn put(&self, record: &Record) -> Result<PutOutcome, StoreError> {
        record
            .verify_address()
            .map_err(|err| StoreError::Integrity(err.to_string()))?;
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::Backend("record store lock poisoned".to_string()))?;
        if let Some(existing) = records.get(&record.address) {
            if existing.same_content(record) {
                return Ok(PutOutcome::AlreadyPresent);
            }
            return Err(StoreError::DuplicateAddressConflict {
                address: record.address.clone(),
            });
        }
        records.insert(record.address.clone(), record.clone());
        Ok(PutOutcome::Inserted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AdjacencyStatus {
    Resolved,
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdjacencyLink {
    pub address: Address,
    pub status: AdjacencyStatus,
}

/// Looks up every adjacency entry. Dangling references are reported, not rejected.
///
/// # Errors
/// Returns `StoreError` when the store cannot be read.
pub fn resolve_adjacency(
    coordinate: &Coordinate,
    store: &dyn RecordStore,
) -> Result<Vec<AdjacencyLink>, StoreError> {
    coordinate
        .adjacency
        .iter()
        .map(|address| {
            let status = if store.get(address)?.is_some() {
                AdjacencyStatus::Resolved
            } else {
                AdjacencyStatus::Unresolved
            };
            Ok(AdjacencyLink {
                address: address.clone(),
                status,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::coordinate::{Classification, Payload, Realm};

    fn record(payload: &str) -> Record {
        match Record::new(
            Coordinate::genesis(Realm::Data, 0.5, 3),
            Payload::from(payload),
            Classification::Public,
        ) {
            Ok(record) => record,
            Err(err) => panic!("fixture record failed: {err}"),
        }
    }

    // Test IDs: TSTO-001
    #[test]
    fn put_is_idempotent_for_identical_content() -> Result<(), StoreError> {
        let store = MemoryRecordStore::new();
        let hello = record("hello");
        assert_eq!(store.put(&hello)?, PutOutcome::Inserted);
        assert_eq!(store.put(&hello)?, PutOutcome::AlreadyPresent);
        assert_eq!(store.get(&hello.address)?, Some(hello));
        assert_eq!(store.len()?, 1);
        Ok(())
    }

    // Test IDs: TSTO-002
    #[test]
    fn put_rejects_tampered_and_conflicting_records() -> Result<(), StoreError> {
        let store = MemoryRecordStore::new();
        let original = record("hello");
        store.put(&original)?;

        let mut tampered = original.clone();
        tampered.payload = Payload::from("goodbye");
        assert!(matches!(store.put(&tampered), Err(StoreError::Integrity(_))));

        let mut reclassified = original.clone();
        reclassified.classification = Classification::Pii;
        assert_eq!(
            store.put(&reclassified),
            Err(StoreError::DuplicateAddressConflict {
                address: original.address.clone()
            })
        );
        Ok(())
    }

    // Test IDs: TSTO-003
    #[test]
    fn concurrent_identical_puts_store_one_record() -> Result<(), StoreError> {
        let store = Arc::new(MemoryRecordStore::new());
        let hello = record("hello");
        let handles = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let hello = hello.clone();
                thread::spawn(move || store.put(&hello))
            })
            .collect::<Vec<_>>();

        let mut inserted = 0;
        for handle in handles {
            match handle.join() {
                Ok(Ok(PutOutcome::Inserted)) => inserted += 1,
                Ok(Ok(PutOutcome::AlreadyPresent)) => {}
                Ok(Err(err)) => panic!("put failed: {err}"),
                Err(_) => panic!("put thread panicked"),
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.len()?, 1);
        Ok(())
    }

    // Test IDs: TSTO-004
    #[test]
    fn adjacency_resolution_reports_dangling_links() -> Result<(), StoreError> {
        let store = MemoryRecordStore::new();
        let present = record("present");
        store.put(&present)?;
        let missing = record("missing").address;

        let coordinate = Coordinate::genesis(Realm::Data, 0.5, 3)
            .with_adjacency([present.address.clone(), missing.clone()]);
        let links = resolve_adjacency(&coordinate, &store)?;
        assert_eq!(links.len(), 2);
        for link in links {
            let expected = if link.address == present.address {
                AdjacencyStatus::Resolved
            } else {
                AdjacencyStatus::Unresolved
            };
            assert_eq!(link.status, expected, "link {}", link.address);
        }
        Ok(())
    }
}
