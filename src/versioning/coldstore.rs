//! Cold document store
//!
//! One polymorphic collection holds every `VersionedRecord` as a JSON
//! document, discriminated by `resource_type`. Documents and their
//! secondary-index entries live in a single sled tree under prefixed keys:
//!
//! - `r <id>`: the document itself
//! - `l <resource>`: record id of the chain head
//! - `v <resource> <version>`: record id
//! - `h <resource> <data_hash>`: record id (dedup lookups)
//! - `s <resource> <seq>`: record id (chain ordering)
//! - `m <field> <value> <id>`: sparse index over declared metadata fields
//!
//! Keeping everything in one tree lets a chain transition (rewrite the old
//! head, insert the new head, repoint every index) commit in a single sled
//! transaction, so readers observe either the old chain or the new chain,
//! never a partial flip.
//!
//! Unparseable documents are treated as corruption: logged, optionally
//! moved to the quarantine tree, and reported to callers as absent.

use std::path::Path;

use sled::transaction::TransactionError;

use super::record::{ResourceType, VersionedRecord};
use super::{Result, VersionError};

/// Metadata fields maintained in the sparse metadata index.
pub const INDEXED_FIELDS: [&str; 5] = [
    "corpus_id",
    "corpus_name",
    "parent_corpus_id",
    "vocabulary_hash",
    "__dep",
];

const SEP: u8 = 0;

const PREFIX_RECORD: u8 = b'r';
const PREFIX_LATEST: u8 = b'l';
const PREFIX_VERSION: u8 = b'v';
const PREFIX_HASH: u8 = b'h';
const PREFIX_SEQ: u8 = b's';
const PREFIX_META: u8 = b'm';

/// Persistent polymorphic record collection.
pub struct ColdStore {
    db: sled::Db,
    data: sled::Tree,
    quarantine: sled::Tree,
    quarantine_corrupt: bool,
}

impl ColdStore {
    /// Open (or create) the cold store under `directory`.
    pub fn open(directory: &Path, quarantine_corrupt: bool) -> Result<Self> {
        std::fs::create_dir_all(directory)
            .map_err(|e| VersionError::Persist(format!("create {directory:?}: {e}")))?;
        let db = sled::open(directory)?;
        Ok(Self {
            data: db.open_tree("versioned_data")?,
            quarantine: db.open_tree("quarantine")?,
            quarantine_corrupt,
            db,
        })
    }

    /// Next value of the monotonic insertion sequence.
    pub fn next_seq(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Commit a new chain head.
    ///
    /// `prior` is the outgoing head with `is_latest` already cleared and
    /// `superseded_by` already set by the caller; it is rewritten in the
    /// same transaction that inserts `new`, which is what keeps "at most
    /// one latest per resource" true under crash.
    pub fn commit_new_version(
        &self,
        new: &VersionedRecord,
        prior: Option<&VersionedRecord>,
    ) -> Result<()> {
        let new_bytes = serde_json::to_vec(new)?;
        let prior_pair = match prior {
            Some(p) => Some((record_key(&p.id), serde_json::to_vec(p)?)),
            None => None,
        };

        let mut inserts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        inserts.push((record_key(&new.id), new_bytes));
        if let Some((key, bytes)) = prior_pair {
            inserts.push((key, bytes));
        }
        let id = new.id.as_bytes().to_vec();
        inserts.push((latest_key(new.resource_type, &new.resource_id), id.clone()));
        inserts.push((version_key(new), id.clone()));
        inserts.push((hash_key(new), id.clone()));
        inserts.push((seq_key(new), id.clone()));
        for key in meta_index_keys(new) {
            inserts.push((key, id.clone()));
        }

        let result: sled::transaction::TransactionResult<(), ()> =
            self.data.transaction(|txn| {
                for (key, value) in &inserts {
                    txn.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            });
        map_txn_result(result)
    }

    /// Delete one record and all its index entries. When the record is the
    /// chain head its latest pointer is removed as well.
    pub fn delete_record(&self, record: &VersionedRecord) -> Result<()> {
        let mut removals = vec![
            record_key(&record.id),
            version_key(record),
            hash_key(record),
            seq_key(record),
        ];
        if record.is_latest() {
            removals.push(latest_key(record.resource_type, &record.resource_id));
        }
        removals.extend(meta_index_keys(record));

        let result: sled::transaction::TransactionResult<(), ()> =
            self.data.transaction(|txn| {
                for key in &removals {
                    txn.remove(key.as_slice())?;
                }
                Ok(())
            });
        map_txn_result(result)
    }

    /// Fetch a record by id. Corrupt documents are logged, optionally
    /// quarantined, and reported as absent.
    pub fn get_record(&self, id: &str) -> Result<Option<VersionedRecord>> {
        let key = record_key(id);
        let Some(raw) = self.data.get(&key)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<VersionedRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::error!(record_id = id, error = %e, "corrupt cold-store document");
                if self.quarantine_corrupt {
                    self.quarantine.insert(id.as_bytes(), raw)?;
                    self.data.remove(&key)?;
                }
                Ok(None)
            }
        }
    }

    /// Chain head for a resource, if any.
    pub fn get_latest(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Option<VersionedRecord>> {
        match self.data.get(latest_key(resource_type, resource_id))? {
            Some(id) => self.get_record(&String::from_utf8_lossy(&id)),
            None => Ok(None),
        }
    }

    /// Specific version of a resource.
    pub fn get_by_version(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        version: &str,
    ) -> Result<Option<VersionedRecord>> {
        let mut key = indexed_key(PREFIX_VERSION, resource_type, resource_id);
        key.extend_from_slice(version.as_bytes());
        match self.data.get(&key)? {
            Some(id) => self.get_record(&String::from_utf8_lossy(&id)),
            None => Ok(None),
        }
    }

    /// Record carrying a given content hash, if one exists for the resource.
    pub fn get_by_hash(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        data_hash: &str,
    ) -> Result<Option<VersionedRecord>> {
        let mut key = indexed_key(PREFIX_HASH, resource_type, resource_id);
        key.extend_from_slice(data_hash.as_bytes());
        match self.data.get(&key)? {
            Some(id) => self.get_record(&String::from_utf8_lossy(&id)),
            None => Ok(None),
        }
    }

    /// Every surviving version of a resource, newest first.
    pub fn list_versions(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Vec<VersionedRecord>> {
        let prefix = indexed_key(PREFIX_SEQ, resource_type, resource_id);
        let mut out = Vec::new();
        for item in self.data.scan_prefix(&prefix) {
            let (_, id) = item?;
            if let Some(record) = self.get_record(&String::from_utf8_lossy(&id))? {
                out.push(record);
            }
        }
        out.reverse();
        Ok(out)
    }

    /// Records whose indexed metadata field equals `value`.
    pub fn find_by_metadata(&self, field: &str, value: &str) -> Result<Vec<VersionedRecord>> {
        let mut prefix = vec![PREFIX_META, SEP];
        prefix.extend_from_slice(field.as_bytes());
        prefix.push(SEP);
        prefix.extend_from_slice(value.as_bytes());
        prefix.push(SEP);

        let mut out = Vec::new();
        for item in self.data.scan_prefix(&prefix) {
            let (_, id) = item?;
            if let Some(record) = self.get_record(&String::from_utf8_lossy(&id))? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Total number of stored documents.
    pub fn record_count(&self) -> u64 {
        self.data
            .scan_prefix([PREFIX_RECORD, SEP])
            .filter(|item| item.is_ok())
            .count() as u64
    }

    /// Number of quarantined documents.
    pub fn quarantine_count(&self) -> u64 {
        self.quarantine.len() as u64
    }

    /// Flush dirty buffers to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn insert_raw_record(&self, id: &str, bytes: &[u8]) {
        self.data.insert(record_key(id), bytes).unwrap();
    }
}

fn record_key(id: &str) -> Vec<u8> {
    let mut key = vec![PREFIX_RECORD, SEP];
    key.extend_from_slice(id.as_bytes());
    key
}

fn latest_key(resource_type: ResourceType, resource_id: &str) -> Vec<u8> {
    let mut key = vec![PREFIX_LATEST, SEP];
    key.extend_from_slice(resource_type.label().as_bytes());
    key.push(SEP);
    key.extend_from_slice(resource_id.as_bytes());
    key
}

/// `prefix \0 type \0 resource_id \0`, ready for a final component.
fn indexed_key(prefix: u8, resource_type: ResourceType, resource_id: &str) -> Vec<u8> {
    let mut key = vec![prefix, SEP];
    key.extend_from_slice(resource_type.label().as_bytes());
    key.push(SEP);
    key.extend_from_slice(resource_id.as_bytes());
    key.push(SEP);
    key
}

fn version_key(record: &VersionedRecord) -> Vec<u8> {
    let mut key = indexed_key(PREFIX_VERSION, record.resource_type, &record.resource_id);
    key.extend_from_slice(record.version().as_bytes());
    key
}

fn hash_key(record: &VersionedRecord) -> Vec<u8> {
    let mut key = indexed_key(PREFIX_HASH, record.resource_type, &record.resource_id);
    key.extend_from_slice(record.data_hash().as_bytes());
    key
}

fn seq_key(record: &VersionedRecord) -> Vec<u8> {
    let mut key = indexed_key(PREFIX_SEQ, record.resource_type, &record.resource_id);
    key.extend_from_slice(&record.seq.to_be_bytes());
    key
}

/// Index keys for the declared metadata fields plus reverse dependency
/// edges (`__dep` → dependent record), which retention and cascade deletion
/// use to find records that must not be orphaned.
fn meta_index_keys(record: &VersionedRecord) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    for field in INDEXED_FIELDS {
        if field == "__dep" {
            continue;
        }
        if let Some(value) = record.metadata.get(field) {
            if let Some(text) = metadata_value_text(value) {
                keys.push(meta_key(field, &text, &record.id));
            }
        }
    }
    for dep in &record.version_info.dependencies {
        keys.push(meta_key("__dep", dep, &record.id));
    }
    keys
}

fn meta_key(field: &str, value: &str, record_id: &str) -> Vec<u8> {
    let mut key = vec![PREFIX_META, SEP];
    key.extend_from_slice(field.as_bytes());
    key.push(SEP);
    key.extend_from_slice(value.as_bytes());
    key.push(SEP);
    key.extend_from_slice(record_id.as_bytes());
    key
}

fn metadata_value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn map_txn_result(result: sled::transaction::TransactionResult<(), ()>) -> Result<()> {
    result.map_err(|e| match e {
        TransactionError::Abort(()) => VersionError::Persist("transaction aborted".to_string()),
        TransactionError::Storage(e) => VersionError::Backend(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Namespace;
    use crate::versioning::record::VersionInfo;
    use chrono::Utc;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    fn record(id: &str, resource_id: &str, seq: u64, version: &str, hash: &str) -> VersionedRecord {
        VersionedRecord {
            id: id.to_string(),
            seq,
            resource_id: resource_id.to_string(),
            resource_type: ResourceType::Generic,
            namespace: Namespace::Default,
            version_info: VersionInfo {
                version: version.to_string(),
                created_at: Utc::now(),
                data_hash: hash.to_string(),
                is_latest: true,
                supersedes: None,
                superseded_by: None,
                dependencies: vec![],
            },
            content_inline: Some(json!({"v": version})),
            content_location: None,
            metadata: Map::new(),
            tags: vec![],
            ttl: None,
        }
    }

    fn store() -> (TempDir, ColdStore) {
        let dir = TempDir::new().unwrap();
        let store = ColdStore::open(dir.path(), true).unwrap();
        (dir, store)
    }

    #[test]
    fn test_commit_and_lookups() {
        let (_dir, store) = store();
        let r = record("r1", "res", 1, "1.0.0", "h1");
        store.commit_new_version(&r, None).unwrap();

        assert_eq!(
            store
                .get_latest(ResourceType::Generic, "res")
                .unwrap()
                .unwrap()
                .id,
            "r1"
        );
        assert!(store
            .get_by_version(ResourceType::Generic, "res", "1.0.0")
            .unwrap()
            .is_some());
        assert!(store
            .get_by_hash(ResourceType::Generic, "res", "h1")
            .unwrap()
            .is_some());
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_chain_flip_updates_both_records() {
        let (_dir, store) = store();
        let r1 = record("r1", "res", 1, "1.0.0", "h1");
        store.commit_new_version(&r1, None).unwrap();

        let mut prior = store.get_latest(ResourceType::Generic, "res").unwrap().unwrap();
        prior.version_info.is_latest = false;
        prior.version_info.superseded_by = Some("r2".to_string());

        let mut r2 = record("r2", "res", 2, "1.0.1", "h2");
        r2.version_info.supersedes = Some("r1".to_string());
        store.commit_new_version(&r2, Some(&prior)).unwrap();

        let latest = store.get_latest(ResourceType::Generic, "res").unwrap().unwrap();
        assert_eq!(latest.id, "r2");

        let versions = store.list_versions(ResourceType::Generic, "res").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].id, "r2"); // newest first
        assert!(!versions[1].is_latest());
        assert_eq!(versions[1].version_info.superseded_by.as_deref(), Some("r2"));
    }

    #[test]
    fn test_metadata_index() {
        let (_dir, store) = store();
        let mut r = record("r1", "res", 1, "1.0.0", "h1");
        r.metadata
            .insert("corpus_name".into(), json!("english-master"));
        store.commit_new_version(&r, None).unwrap();

        let hits = store.find_by_metadata("corpus_name", "english-master").unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.find_by_metadata("corpus_name", "other").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_indexes() {
        let (_dir, store) = store();
        let r = record("r1", "res", 1, "1.0.0", "h1");
        store.commit_new_version(&r, None).unwrap();
        store.delete_record(&r).unwrap();

        assert!(store.get_latest(ResourceType::Generic, "res").unwrap().is_none());
        assert!(store
            .get_by_hash(ResourceType::Generic, "res", "h1")
            .unwrap()
            .is_none());
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_corrupt_document_is_quarantined() {
        let (_dir, store) = store();
        store.insert_raw_record("bad", b"{not json");

        assert!(store.get_record("bad").unwrap().is_none());
        assert_eq!(store.quarantine_count(), 1);
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_reverse_dependency_index() {
        let (_dir, store) = store();
        let mut r = record("r2", "res-b", 2, "1.0.0", "h2");
        r.version_info.dependencies = vec!["r1".to_string()];
        store.commit_new_version(&r, None).unwrap();

        let dependents = store.find_by_metadata("__dep", "r1").unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, "r2");
    }

    #[test]
    fn test_resources_with_shared_prefixes_stay_disjoint() {
        let (_dir, store) = store();
        store
            .commit_new_version(&record("a1", "corpus:en", 1, "1.0.0", "h1"), None)
            .unwrap();
        store
            .commit_new_version(&record("a2", "corpus:en-gb", 2, "1.0.0", "h2"), None)
            .unwrap();

        let versions = store.list_versions(ResourceType::Generic, "corpus:en").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id, "a1");
    }
}
