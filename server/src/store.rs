use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::core::levels::ResolutionLevel;

/// The slice of a panorama document produced by the tiling pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanoramaRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub cubemap_levels: Vec<ResolutionLevel>,
}

/// Document store contract the upload surface persists into.
pub trait DocumentStore: Send + Sync {
    fn save(&self, record: PanoramaRecord) -> PanoramaRecord;
    fn list(&self) -> Vec<PanoramaRecord>;
    fn remove(&self, id: &str) -> Option<PanoramaRecord>;
}

/// Process-local store, keyed by panorama id.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, PanoramaRecord>>,
}

impl DocumentStore for MemoryStore {
    fn save(&self, record: PanoramaRecord) -> PanoramaRecord {
        self.records
            .write()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        record
    }

    /// Sorted by name, case-insensitively, like the viewer's panorama list.
    fn list(&self) -> Vec<PanoramaRecord> {
        let mut all: Vec<PanoramaRecord> = self.records.read().unwrap().values().cloned().collect();
        all.sort_by_key(|r| r.name.to_lowercase());
        all
    }

    fn remove(&self, id: &str) -> Option<PanoramaRecord> {
        self.records.write().unwrap().remove(id)
    }
}
