//! In-memory trait data published by this node.

use std::cell::RefCell;
use std::collections::HashMap;

use wdm_core::TraitDataSource;
use wdm_types::{DataElement, SchemaVersionRange, TraitInstance};

#[derive(Debug, Clone)]
struct Entry {
    versions: SchemaVersionRange,
    data_version: u64,
    payload: Vec<u8>,
}

/// Published trait instances and their current data.
///
/// Every update bumps the instance's data version, which is what
/// subscriptions compare against to decide whether it is dirty.
#[derive(Debug, Default)]
pub struct TraitCatalog {
    entries: RefCell<HashMap<TraitInstance, Entry>>,
}

impl TraitCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `instance`, encodable at `versions`, with initial data.
    pub fn register(&self, instance: TraitInstance, versions: SchemaVersionRange, payload: Vec<u8>) {
        self.entries.borrow_mut().insert(
            instance,
            Entry {
                versions,
                data_version: 1,
                payload,
            },
        );
    }

    /// Replace the data of `instance`. Returns the new data version, or
    /// `None` if the instance is not published.
    pub fn update(&self, instance: &TraitInstance, payload: Vec<u8>) -> Option<u64> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(instance)?;
        entry.data_version += 1;
        entry.payload = payload;
        Some(entry.data_version)
    }

    /// Number of published instances.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Check if nothing is published.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl TraitDataSource for TraitCatalog {
    fn supported_versions(&self, instance: &TraitInstance) -> Option<SchemaVersionRange> {
        self.entries.borrow().get(instance).map(|e| e.versions)
    }

    fn data_version(&self, instance: &TraitInstance) -> Option<u64> {
        self.entries.borrow().get(instance).map(|e| e.data_version)
    }

    fn snapshot(&self, instance: &TraitInstance, schema_version: u16) -> Option<DataElement> {
        let entries = self.entries.borrow();
        let entry = entries.get(instance)?;
        entry.versions.contains(schema_version).then(|| DataElement {
            instance: *instance,
            version: entry.data_version,
            schema_version,
            payload: entry.payload.clone(),
        })
    }
}
