//! # gk-store-memory
//!
//! In-process implementation of `DocumentStore`, backed by `DashMap`.
//! Used when no database is configured and as the store double in tests.
//! Filters run against the serde JSON form of each document, so they behave the
//! same way they do against the JSONB column of the Postgres plugin.

use async_trait::async_trait;
use dashmap::DashMap;
use gk_core::error::StoreError;
use gk_core::filter::{lookup, Document, Filter, Sort};
use gk_core::traits::DocumentStore;
use serde_json::Value;
use std::sync::Mutex;

pub struct MemoryStore<D: Document> {
    docs: DashMap<String, D>,
    /// Serializes writes so the unique-field check and the insert are one step.
    writes: Mutex<()>,
}

impl<D: Document> Default for MemoryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Document> MemoryStore<D> {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            writes: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn encode(doc: &D) -> Result<Value, StoreError> {
        serde_json::to_value(doc).map_err(|e| StoreError::Corrupt {
            collection: D::COLLECTION,
            message: e.to_string(),
        })
    }

    /// Another document already holding one of `doc`'s unique field values.
    fn unique_conflict(&self, key: &str, doc: &Value) -> Result<Option<String>, StoreError> {
        for field in D::UNIQUE_FIELDS {
            let Some(wanted) = lookup(doc, field).filter(|v| !v.is_null()) else {
                continue;
            };
            for entry in self.docs.iter() {
                if entry.key() == key {
                    continue;
                }
                let other = Self::encode(entry.value())?;
                if lookup(&other, field) == Some(wanted) {
                    return Ok(Some(format!("{field}={wanted}")));
                }
            }
        }
        Ok(None)
    }

    fn matching(&self, filter: &Filter) -> Result<Vec<(Value, D)>, StoreError> {
        let mut hits = Vec::new();
        for entry in self.docs.iter() {
            let value = Self::encode(entry.value())?;
            if filter.matches(&value) {
                hits.push((value, entry.value().clone()));
            }
        }
        Ok(hits)
    }

    fn write_gate(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for MemoryStore<D> {
    async fn upsert(&self, doc: &D) -> Result<(), StoreError> {
        let _gate = self.write_gate();
        let key = doc.key();
        if let Some(taken) = self.unique_conflict(&key, &Self::encode(doc)?)? {
            return Err(StoreError::DuplicateKey {
                collection: D::COLLECTION,
                key: taken,
            });
        }
        self.docs.insert(key, doc.clone());
        Ok(())
    }

    async fn insert_new(&self, doc: &D) -> Result<(), StoreError> {
        let _gate = self.write_gate();
        let key = doc.key();
        if self.docs.contains_key(&key) {
            tracing::debug!(collection = D::COLLECTION, %key, "insert rejected, key exists");
            return Err(StoreError::DuplicateKey {
                collection: D::COLLECTION,
                key,
            });
        }
        if let Some(taken) = self.unique_conflict(&key, &Self::encode(doc)?)? {
            return Err(StoreError::DuplicateKey {
                collection: D::COLLECTION,
                key: taken,
            });
        }
        self.docs.insert(key, doc.clone());
        Ok(())
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<D>, StoreError> {
        Ok(self.matching(filter)?.into_iter().next().map(|(_, doc)| doc))
    }

    async fn find_many(
        &self,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<D>, StoreError> {
        let mut hits = self.matching(filter)?;
        if let Some(sort) = sort {
            hits.sort_by(|(a, _), (b, _)| sort.compare(a, b));
        }
        Ok(hits
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, doc)| doc)
            .collect())
    }

    async fn delete_one(&self, filter: &Filter) -> Result<Option<D>, StoreError> {
        let _gate = self.write_gate();
        let Some((_, doc)) = self.matching(filter)?.into_iter().next() else {
            return Ok(None);
        };
        Ok(self.docs.remove(&doc.key()).map(|(_, removed)| removed))
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError> {
        let _gate = self.write_gate();
        let mut removed = 0;
        for (_, doc) in self.matching(filter)? {
            if self.docs.remove(&doc.key()).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
