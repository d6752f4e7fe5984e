//! In-memory catalog backed by roaring-bitmap posting lists
//!
//! Every tracked item gets a u32 slot; each keyword maps to a bitmap of
//! slots. Lookup intersects the query keywords' bitmaps. Freed slots go
//! into a free-id bitmap and are reused lowest-first.

use std::collections::HashMap;

use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::search::{Catalog, IndexPath, SearchHit};

fn slot_key(path: &IndexPath) -> String {
    format!("{}/{}/{}", path.domain, path.group, path.title)
}

#[derive(Default)]
struct Inner {
    /// `domain/group/title` -> slot
    ids: HashMap<String, u32>,
    /// keyword -> slots carrying it
    postings: HashMap<String, RoaringBitmap>,
    /// reusable slots
    free: RoaringBitmap,
    /// slot -> keyword set
    keys: Vec<Vec<String>>,
    /// slot -> item path
    paths: Vec<IndexPath>,
    /// slot -> stored metadata
    docs: Vec<Vec<u8>>,
}

impl Inner {
    /// Detach a slot from its postings and clear its entry.
    fn clear_slot(&mut self, slot: u32) {
        let idx = slot as usize;
        if idx >= self.keys.len() {
            return;
        }
        for keyword in &self.keys[idx] {
            if let Some(bitmap) = self.postings.get_mut(keyword) {
                bitmap.remove(slot);
            }
        }
        self.keys[idx].clear();
        self.paths[idx] = IndexPath::default();
        self.docs[idx].clear();
    }

    /// Claim a slot: reuse the lowest free one or grow the tables.
    fn claim_slot(&mut self) -> u32 {
        if let Some(slot) = self.free.min() {
            self.free.remove(slot);
            return slot;
        }
        let slot = self.keys.len() as u32;
        self.keys.push(Vec::new());
        self.paths.push(IndexPath::default());
        self.docs.push(Vec::new());
        slot
    }

    fn fill_slot(&mut self, slot: u32, path: IndexPath, keys: Vec<String>, doc: &[u8]) {
        let idx = slot as usize;
        self.keys[idx] = keys;
        self.paths[idx] = path;
        self.docs[idx] = doc.to_vec();
        for keyword in self.keys[idx].clone() {
            self.postings.entry(keyword).or_default().insert(slot);
        }
    }
}

/// Thread-safe in-memory catalog.
#[derive(Default)]
pub struct MemCatalog {
    inner: RwLock<Inner>,
}

impl MemCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked items.
    pub fn len(&self) -> usize {
        self.inner.read().ids.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().ids.is_empty()
    }
}

impl Catalog for MemCatalog {
    fn put_track(&self, path: IndexPath, keys: Vec<String>, doc: &[u8]) {
        let key = slot_key(&path);
        let mut inner = self.inner.write();

        let slot = match inner.ids.get(&key) {
            Some(&slot) => {
                inner.clear_slot(slot);
                slot
            }
            None => {
                let slot = inner.claim_slot();
                inner.ids.insert(key, slot);
                slot
            }
        };
        inner.fill_slot(slot, path, keys, doc);
    }

    fn del_track(&self, path: &IndexPath) {
        let key = slot_key(path);
        let mut inner = self.inner.write();
        if let Some(slot) = inner.ids.remove(&key) {
            inner.clear_slot(slot);
            inner.free.insert(slot);
        }
    }

    fn del_all(&self, domain: &str) {
        let prefix = format!("{}/", domain);
        let mut inner = self.inner.write();
        let doomed: Vec<(String, u32)> = inner
            .ids
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, &slot)| (key.clone(), slot))
            .collect();
        for (key, slot) in doomed {
            inner.clear_slot(slot);
            inner.ids.remove(&key);
            inner.free.insert(slot);
        }
    }

    fn lookup(&self, keys: &[String], max: usize) -> Vec<SearchHit> {
        let inner = self.inner.read();

        let mut bitmaps = Vec::with_capacity(keys.len());
        for key in keys {
            // A keyword nobody carries empties the intersection.
            let Some(bitmap) = inner.postings.get(key) else {
                return Vec::new();
            };
            bitmaps.push(bitmap);
        }
        let Some((first, rest)) = bitmaps.split_first() else {
            return Vec::new();
        };
        let mut matches = (*first).clone();
        for bitmap in rest {
            matches &= *bitmap;
        }

        let limit = inner.paths.len() as u32;
        let mut hits = Vec::new();
        for slot in matches.iter() {
            if slot >= limit {
                continue;
            }
            hits.push(SearchHit {
                path: inner.paths[slot as usize].clone(),
                meta: inner.docs[slot as usize].clone(),
            });
            if hits.len() >= max {
                break;
            }
        }
        hits
    }
}
