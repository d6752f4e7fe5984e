//! Fulltext search over shared-file metadata
//!
//! Metadata documents are flattened into prefixed keyword sets: each
//! field's text is canonicalized, split into words, and every word is
//! tagged with its field name so `a:nirvana` and `t:nirvana` stay
//! distinct. The same flattening is applied to query terms, and a hit
//! is a tracked item whose keyword set contains every query keyword.
//!
//! [`SearchIndex`] adapts a [`Catalog`] to the index server's query
//! capability; [`MemCatalog`] is the in-memory realization.

pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;

use crate::index::{Queries, SessionToken, Status};
use crate::network::document::{Doc, DocBuilder};

pub use memory::MemCatalog;

/// Address of a tracked item: `(domain, group, title)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IndexPath {
    /// Owning share namespace
    pub domain: String,
    /// Group within the share (the published `_` field)
    pub group: String,
    /// Item title (the published `f` field)
    pub title: String,
}

impl IndexPath {
    /// Build a path from its three components.
    pub fn new(
        domain: impl Into<String>,
        group: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            group: group.into(),
            title: title.into(),
        }
    }

    /// Minimal metadata document for an item with no stored metadata.
    pub fn fallback_meta(&self) -> Vec<u8> {
        DocBuilder::new()
            .append_string("", &self.group)
            .append_string("f", &self.title)
            .build()
    }
}

/// One search result: the item's path and its stored metadata.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Where the item lives
    pub path: IndexPath,
    /// Stored metadata document bytes
    pub meta: Vec<u8>,
}

impl SearchHit {
    /// The metadata document, or the path's fallback when the stored
    /// bytes are not a well-framed document.
    pub fn meta_doc(&self) -> Vec<u8> {
        if Doc::new(&self.meta).is_well_framed() {
            self.meta.clone()
        } else {
            self.path.fallback_meta()
        }
    }
}

/// Storage capability under the search index.
pub trait Catalog: Send + Sync {
    /// Track an item under a keyword set, replacing any previous entry.
    fn put_track(&self, path: IndexPath, keys: Vec<String>, doc: &[u8]);

    /// Stop tracking an item.
    fn del_track(&self, path: &IndexPath);

    /// Stop tracking everything owned by a domain.
    fn del_all(&self, domain: &str);

    /// Items whose keyword sets contain every given key, capped at `max`.
    fn lookup(&self, keys: &[String], max: usize) -> Vec<SearchHit>;
}

fn canonicalize(c: char) -> char {
    match c {
        '\'' | '`' | '\u{b4}' => '_',
        '_' => ' ',
        _ => c.to_lowercase().next().unwrap_or(c),
    }
}

/// Split a field's text into canonical words.
fn split_up(s: &str) -> Vec<String> {
    let canonical: String = s.chars().map(canonicalize).collect();
    canonical
        .split(|c: char| !(c == '_' || c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tag every word with its field name.
fn prepend(words: &mut [String], prefix: &str) {
    for word in words {
        *word = format!("{}{}", prefix, word);
    }
}

/// Order-preserving dedup.
fn unify(words: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    words.into_iter().filter(|w| seen.insert(w.clone())).collect()
}

/// Flatten a metadata or terms document's string fields into prefixed
/// keywords, starting at element `skip`.
fn keywords_from(doc: Doc<'_>, skip: usize) -> Vec<String> {
    let mut keywords = Vec::new();
    let Ok(elems) = doc.elements() else {
        return keywords;
    };
    for elem in elems.into_iter().skip(skip) {
        let Some(text) = elem.value().as_str() else { continue };
        let key = String::from_utf8_lossy(elem.key_bytes()).into_owned();
        let mut words = split_up(text);
        prepend(&mut words, &key);
        keywords.extend(words);
    }
    keywords
}

/// Adapts a [`Catalog`] to the index server's query capability.
pub struct SearchIndex {
    catalog: Arc<dyn Catalog>,
}

impl SearchIndex {
    /// Create an index over a catalog.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Path and keyword set for a published document, if it has the two
    /// leading path elements.
    fn track_path(token: &dyn SessionToken, doc: Doc<'_>) -> Option<(IndexPath, Vec<String>)> {
        let elems = doc.elements().ok()?;
        if elems.len() < 2 {
            return None;
        }
        let path = IndexPath::new(
            token.domain(),
            elems[0].value().as_str().unwrap_or_default(),
            elems[1].value().as_str().unwrap_or_default(),
        );

        let mut keywords = split_up(&path.title);
        prepend(&mut keywords, "f");
        keywords.extend(keywords_from(doc, 2));
        Some((path, unify(keywords)))
    }
}

impl Queries for SearchIndex {
    fn retract_all(&self, token: &dyn SessionToken) {
        if token.status() != Status::Accepted {
            return;
        }
        self.catalog.del_all(token.domain());
    }

    fn publish(&self, token: &dyn SessionToken, doc: Doc<'_>) {
        if token.status() != Status::Accepted {
            return;
        }
        if let Some((path, keywords)) = Self::track_path(token, doc) {
            self.catalog.put_track(path, keywords, doc.as_bytes());
        }
    }

    fn retract(&self, token: &dyn SessionToken, doc: Doc<'_>) {
        if token.status() != Status::Accepted {
            return;
        }
        let Ok(elems) = doc.elements() else { return };
        if elems.len() < 2 {
            return;
        }
        let path = IndexPath::new(
            token.domain(),
            elems[0].value().as_str().unwrap_or_default(),
            elems[1].value().as_str().unwrap_or_default(),
        );
        self.catalog.del_track(&path);
    }

    fn query(&self, _token: &dyn SessionToken, terms: Doc<'_>, max: usize) -> Vec<u8> {
        let keywords = unify(keywords_from(terms, 0));
        let mut builder = DocBuilder::new();
        for hit in self.catalog.lookup(&keywords, max) {
            builder = builder.append_document(&hit.path.domain, &hit.meta_doc());
        }
        builder.build()
    }
}
