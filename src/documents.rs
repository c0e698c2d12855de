//! Open-document snapshots for the Tarn LSP bridge
//!
//! Each snapshot owns its text and the offset map derived from it. Any change
//! replaces the snapshot wholesale; the map is never patched in place.
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use std::sync::Arc;

use dashmap::DashMap;
use tower_lsp::lsp_types::Url;

use crate::columns::LineColumnOffsetMap;

/// One immutable snapshot of an open document.
#[derive(Debug)]
pub struct Document {
    pub text: String,
    pub version: i32,
    pub offsets: Arc<LineColumnOffsetMap>,
}

/// Document content cache (uri -> snapshot).
#[derive(Default)]
pub struct DocumentStore {
    docs: DashMap<Url, Arc<Document>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh snapshot for `uri`, building its offset map from the
    /// full text. Used for open, change and save alike.
    pub fn update(&self, uri: Url, text: String, version: i32) -> Arc<Document> {
        let offsets = Arc::new(LineColumnOffsetMap::build(&text));
        let doc = Arc::new(Document {
            text,
            version,
            offsets,
        });
        self.docs.insert(uri, doc.clone());
        doc
    }

    pub fn get(&self, uri: &Url) -> Option<Arc<Document>> {
        self.docs.get(uri).map(|entry| entry.clone())
    }

    pub fn text(&self, uri: &Url) -> Option<String> {
        self.docs.get(uri).map(|entry| entry.text.clone())
    }

    pub fn close(&self, uri: &Url) {
        self.docs.remove(uri);
    }
}
