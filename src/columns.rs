//! Column translation between LSP and Tarn source positions
//!
//! LSP addresses columns in UTF-16 code units; the Tarn runtime addresses them
//! in Unicode codepoints. The two only diverge on lines containing characters
//! outside the Basic Multilingual Plane (surrogate pairs in UTF-16), so the
//! map stores markers for those lines alone and is the identity everywhere
//! else.
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use std::sync::Arc;

use dashmap::DashMap;
use tower_lsp::lsp_types::Url;

/// Most lines carry no or very few wide characters; below this marker count a
/// linear scan beats a binary search.
const LINEAR_SEARCH_LIMIT: usize = 8;

/// Per-document-snapshot map of wide-character columns.
///
/// Immutable once built. Any edit to the document discards the map and builds
/// a fresh one from the full text; it is never patched incrementally.
#[derive(Debug, Default)]
pub struct LineColumnOffsetMap {
    /// 0-based lines containing at least one wide character, ascending.
    lines: Vec<u32>,
    /// Parallel to `lines`: the codepoint columns of the wide characters on
    /// that line, ascending and unique.
    wide_columns: Vec<Vec<u32>>,
}

impl LineColumnOffsetMap {
    /// Scan `text` once and record where wide characters occur.
    ///
    /// Line breaks are `\n`, `\r` or `\r\n`, each counting as exactly one
    /// break. A document without wide characters produces an identity map
    /// with no per-line allocation.
    pub fn build(text: &str) -> Self {
        let mut lines = Vec::new();
        let mut wide_columns = Vec::new();
        let mut current: Vec<u32> = Vec::new();
        let mut line: u32 = 0;
        let mut column: u32 = 0;

        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\r' || c == '\n' {
                // a \r\n pair is one break, not two
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                if !current.is_empty() {
                    lines.push(line);
                    wide_columns.push(std::mem::take(&mut current));
                }
                line += 1;
                column = 0;
            } else {
                if c.len_utf16() == 2 {
                    current.push(column);
                }
                column += 1;
            }
        }
        if !current.is_empty() {
            lines.push(line);
            wide_columns.push(current);
        }

        Self { lines, wide_columns }
    }

    /// Translate a codepoint column to a UTF-16 column on a 0-based `line`.
    ///
    /// Every wide character left of the column contributes one extra code
    /// unit. An end boundary sitting exactly on a wide character covers both
    /// of its code units, so it contributes two; a begin boundary on the same
    /// spot stays in front of the character.
    pub fn translate_column(&self, line: u32, column: u32, at_end: bool) -> u32 {
        let Some(markers) = self.markers(line) else {
            return column;
        };
        match search(markers, column) {
            Ok(i) if at_end => column + i as u32 + 2,
            Ok(i) | Err(i) => column + i as u32,
        }
    }

    /// Translate a UTF-16 column back to a codepoint column on a 0-based
    /// `line`: the smallest codepoint column whose translation reaches
    /// `column`.
    ///
    /// For every UTF-16 column reachable on the line,
    /// `translate_column(reverse_column(c)) == c`. Columns nothing maps to
    /// (inside a surrogate pair) snap to the next codepoint boundary.
    pub fn reverse_column(&self, line: u32, column: u32, at_end: bool) -> u32 {
        let Some(markers) = self.markers(line) else {
            return column;
        };
        // translation is monotone, so binary-search the codepoint column
        let mut lo = column.saturating_sub(2 * markers.len() as u32);
        let mut hi = column;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.translate_column(line, mid, at_end) < column {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn markers(&self, line: u32) -> Option<&[u32]> {
        let idx = self.lines.binary_search(&line).ok()?;
        Some(&self.wide_columns[idx])
    }
}

/// Search sorted unique `markers` for `column`. `Ok` is an exact hit, `Err`
/// the insertion point; either index equals the number of markers strictly
/// below `column`.
fn search(markers: &[u32], column: u32) -> Result<usize, usize> {
    if markers.len() <= LINEAR_SEARCH_LIMIT {
        for (i, &m) in markers.iter().enumerate() {
            if m >= column {
                return if m == column { Ok(i) } else { Err(i) };
            }
        }
        Err(markers.len())
    } else {
        markers.binary_search(&column)
    }
}

/// Per-URI cache of offset maps over a text lookup.
///
/// Runtime results may reference files other than the one that triggered the
/// request; their maps are built on demand and dropped wholesale whenever the
/// document changes.
pub struct ColumnMaps {
    cache: DashMap<Url, Arc<LineColumnOffsetMap>>,
    lookup: Box<dyn Fn(&Url) -> Option<String> + Send + Sync>,
}

impl ColumnMaps {
    pub fn new(lookup: impl Fn(&Url) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            cache: DashMap::new(),
            lookup: Box::new(lookup),
        }
    }

    /// Get the offset map for `uri`, building it from the looked-up text if
    /// needed. Unknown documents get the identity map.
    pub fn get(&self, uri: &Url) -> Arc<LineColumnOffsetMap> {
        self.cache
            .entry(uri.clone())
            .or_insert_with(|| {
                let text = (self.lookup)(uri).unwrap_or_default();
                Arc::new(LineColumnOffsetMap::build(&text))
            })
            .clone()
    }

    /// Drop the cached map for `uri`; the next `get` rebuilds it.
    pub fn invalidate(&self, uri: &Url) {
        self.cache.remove(uri);
    }
}
