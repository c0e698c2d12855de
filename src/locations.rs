//! Mapping between Tarn source locations and LSP protocol locations
//!
//! Tarn addresses positions with 1-based lines and codepoint columns; the
//! protocol uses 0-based lines and UTF-16 columns. Conversions go through the
//! document's [`LineColumnOffsetMap`].
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use thiserror::Error;
use tower_lsp::lsp_types::{Position, Range, Url};

use crate::columns::LineColumnOffsetMap;

/// A position as the Tarn runtime reports it: 1-based line, codepoint column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

impl SourcePosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// An ordered pair of source positions, `begin <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub begin: SourcePosition,
    pub end: SourcePosition,
}

impl SourceSpan {
    pub fn new(begin: SourcePosition, end: SourcePosition) -> Self {
        Self { begin, end }
    }

    /// Half-open containment: `begin <= pos < end`.
    pub fn contains(&self, pos: SourcePosition) -> bool {
        self.begin <= pos && pos < self.end
    }
}

/// A node of the structural tree handed in by the parser.
#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub span: SourceSpan,
    /// Lexical leaves are the smallest units a cursor can land on.
    pub lexical: bool,
    pub children: Vec<SyntaxNode>,
}

/// An already-parsed structural tree plus the file it came from, if known.
#[derive(Debug, Clone)]
pub struct SyntaxTree {
    pub file: Option<Url>,
    pub root: SyntaxNode,
}

/// Failures resolving a location or identifier, reported synchronously to the
/// caller before any task is submitted.
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("not a file-like URI: {0}")]
    NotAFile(Url),
    #[error("no module name in {0}")]
    NoModuleName(Url),
}

/// Convert an internal position, shifting the line base and translating the
/// column. `at_end` marks the end side of a range.
pub fn to_protocol_position(
    pos: SourcePosition,
    map: &LineColumnOffsetMap,
    at_end: bool,
) -> Position {
    let line = pos.line.saturating_sub(1);
    Position::new(line, map.translate_column(line, pos.column, at_end))
}

/// Convert an internal span to a protocol range, each endpoint independently.
pub fn to_protocol_range(span: &SourceSpan, map: &LineColumnOffsetMap) -> Range {
    Range::new(
        to_protocol_position(span.begin, map, false),
        to_protocol_position(span.end, map, true),
    )
}

/// Convert a protocol position back to internal coordinates.
pub fn to_source_position(
    pos: Position,
    map: &LineColumnOffsetMap,
    at_end: bool,
) -> SourcePosition {
    SourcePosition {
        line: pos.line + 1,
        column: map.reverse_column(pos.line, pos.character, at_end),
    }
}

/// Find the span of the smallest lexical node under an editor cursor, or
/// `None` when the cursor is outside every lexical leaf.
pub fn locate_under_cursor(
    tree: &SyntaxTree,
    pos: Position,
    map: &LineColumnOffsetMap,
) -> Option<SourceSpan> {
    let target = to_source_position(pos, map, false);
    let mut found = None;
    locate(&tree.root, target, &mut found);
    found
}

fn locate(node: &SyntaxNode, target: SourcePosition, found: &mut Option<SourceSpan>) {
    if !node.span.contains(target) {
        return;
    }
    if node.lexical {
        *found = Some(node.span);
    }
    for child in &node.children {
        locate(child, target, found);
    }
}

/// Derive the module identifier a URI denotes: the file stem of its last path
/// segment. Malformed input is an error, never silently defaulted.
pub fn module_name_from_uri(uri: &Url) -> Result<String, LocationError> {
    let mut segments = uri
        .path_segments()
        .ok_or_else(|| LocationError::NotAFile(uri.clone()))?;
    let file = segments
        .next_back()
        .ok_or_else(|| LocationError::NoModuleName(uri.clone()))?;
    let stem = file.split('.').next().unwrap_or("");
    if stem.is_empty() {
        return Err(LocationError::NoModuleName(uri.clone()));
    }
    Ok(stem.to_string())
}
