//! LSP backend bridging editor requests to the Tarn runtime
//!
//! Generic over the hosted runtime and the parser supplying structural trees.
//! Handles document synchronization, outlines, hovers and push diagnostics;
//! every computation goes through the per-category evaluator slots.
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};

use crate::columns::{ColumnMaps, LineColumnOffsetMap};
use crate::documents::DocumentStore;
use crate::evaluator::TaskCancel;
use crate::locations::{locate_under_cursor, to_protocol_range, to_source_position, SyntaxTree};
use crate::services::{
    DiagnosticsMap, LanguageRuntime, LanguageServices, MessageSeverity, OutlineKind, OutlineNode,
    RuntimeMessage,
};
use crate::settings::Settings;

/// Supplies already-parsed structural trees; the parser itself lives outside
/// this crate.
pub trait TreeSupplier: Send + Sync + 'static {
    fn parse(&self, uri: &Url, text: &str) -> anyhow::Result<SyntaxTree>;
}

/// Tarn LSP backend state
pub struct Backend<R: LanguageRuntime, S: TreeSupplier> {
    /// LSP client for sending notifications/responses
    client: Client,
    /// Open-document snapshots
    documents: Arc<DocumentStore>,
    /// Offset maps for files outside the open set
    columns: Arc<ColumnMaps>,
    /// Per-category evaluator slots and operations
    services: Arc<LanguageServices<R>>,
    /// Structural tree supplier
    trees: Arc<S>,
    /// Behavior toggles from initializationOptions
    settings: RwLock<Settings>,
    /// Workspace root, if the client told us
    workspace_root: RwLock<Option<Url>>,
    /// In-flight compile per document, for supersession
    pending_compiles: Arc<DashMap<Url, TaskCancel>>,
}

impl<R: LanguageRuntime, S: TreeSupplier> Backend<R, S> {
    pub fn new(client: Client, services: Arc<LanguageServices<R>>, trees: Arc<S>) -> Self {
        let documents = Arc::new(DocumentStore::new());
        let lookup_docs = documents.clone();
        Self {
            client,
            documents,
            columns: Arc::new(ColumnMaps::new(move |uri| lookup_docs.text(uri))),
            services,
            trees,
            settings: RwLock::new(Settings::default()),
            workspace_root: RwLock::new(None),
            pending_compiles: Arc::new(DashMap::new()),
        }
    }

    /// Install a fresh snapshot for a changed document.
    fn refresh_document(&self, uri: &Url, text: String, version: i32) {
        self.documents.update(uri.clone(), text, version);
        self.columns.invalidate(uri);
    }

    /// Kick off a compile for one document; a newer compile for the same
    /// document supersedes and cancels an older in-flight one.
    fn spawn_compile(&self, uri: Url) {
        let client = self.client.clone();
        let services = self.services.clone();
        let documents = self.documents.clone();
        let columns = self.columns.clone();
        let pending = self.pending_compiles.clone();
        tokio::spawn(async move {
            let handle = services.compile_file(uri.clone());
            let cancel = handle.canceller();
            if let Some(previous) = pending.insert(uri.clone(), cancel.clone()) {
                previous.cancel();
            }
            let map = handle.result().await;
            pending.remove_if(&uri, |_, current| current.same_task(&cancel));
            if cancel.is_cancelled() {
                // superseded; don't clobber the newer compile's results
                tracing::debug!("compile of {uri} superseded");
                return;
            }
            publish_map(&client, &documents, &columns, map).await;
        });
    }

    fn spawn_folder_compile(&self, folder: Url) {
        let client = self.client.clone();
        let services = self.services.clone();
        let documents = self.documents.clone();
        let columns = self.columns.clone();
        tokio::spawn(async move {
            let map = services.compile_folder(folder).result().await;
            publish_map(&client, &documents, &columns, map).await;
        });
    }
}

/// Publish one diagnostics map, translating spans per file.
async fn publish_map(
    client: &Client,
    documents: &DocumentStore,
    columns: &ColumnMaps,
    map: DiagnosticsMap,
) {
    for (file, messages) in map {
        // results may touch files the editor never opened
        let offsets = documents
            .get(&file)
            .map(|doc| doc.offsets.clone())
            .unwrap_or_else(|| columns.get(&file));
        let diagnostics = messages
            .iter()
            .map(|message| message_to_diagnostic(message, &offsets))
            .collect();
        client.publish_diagnostics(file, diagnostics, None).await;
    }
}

/// Convert a runtime message to a protocol diagnostic.
fn message_to_diagnostic(message: &RuntimeMessage, map: &LineColumnOffsetMap) -> Diagnostic {
    Diagnostic {
        range: to_protocol_range(&message.span, map),
        severity: Some(match message.severity {
            MessageSeverity::Error => DiagnosticSeverity::ERROR,
            MessageSeverity::Warning => DiagnosticSeverity::WARNING,
            MessageSeverity::Info => DiagnosticSeverity::INFORMATION,
        }),
        source: Some("tarn".to_string()),
        message: message.text.clone(),
        ..Diagnostic::default()
    }
}

/// Convert an outline to document symbols; the root node itself is only a
/// container.
fn outline_to_symbols(root: &OutlineNode, map: &LineColumnOffsetMap) -> Vec<DocumentSymbol> {
    root.children
        .iter()
        .filter_map(|child| outline_symbol(child, map))
        .collect()
}

#[allow(deprecated)]
fn outline_symbol(node: &OutlineNode, map: &LineColumnOffsetMap) -> Option<DocumentSymbol> {
    // entries without a source span cannot be rendered
    let span = node.span?;
    let range = to_protocol_range(&span, map);
    let children: Vec<DocumentSymbol> = node
        .children
        .iter()
        .filter_map(|child| outline_symbol(child, map))
        .collect();
    Some(DocumentSymbol {
        name: node.label.clone(),
        detail: None,
        kind: symbol_kind(node.kind),
        tags: None,
        deprecated: None,
        range,
        selection_range: range,
        children: if children.is_empty() {
            None
        } else {
            Some(children)
        },
    })
}

fn symbol_kind(kind: OutlineKind) -> SymbolKind {
    match kind {
        OutlineKind::Module => SymbolKind::MODULE,
        OutlineKind::Function => SymbolKind::FUNCTION,
        OutlineKind::Variable => SymbolKind::VARIABLE,
        OutlineKind::Other => SymbolKind::OBJECT,
    }
}

#[tower_lsp::async_trait]
impl<R: LanguageRuntime, S: TreeSupplier> LanguageServer for Backend<R, S> {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        *self.settings.write().await =
            Settings::from_initialization_options(params.initialization_options);

        #[allow(deprecated)]
        let root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .map(|folder| folder.uri.clone())
            .or_else(|| params.root_uri.clone());
        if let Some(root) = root {
            tracing::info!("workspace root: {root}");
            *self.workspace_root.write().await = Some(root);
        }

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "tarn-lsp".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                            include_text: Some(true),
                        })),
                        ..Default::default()
                    },
                )),
                document_symbol_provider: Some(OneOf::Left(true)),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                ..Default::default()
            },
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        tracing::info!("tarn-lsp server initialized");

        // warm the workspace: check everything once in the background
        if let Some(root) = self.workspace_root.read().await.clone() {
            self.spawn_folder_compile(root);
        }

        self.client
            .log_message(MessageType::INFO, "tarn-lsp ready")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!("tarn-lsp server shutting down");
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        tracing::debug!(
            "did_open: {} ({} bytes)",
            uri,
            params.text_document.text.len()
        );
        self.refresh_document(&uri, params.text_document.text, params.text_document.version);
        self.spawn_compile(uri);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        tracing::debug!("did_change: {uri}");

        // FULL sync: the first change carries the entire content
        if let Some(change) = params.content_changes.into_iter().next() {
            self.refresh_document(&uri, change.text, params.text_document.version);
            if self.settings.read().await.compile_on_change {
                self.spawn_compile(uri);
            }
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        tracing::debug!("did_save: {uri}");

        if let Some(text) = params.text {
            if let Some(doc) = self.documents.get(&uri) {
                self.refresh_document(&uri, text, doc.version);
            }
        }
        if self.settings.read().await.compile_on_save {
            self.spawn_compile(uri);
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        tracing::debug!("did_close: {uri}");

        self.documents.close(&uri);
        self.columns.invalidate(&uri);
        if let Some((_, pending)) = self.pending_compiles.remove(&uri) {
            pending.cancel();
        }

        // clear any diagnostics still shown in the editor
        self.client.publish_diagnostics(uri, vec![], None).await;
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let uri = params.text_document.uri;
        tracing::debug!("document_symbol: {uri}");

        let Some(doc) = self.documents.get(&uri) else {
            tracing::warn!("document not open: {uri}");
            return Ok(None);
        };
        let tree = match self.trees.parse(&uri, &doc.text) {
            Ok(tree) => Arc::new(tree),
            Err(e) => {
                tracing::debug!("parse failed for {uri}: {e:#}");
                return Ok(None);
            }
        };

        let outline = self.services.outline(tree).result().await;
        let symbols = outline_to_symbols(&outline, &doc.offsets);
        if symbols.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DocumentSymbolResponse::Nested(symbols)))
        }
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        tracing::debug!("hover: {uri} at {position:?}");

        let Some(doc) = self.documents.get(&uri) else {
            return Ok(None);
        };
        let tree = match self.trees.parse(&uri, &doc.text) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::debug!("parse failed for {uri}: {e:#}");
                return Ok(None);
            }
        };
        let Some(token_span) = locate_under_cursor(&tree, position, &doc.offsets) else {
            return Ok(None);
        };

        let handle = match self.services.type_summary(&uri) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("hover rejected: {e}");
                return Ok(None);
            }
        };
        let Some(summary) = handle.result().await else {
            return Ok(None);
        };

        let target = to_source_position(position, &doc.offsets, false);
        let Some((_, rendered)) = summary
            .types
            .iter()
            .rev()
            .find(|(span, _)| span.contains(target))
        else {
            return Ok(None);
        };

        Ok(Some(Hover {
            contents: HoverContents::Scalar(MarkedString::String(rendered.clone())),
            range: Some(to_protocol_range(&token_span, &doc.offsets)),
        }))
    }
}
