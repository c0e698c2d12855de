//! tarn-lsp: Language Server Protocol bridge for the hosted Tarn runtime
//!
//! The runtime is stateful and not safe to call reentrantly, so every
//! protocol request flows through per-category evaluator slots; positions
//! cross the boundary through bit-exact UTF-16/codepoint column maps.
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use std::sync::Arc;

use tower_lsp::{LspService, Server};

pub mod backend;
pub mod columns;
pub mod documents;
pub mod evaluator;
pub mod locations;
pub mod services;
pub mod settings;

pub use backend::{Backend, TreeSupplier};
pub use columns::{ColumnMaps, LineColumnOffsetMap};
pub use documents::{Document, DocumentStore};
pub use evaluator::{EvaluatorSlot, InterruptFlag, Interrupted, TaskCancel, TaskHandle, TaskState};
pub use locations::{SourcePosition, SourceSpan, SyntaxNode, SyntaxTree};
pub use services::{
    DiagnosticsMap, FileMessages, LanguageRuntime, LanguageServices, MessageSeverity, OutlineKind,
    OutlineNode, RuntimeFactory, RuntimeMessage, TaskCategory, TypeSummary,
};
pub use settings::Settings;

/// Serve the protocol over stdio until the client disconnects. The factory
/// builds one runtime per task category, lazily; the supplier parses
/// documents into structural trees.
pub async fn run_server<R, S>(factory: RuntimeFactory<R>, trees: S) -> anyhow::Result<()>
where
    R: LanguageRuntime,
    S: TreeSupplier,
{
    tracing::info!("starting tarn-lsp {}", env!("CARGO_PKG_VERSION"));

    let services = Arc::new(LanguageServices::new(factory));
    let trees = Arc::new(trees);
    let (service, socket) = LspService::new(move |client| {
        Backend::new(client, services.clone(), trees.clone())
    });

    Server::new(tokio::io::stdin(), tokio::io::stdout(), socket)
        .serve(service)
        .await;
    Ok(())
}
