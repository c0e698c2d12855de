//! Language service operations over the hosted Tarn runtime
//!
//! Each public operation resolves its inputs, submits one task to the slot of
//! its category, translates the raw runtime result and falls back to the
//! category default on every failure path. The runtime itself is opaque: this
//! module only orchestrates calls into it.
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tower_lsp::lsp_types::Url;

use crate::evaluator::{EvaluatorSlot, InterruptFlag, TaskHandle};
use crate::locations::{module_name_from_uri, LocationError, SourceSpan, SyntaxTree};

/// Request classes that share one evaluator slot. Outlining never queues
/// behind a full compile this way, while each slot still runs at most one
/// task at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Outline,
    Summary,
    Compile,
}

impl TaskCategory {
    pub fn label(self) -> &'static str {
        match self {
            TaskCategory::Outline => "outline",
            TaskCategory::Summary => "summary",
            TaskCategory::Compile => "compile",
        }
    }
}

/// Severity of a message produced by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Error,
    Warning,
    Info,
}

/// One message the runtime attached to a source span.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeMessage {
    pub span: SourceSpan,
    pub severity: MessageSeverity,
    pub text: String,
}

/// The runtime's check results for one file.
#[derive(Debug, Clone)]
pub struct FileMessages {
    pub file: Url,
    pub messages: Vec<RuntimeMessage>,
}

/// Diagnostics per file, as handed to the request layer.
pub type DiagnosticsMap = HashMap<Url, Vec<RuntimeMessage>>;

/// Kind of an outline entry, mapped onto protocol symbol kinds upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutlineKind {
    Module,
    Function,
    Variable,
    #[default]
    Other,
}

/// One node of a document outline in internal coordinates. The default value
/// is the empty outline, used whenever a task fails or is interrupted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlineNode {
    pub label: String,
    pub kind: OutlineKind,
    pub span: Option<SourceSpan>,
    pub children: Vec<OutlineNode>,
}

/// Type information the runtime derived for one module.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSummary {
    pub module: String,
    /// Rendered type per source span, innermost spans last.
    pub types: Vec<(SourceSpan, String)>,
}

/// The hosted runtime contract. One instance is constructed per task
/// category; construction imports the category's libraries and is expensive.
///
/// Long-running calls must poll the [`InterruptFlag`] the factory received
/// and return [`crate::evaluator::Interrupted`] when it is raised.
pub trait LanguageRuntime: Send + 'static {
    fn outline(&mut self, tree: &SyntaxTree) -> anyhow::Result<OutlineNode>;
    fn make_summary(&mut self, module: &str) -> anyhow::Result<Option<TypeSummary>>;
    fn check_files(&mut self, files: &[Url]) -> anyhow::Result<Vec<FileMessages>>;
    fn check_all(&mut self, folder: &Url) -> anyhow::Result<Vec<FileMessages>>;
}

/// Builds one runtime instance for a category, receiving the slot's
/// interrupt flag.
pub type RuntimeFactory<R> =
    Arc<dyn Fn(TaskCategory, InterruptFlag) -> anyhow::Result<R> + Send + Sync>;

/// The request orchestrator: one lazily-created slot per category, public
/// operations as thin compositions over them.
pub struct LanguageServices<R> {
    factory: RuntimeFactory<R>,
    outline: OnceLock<EvaluatorSlot<R>>,
    summary: OnceLock<EvaluatorSlot<R>>,
    compile: OnceLock<EvaluatorSlot<R>>,
}

impl<R: LanguageRuntime> LanguageServices<R> {
    pub fn new(factory: RuntimeFactory<R>) -> Self {
        Self {
            factory,
            outline: OnceLock::new(),
            summary: OnceLock::new(),
            compile: OnceLock::new(),
        }
    }

    /// The slot for a category, creating it (and starting its background
    /// construction) on first reference.
    fn slot(&self, category: TaskCategory) -> &EvaluatorSlot<R> {
        let cell = match category {
            TaskCategory::Outline => &self.outline,
            TaskCategory::Summary => &self.summary,
            TaskCategory::Compile => &self.compile,
        };
        cell.get_or_init(|| {
            let factory = self.factory.clone();
            EvaluatorSlot::new(category.label(), move |flag| factory(category, flag))
        })
    }

    /// Outline a parsed module. A tree without a source file yields the empty
    /// outline without touching the runtime.
    pub fn outline(&self, tree: Arc<SyntaxTree>) -> TaskHandle<OutlineNode> {
        if tree.file.is_none() {
            return TaskHandle::ready(OutlineNode::default());
        }
        self.slot(TaskCategory::Outline).submit(
            "outline",
            move |runtime: &mut R| runtime.outline(&tree),
            OutlineNode::default(),
        )
    }

    /// Summarize the types of the module a URI denotes. A malformed URI is a
    /// synchronous error; everything downstream of it yields `None`.
    pub fn type_summary(
        &self,
        uri: &Url,
    ) -> Result<TaskHandle<Option<TypeSummary>>, LocationError> {
        let module = module_name_from_uri(uri)?;
        Ok(self.slot(TaskCategory::Summary).submit(
            "make-summary",
            move |runtime: &mut R| runtime.make_summary(&module),
            None,
        ))
    }

    /// Check a single file.
    pub fn compile_file(&self, file: Url) -> TaskHandle<DiagnosticsMap> {
        self.compile_file_list(vec![file])
    }

    /// Check a list of files. The default result carries one empty entry per
    /// requested file, so a wholesale failure still answers "no diagnostics"
    /// for every file asked about.
    pub fn compile_file_list(&self, files: Vec<Url>) -> TaskHandle<DiagnosticsMap> {
        let default: DiagnosticsMap = files
            .iter()
            .map(|file| (file.clone(), Vec::new()))
            .collect();
        self.slot(TaskCategory::Compile).submit(
            "check",
            move |runtime: &mut R| runtime.check_files(&files).map(collect_messages),
            default,
        )
    }

    /// Check every module under a folder.
    pub fn compile_folder(&self, folder: Url) -> TaskHandle<DiagnosticsMap> {
        self.slot(TaskCategory::Compile).submit(
            "check-all",
            move |runtime: &mut R| runtime.check_all(&folder).map(collect_messages),
            DiagnosticsMap::new(),
        )
    }
}

fn collect_messages(results: Vec<FileMessages>) -> DiagnosticsMap {
    results
        .into_iter()
        .map(|entry| (entry.file, entry.messages))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locations::{SourcePosition, SyntaxNode};

    /// A runtime whose behavior is fixed at construction.
    struct FakeRuntime {
        fail_checks: bool,
    }

    impl LanguageRuntime for FakeRuntime {
        fn outline(&mut self, _tree: &SyntaxTree) -> anyhow::Result<OutlineNode> {
            Ok(OutlineNode {
                label: "module".into(),
                kind: OutlineKind::Module,
                span: None,
                children: vec![],
            })
        }

        fn make_summary(&mut self, module: &str) -> anyhow::Result<Option<TypeSummary>> {
            Ok(Some(TypeSummary {
                module: module.to_string(),
                types: vec![],
            }))
        }

        fn check_files(&mut self, files: &[Url]) -> anyhow::Result<Vec<FileMessages>> {
            if self.fail_checks {
                anyhow::bail!("checker crashed");
            }
            Ok(files
                .iter()
                .map(|file| FileMessages {
                    file: file.clone(),
                    messages: vec![RuntimeMessage {
                        span: SourceSpan::new(
                            SourcePosition::new(1, 0),
                            SourcePosition::new(1, 1),
                        ),
                        severity: MessageSeverity::Error,
                        text: "bad".into(),
                    }],
                })
                .collect())
        }

        fn check_all(&mut self, _folder: &Url) -> anyhow::Result<Vec<FileMessages>> {
            Ok(vec![])
        }
    }

    fn services(fail_checks: bool) -> LanguageServices<FakeRuntime> {
        LanguageServices::new(Arc::new(move |_category, _flag| {
            Ok(FakeRuntime { fail_checks })
        }))
    }

    fn file(name: &str) -> Url {
        Url::parse(&format!("file:///ws/{name}.tarn")).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outline_without_file_is_immediately_empty() {
        let services = services(false);
        let tree = Arc::new(SyntaxTree {
            file: None,
            root: SyntaxNode {
                span: SourceSpan::new(SourcePosition::new(1, 0), SourcePosition::new(1, 0)),
                lexical: false,
                children: vec![],
            },
        });
        let handle = services.outline(tree);
        assert_eq!(handle.result().await, OutlineNode::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outline_reaches_runtime_for_real_files() {
        let services = services(false);
        let tree = Arc::new(SyntaxTree {
            file: Some(file("Mod")),
            root: SyntaxNode {
                span: SourceSpan::new(SourcePosition::new(1, 0), SourcePosition::new(9, 0)),
                lexical: false,
                children: vec![],
            },
        });
        let outline = services.outline(tree).result().await;
        assert_eq!(outline.label, "module");
        assert_eq!(outline.kind, OutlineKind::Module);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn type_summary_rejects_malformed_uri_synchronously() {
        let services = services(false);
        let uri = Url::parse("mailto:nobody@example.com").unwrap();
        assert!(services.type_summary(&uri).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn type_summary_carries_module_name() {
        let services = services(false);
        let summary = services
            .type_summary(&file("Listing"))
            .unwrap()
            .result()
            .await
            .unwrap();
        assert_eq!(summary.module, "Listing");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compile_file_list_failure_keeps_per_file_entries() {
        let services = services(true);
        let (a, b) = (file("A"), file("B"));
        let map = services
            .compile_file_list(vec![a.clone(), b.clone()])
            .result()
            .await;
        assert_eq!(map.len(), 2);
        assert_eq!(map[&a], Vec::new());
        assert_eq!(map[&b], Vec::new());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compile_file_translates_results() {
        let services = services(false);
        let a = file("A");
        let map = services.compile_file(a.clone()).result().await;
        assert_eq!(map[&a].len(), 1);
        assert_eq!(map[&a][0].severity, MessageSeverity::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compile_folder_default_is_empty_map() {
        let services = services(false);
        let folder = Url::parse("file:///ws/src/").unwrap();
        let map = services.compile_folder(folder).result().await;
        assert!(map.is_empty());
    }
}
