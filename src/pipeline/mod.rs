//! Report pipeline
//!
//! A run moves through a fixed set of statuses. Collection rounds fan out
//! over a tool table, the quality gate decides whether the evidence is
//! enough, and reviewer feedback is classified before anything acts on it.

mod collaborators;
mod collection;
mod machine;
mod offline;
mod selector;
mod state;
mod tools;

pub use collaborators::{DocumentSource, ReportAuthor, ReviewChannel, SourceError};
pub use collection::{collect_round, CollectionSettings, RoundOutcome};
pub use machine::{Orchestrator, RunOutcome};
pub use offline::{read_documents, JsonlSource, TemplateAuthor};
pub use selector::{parse_tool_choice, ModelToolSelector};
pub use state::{
    CompletionNote, Failure, FailureReason, PipelineState, PipelineStatus, Plan,
    TransitionRecord,
};
pub use tools::{resolve_tools, Phase, Tool, ToolBox, ToolOutput, ToolSelector};
