//! Query engine - turns a question into a guarded statement, runs it and
//! composes the answer

pub mod classifier;
pub mod composer;
pub mod executor;
pub mod fallback;
pub mod orchestrator;
pub mod planner;
pub mod sql_guard;
pub mod synthesizer;

pub use classifier::{Classification, Intent, QueryClassifier};
pub use composer::{AnswerPath, ComposedAnswer, ComposerConfig, ResponseComposer};
pub use executor::{ExecutionOutcome, QueryExecutor};
pub use fallback::{FallbackAnalyzer, Suggestion};
pub use orchestrator::{
    Answer, Lifecycle, OrchestratorConfig, Question, QueryOrchestrator, QueryStage, Requester, SourcesSummary,
};
pub use planner::{QueryPlan, QueryPlanner};
pub use sql_guard::{validate_read_only, GuardRejection, GuardedQuery, SoftDeleteQuery, SqlGuard};
pub use synthesizer::{GeneratedQuery, QueryOrigin, QuerySynthesizer, SynthesizerConfig};
