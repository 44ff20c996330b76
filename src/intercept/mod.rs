mod engine;
mod har;
mod rules;

pub use engine::{InterceptionEngine, PendingSnapshot};
pub use har::{HarEntry, HarRecorder, har_document, timestamp_to_iso};
pub use rules::{
    Disposition, InterceptionRule, MockEndpoint, MockSpec, Modification, PausedRequest,
    RuleAction, RuleStage, patterns_overlap,
};
