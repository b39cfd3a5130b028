//! Environment cloning: orchestration, progress, anonymization and reports

mod anonymize;
mod collaborators;
mod control;
mod orchestrator;
mod phases;
mod progress;
mod report;
mod subset;
mod types;

pub use anonymize::MaskingAnonymizer;
pub use collaborators::{
    Anonymizer, DataCloner, DriverDataCloner, ReportSink, SpecializedSystem, SystemContext, SystemOutcome,
    TracingReportSink,
};
pub use control::OperationControl;
pub use orchestrator::CloneOrchestrator;
pub use progress::{ProgressSink, ProgressTracker, ProgressUpdate};
pub use report::{CloneReport, ReportSummary};
pub use subset::{SubsetCopySystem, SUBSET_COPY};
pub use types::*;
