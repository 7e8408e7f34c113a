//! Production workflow: dataset registration, run selection, job submission
//! and completion reconciliation.

pub mod collector;
pub mod completion;
pub mod descriptor;
pub mod registry;
pub mod scheduler;
pub mod selector;
pub mod submitter;

pub use collector::{CompletionCollector, ReconciliationReport};
pub use completion::{CompletionBatch, CompletionRecord, Outcome, read_records};
pub use descriptor::{JobDescriptor, descriptor_path, update_file_path};
pub use registry::{DatasetRegistry, DiscoveryReport};
pub use scheduler::{CommandScheduler, Scheduler, SchedulerAck, SchedulerError, SubmissionRequest};
pub use selector::RunSelector;
pub use submitter::{JobSubmission, JobSubmitter};
