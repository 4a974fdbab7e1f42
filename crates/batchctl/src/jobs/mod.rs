pub mod cancel;
pub mod monitor;
pub mod record;
pub mod spec;
pub mod submit;

pub use cancel::CancellationManager;
pub use monitor::MonitoringService;
pub use record::{
    CancellationResult, CancellationStatus, DetailsSource, JobDetails, JobOutput, JobRecord,
    JobState, OutputStream, QueueSnapshot,
};
pub use spec::{ArraySpec, JobSpec, ScriptSource};
pub use submit::SubmissionManager;
