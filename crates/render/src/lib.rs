//! Subclip Render
//!
//! Render queue for stabilized subclips: jobs are queued in memory, drained
//! one at a time through an external stabilizer process, and classified
//! from the process exit code, its stderr and the output file on disk.

pub mod classify;
pub mod drain;
pub mod encode;
pub mod job;
pub mod locator;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod status;
pub mod status_server;
pub mod supervisor;

pub use subclip_render_config as config;
pub use subclip_render_config::Config;
pub use classify::{classify, ErrorKind, ProcessReport, RenderOutcome};
pub use drain::{
    describe_outcome, DrainError, DrainGuard, DrainOptions, DrainSummary, JobReport, Locator,
    OverwriteDecision, QueueDrainer,
};
pub use encode::{build_invocation, BuildError, Dimensions, RenderSettings, StabilizerInvocation};
pub use job::{JobId, JobState, RenderJob, RenderRequest, Rotation};
pub use locator::{check_stabilizer_available, locate_stabilizer, LocatorError};
pub use probe::{FfprobeProbe, MediaProbe};
pub use progress::{parse_progress_line, ProgressUpdate};
pub use queue::{Enqueued, QueueError, RenderQueue};
pub use status::{new_shared_status, SharedStatus, StatusSnapshot};
pub use status_server::{create_router, run_status_server, AppState, ServerError};
pub use supervisor::{ProcessSupervisor, StabilizerRunner, SupervisorError};
