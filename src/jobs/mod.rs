//! Job lifecycle: residency, definitions, guards and operator actions.

pub mod definition;
pub mod guards;
pub mod id;
pub mod location;
pub mod manager;
pub mod result;

pub use definition::{JobMetadata, PipelineDefinition, TaskDescriptor};
pub use guards::{InFlightGuard, InFlightGuards, Operation};
pub use id::JobId;
pub use location::{JobPaths, Location};
pub use manager::{
    JobLifecycleManager, RescanOutcome, ResetMode, RestartOutcome, StartOutcome, StatusReport,
    StopOutcome,
};
pub use result::OperationResult;
