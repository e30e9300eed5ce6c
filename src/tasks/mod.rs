pub mod api;
pub mod lifecycle;
pub mod models;
pub mod query;
pub mod store;
pub mod submission;

pub use lifecycle::{ApplyOutcome, SettlementOutcome, TaskLifecycle};
pub use models::{GenerationTask, MediaType, Platform, TaskPayload, TaskStatus};
pub use query::{QueryService, TaskQuery, TaskView};
pub use store::{PgTaskStore, StoreError, TaskStore};
pub use submission::{
    GenerationRequest, SubmissionLimits, SubmissionService, SubmitError, SubmitResponse,
};
