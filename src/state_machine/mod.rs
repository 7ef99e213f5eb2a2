mod job;
mod state;

pub use job::{Job, JobId, JobSnapshot};
pub use state::{JobStatus, StateMachine, Transition};
