pub mod dispatcher;
pub mod job_state;
pub mod reconciler;
pub mod token;
pub mod worker;
