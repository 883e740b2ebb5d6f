//! Conversation state and the submission workflow.
pub mod composer;
pub mod coordinator;
pub mod notify;
pub mod store;

pub use composer::Composer;
pub use coordinator::{
    Coordinator, SubmissionOutcome, SubmissionPath, SubmissionReport, SubmissionState,
};
pub use notify::{Notification, Notifier};
pub use store::{MessageStore, StoreEvent};
