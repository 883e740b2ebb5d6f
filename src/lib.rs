pub mod backend;
pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod stream;
pub mod types;

pub use backend::{ChatBackend, HttpBackend, RouteSet};
pub use chat::{Composer, Coordinator, MessageStore, Notification, Notifier, StoreEvent};
pub use config::ClientConfig;
pub use error::{ChatError, ChatResult, StoreError, TransportError};
pub use types::{Attachment, AttachmentKind, Message, MessageId, PendingAttachment, Role};
