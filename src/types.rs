use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Identifier of a message within one conversation.
///
/// Optimistic entries get client-generated ids (`user-…`, `assistant-…`); messages loaded
/// from history keep the id the backend assigned.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn optimistic(role: Role) -> Self {
        Self(format!("{}-{}", role.as_str(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Only valid for the current session; `blob:`/`file://` locators do not survive a restart.
    pub locator: String,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: OffsetDateTime,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: MessageId::optimistic(Role::User),
            role: Role::User,
            content: content.into(),
            timestamp: OffsetDateTime::now_utc(),
            attachments,
        }
    }

    pub fn assistant_placeholder() -> Self {
        Self {
            id: MessageId::optimistic(Role::Assistant),
            role: Role::Assistant,
            content: String::new(),
            timestamp: OffsetDateTime::now_utc(),
            attachments: Vec::new(),
        }
    }
}

/// How a submission routes an attachment, decided by its declared media type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaClass {
    Pdf,
    Image,
    Other,
}

impl MediaClass {
    pub fn classify(media_type: &str) -> Self {
        let essence = media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence == "application/pdf" {
            MediaClass::Pdf
        } else if essence.starts_with("image/") {
            MediaClass::Image
        } else {
            MediaClass::Other
        }
    }
}

/// A file held locally until a submission consumes it.
#[derive(Clone, Debug)]
pub struct PendingAttachment {
    pub name: String,
    pub media_type: String,
    pub data: Bytes,
    locator: String,
}

impl PendingAttachment {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            data: data.into(),
            locator: format!("blob:medisense/{}", Uuid::new_v4()),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| TransportError::Attachment {
                path: path.display().to_string(),
                source,
            })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let media_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(Self {
            name,
            media_type,
            data: Bytes::from(data),
            locator: format!("file://{}", absolute.display()),
        })
    }

    pub fn class(&self) -> MediaClass {
        MediaClass::classify(&self.media_type)
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Consumes the pending file into the attachment shown on the optimistic user message.
    pub fn into_attachment(self) -> Attachment {
        let kind = if self.class() == MediaClass::Image {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        };
        Attachment {
            kind,
            locator: self.locator,
            display_name: self.name,
        }
    }
}
