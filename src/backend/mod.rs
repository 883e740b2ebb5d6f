//! Backend HTTP contract consumed by the chat core.
//!
//! - `routes` - the two deployment route sets
//! - `http` - `reqwest` implementation of [`ChatBackend`]
mod http;
pub mod routes;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::TransportError;
use crate::types::{Attachment, AttachmentKind, Message, MessageId, PendingAttachment, Role};

pub use http::HttpBackend;
pub use routes::{RouteSet, StreamEndpoint};

/// Raw response body of a streaming endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn add_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), TransportError>;

    /// Opens the text inference stream.
    async fn infer(&self, chat_id: &str, content: &str) -> Result<ByteStream, TransportError>;

    async fn parse_pdf(&self, file: &PendingAttachment) -> Result<PdfExtraction, TransportError>;

    /// Opens the image analysis stream.
    async fn infer_image(
        &self,
        chat_id: &str,
        message: &str,
        file: &PendingAttachment,
    ) -> Result<ByteStream, TransportError>;

    async fn get_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>, TransportError>;
}

// ============================================
// Response schemas
// ============================================

#[derive(Debug, Clone, Deserialize)]
pub struct PdfExtraction {
    pub text: ExtractedDocument,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedDocument {
    pub pages: Vec<ExtractedPage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedPage {
    pub md: String,
}

impl PdfExtraction {
    pub fn page_texts(&self) -> impl Iterator<Item = &str> {
        self.text.pages.iter().map(|page| page.md.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoredContent {
    Structured { text: String },
    Plain(String),
}

impl StoredContent {
    pub fn into_text(self) -> String {
        match self {
            StoredContent::Structured { text } => text,
            StoredContent::Plain(text) => text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub content: StoredContent,
    pub role: Role,
    pub created_at: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl StoredMessage {
    pub fn into_message(self) -> Message {
        let timestamp = parse_timestamp(&self.created_at).unwrap_or_else(|| {
            tracing::warn!(
                message_id = %self.id,
                created_at = %self.created_at,
                "unparseable message timestamp, using current time"
            );
            OffsetDateTime::now_utc()
        });
        let attachments = self
            .image_url
            .map(|url| Attachment {
                kind: AttachmentKind::Image,
                display_name: url.rsplit('/').next().unwrap_or(&url).to_string(),
                locator: url,
            })
            .into_iter()
            .collect();
        Message {
            id: MessageId::new(self.id),
            role: self.role,
            content: self.content.into_text(),
            timestamp,
            attachments,
        }
    }
}

/// Accepts RFC 3339, or ISO 8601 without an offset (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok().or_else(|| {
        PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT)
            .ok()
            .map(PrimitiveDateTime::assume_utc)
    })
}
