use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use serde::Serialize;

use super::{ByteStream, ChatBackend, PdfExtraction, RouteSet, StoredMessage};
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::types::{PendingAttachment, Role};

/// `reqwest` client for the MediSense backend.
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    routes: RouteSet,
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    content: &'a str,
    role: Role,
}

/// Flat inference body. The endpoint is not chat-scoped, so the id travels here.
#[derive(Serialize)]
struct FlatInferRequest<'a> {
    chat_id: &'a str,
    content: &'a str,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &ClientConfig) -> Result<Self, TransportError> {
        let base_url =
            Url::parse(&config.backend_base_url).map_err(|e| TransportError::InvalidUrl {
                url: config.backend_base_url.clone(),
                reason: e.to_string(),
            })?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl {
                url: config.backend_base_url.clone(),
                reason: "not a base URL".to_string(),
            });
        }
        Ok(Self {
            client,
            base_url,
            routes: config.routes,
        })
    }

    pub fn routes(&self) -> RouteSet {
        self.routes
    }

    fn url(&self, segments: &[String]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn ensure_success(response: Response, endpoint: &Url) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            endpoint: endpoint.path().to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn open_stream(
        &self,
        url: Url,
        request: reqwest::RequestBuilder,
    ) -> Result<ByteStream, TransportError> {
        let response = request
            .header("accept", "text/event-stream")
            .send()
            .await?;
        let response = Self::ensure_success(response, &url).await?;
        if response.content_length() == Some(0) {
            return Err(TransportError::MissingBody(url.path().to_string()));
        }
        tracing::debug!(endpoint = %url.path(), "stream opened");
        Ok(Box::pin(
            response
                .bytes_stream()
                .map_err(|e| TransportError::Stream(e.to_string())),
        ))
    }

    fn file_part(file: &PendingAttachment) -> Result<Part, TransportError> {
        Ok(Part::bytes(file.data.to_vec())
            .file_name(file.name.clone())
            .mime_str(&file.media_type)?)
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn add_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), TransportError> {
        let url = self.url(&self.routes.add_message(chat_id));
        let response = self
            .client
            .post(url.clone())
            .json(&MessageRequest { content, role })
            .send()
            .await?;
        Self::ensure_success(response, &url).await?;
        Ok(())
    }

    async fn infer(&self, chat_id: &str, content: &str) -> Result<ByteStream, TransportError> {
        let url = self.url(&self.routes.infer(chat_id));
        let request = self.client.post(url.clone());
        let request = match self.routes {
            RouteSet::Scoped => request.json(&MessageRequest {
                content,
                role: Role::User,
            }),
            RouteSet::Flat => request.json(&FlatInferRequest { chat_id, content }),
        };
        self.open_stream(url, request).await
    }

    async fn parse_pdf(&self, file: &PendingAttachment) -> Result<PdfExtraction, TransportError> {
        let segments = self
            .routes
            .parse_pdf()
            .ok_or(TransportError::Unsupported {
                operation: "PDF extraction",
                routes: self.routes.name(),
            })?;
        let url = self.url(&segments);
        let form = Form::new().part("file", Self::file_part(file)?);
        let response = self.client.post(url.clone()).multipart(form).send().await?;
        let response = Self::ensure_success(response, &url).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| TransportError::Schema {
            endpoint: url.path().to_string(),
            reason: e.to_string(),
        })
    }

    async fn infer_image(
        &self,
        chat_id: &str,
        message: &str,
        file: &PendingAttachment,
    ) -> Result<ByteStream, TransportError> {
        let segments = self
            .routes
            .infer_image(chat_id)
            .ok_or(TransportError::Unsupported {
                operation: "image analysis",
                routes: self.routes.name(),
            })?;
        let url = self.url(&segments);
        let form = Form::new()
            .text("message", message.to_string())
            .part("file", Self::file_part(file)?);
        let request = self.client.post(url.clone()).multipart(form);
        self.open_stream(url, request).await
    }

    async fn get_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>, TransportError> {
        let url = self.url(&self.routes.get_messages(chat_id));
        let response = self.client.get(url.clone()).send().await?;
        let response = Self::ensure_success(response, &url).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| TransportError::Schema {
            endpoint: url.path().to_string(),
            reason: e.to_string(),
        })
    }
}
