use futures::StreamExt;
use futures::future::{join, join_all, try_join_all};
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use tracing::Instrument;

use super::composer::Composer;
use super::notify::{Notification, Notifier};
use super::store::MessageStore;
use crate::backend::{ByteStream, ChatBackend, StoredMessage, StreamEndpoint};
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult, TransportError};
use crate::stream::{AppendPolicy, EventFramer, Reassembler, decode_fragments};
use crate::types::{MediaClass, Message, MessageId, PendingAttachment, Role};

/// Prompt sent with an image when the user typed nothing.
pub const DEFAULT_IMAGE_PROMPT: &str = "Please analyze this medical image.";
pub const LAB_REPORT_HEADING: &str = "Lab report analysis:";
pub const PAGE_SEPARATOR: &str = "\n\n---\n\n";

const NOT_FOUND: u16 = 404;

/// Lifecycle of one submission instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    Classifying,
    ExtractingPdf,
    AwaitingFirstByte,
    Streaming,
    Completed,
    Failed,
}

impl SubmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionState::Completed | SubmissionState::Failed)
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionState::Idle => "idle",
            SubmissionState::Classifying => "classifying",
            SubmissionState::ExtractingPdf => "extracting_pdf",
            SubmissionState::AwaitingFirstByte => "awaiting_first_byte",
            SubmissionState::Streaming => "streaming",
            SubmissionState::Completed => "completed",
            SubmissionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmissionPath {
    /// Text, PDF-derived text and non-image attachments.
    Text,
    Image { name: String },
}

/// Result of one submission instance.
#[derive(Debug)]
pub struct SubmissionOutcome {
    pub path: SubmissionPath,
    pub state: SubmissionState,
    pub user_message: Option<MessageId>,
    pub placeholder: Option<MessageId>,
    /// Final assistant content, set on completion.
    pub content: Option<String>,
    /// False when the completed reply could not be saved to the backend.
    pub persisted: bool,
    pub error: Option<ChatError>,
}

impl SubmissionOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == SubmissionState::Completed
    }
}

/// Outcomes of everything one user action dispatched.
#[derive(Debug, Default)]
pub struct SubmissionReport {
    pub outcomes: Vec<SubmissionOutcome>,
}

impl SubmissionReport {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == SubmissionState::Failed)
            .count()
    }

    pub fn text(&self) -> Option<&SubmissionOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.path == SubmissionPath::Text)
    }

    pub fn images(&self) -> impl Iterator<Item = &SubmissionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.path, SubmissionPath::Image { .. }))
    }
}

struct Submission {
    outcome: SubmissionOutcome,
}

impl Submission {
    fn new(path: SubmissionPath) -> Self {
        Self {
            outcome: SubmissionOutcome {
                path,
                state: SubmissionState::Idle,
                user_message: None,
                placeholder: None,
                content: None,
                persisted: false,
                error: None,
            },
        }
    }

    fn state(&self) -> SubmissionState {
        self.outcome.state
    }

    fn advance(&mut self, next: SubmissionState) {
        tracing::debug!(from = %self.outcome.state, to = %next, "submission state");
        self.outcome.state = next;
    }

    fn fail(mut self, error: ChatError) -> SubmissionOutcome {
        self.advance(SubmissionState::Failed);
        self.outcome.error = Some(error);
        self.outcome
    }
}

/// Turns user input into backend requests and streamed assistant messages.
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<ClientConfig>,
    backend: Arc<dyn ChatBackend>,
    store: MessageStore,
    notifier: Notifier,
}

impl Coordinator {
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn ChatBackend>,
        store: MessageStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            store,
            notifier,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn chat_id(&self) -> &str {
        self.store.chat_id()
    }

    /// Replaces the store contents with the persisted conversation.
    ///
    /// A 404 means the conversation has no messages yet.
    pub async fn load_history(&self) -> ChatResult<usize> {
        let stored = match self.backend.get_messages(self.chat_id()).await {
            Ok(stored) => stored,
            Err(TransportError::Status {
                status: NOT_FOUND, ..
            }) => Vec::new(),
            Err(err) => {
                self.notifier.notify(Notification::error(
                    "Failed to load messages",
                    err.to_string(),
                ));
                return Err(err.into());
            }
        };
        let messages: Vec<Message> = stored
            .into_iter()
            .map(StoredMessage::into_message)
            .collect();
        let count = messages.len();
        self.store.replace_all(messages);
        tracing::info!(chat_id = %self.chat_id(), count, "history loaded");
        Ok(count)
    }

    /// Submits and empties the composer. Nothing is taken when it is empty.
    pub async fn submit_composer(&self, composer: &mut Composer) -> ChatResult<SubmissionReport> {
        if !composer.is_submittable() {
            return Err(ChatError::Validation);
        }
        let (text, attachments) = composer.take();
        self.submit(text, attachments).await
    }

    /// Runs one user action to completion.
    ///
    /// Each image attachment becomes its own submission. Everything else goes
    /// through the text path, with PDFs extracted first. All paths run
    /// concurrently and fail independently.
    pub async fn submit(
        &self,
        text: impl Into<String>,
        attachments: Vec<PendingAttachment>,
    ) -> ChatResult<SubmissionReport> {
        let text = text.into().trim().to_string();
        if text.is_empty() && attachments.is_empty() {
            tracing::debug!("ignoring empty submission");
            return Err(ChatError::Validation);
        }

        let mut pdfs = Vec::new();
        let mut images = Vec::new();
        let mut others = Vec::new();
        for attachment in attachments {
            match attachment.class() {
                MediaClass::Pdf => pdfs.push(attachment),
                MediaClass::Image => images.push(attachment),
                MediaClass::Other => others.push(attachment),
            }
        }

        let span = tracing::info_span!(
            "submission",
            chat_id = %self.chat_id(),
            user_id = self.config.current_user_id.as_deref().unwrap_or("anonymous"),
        );
        tracing::info!(
            parent: &span,
            pdfs = pdfs.len(),
            images = images.len(),
            others = others.len(),
            "dispatching submission"
        );

        let image_prompt = if text.is_empty() {
            DEFAULT_IMAGE_PROMPT.to_string()
        } else {
            text.clone()
        };
        let image_runs = join_all(
            images
                .into_iter()
                .map(|image| self.run_image(image_prompt.clone(), image)),
        );
        let text_run = async {
            if text.is_empty() && pdfs.is_empty() && others.is_empty() {
                None
            } else {
                Some(self.run_text(text, pdfs, others).await)
            }
        };

        let (text_outcome, image_outcomes) = join(text_run, image_runs).instrument(span).await;
        let mut report = SubmissionReport::default();
        report.outcomes.extend(text_outcome);
        report.outcomes.extend(image_outcomes);
        Ok(report)
    }

    async fn run_text(
        &self,
        text: String,
        pdfs: Vec<PendingAttachment>,
        others: Vec<PendingAttachment>,
    ) -> SubmissionOutcome {
        let mut submission = Submission::new(SubmissionPath::Text);
        submission.advance(SubmissionState::Classifying);

        let mut content = text;
        if !pdfs.is_empty() {
            submission.advance(SubmissionState::ExtractingPdf);
            match self.extract_lab_reports(&pdfs).await {
                Ok(block) => content = merge_lab_report(&content, &block),
                Err(err) => {
                    tracing::error!(error = %err, "pdf extraction failed");
                    self.notifier.notify(Notification::error(
                        "Could not read lab report",
                        err.to_string(),
                    ));
                    return submission.fail(err);
                }
            }
        }

        let attachments = others
            .into_iter()
            .map(PendingAttachment::into_attachment)
            .collect();
        let user = Message::user(content.clone(), attachments);
        let user_id = user.id.clone();
        if let Err(err) = self.store.insert(user) {
            return submission.fail(err.into());
        }
        submission.outcome.user_message = Some(user_id);

        let policy = self.config.policy_for(StreamEndpoint::Inference);
        let open = self.backend.infer(self.chat_id(), &content);
        self.stream_reply(submission, policy, open).await
    }

    async fn run_image(&self, prompt: String, image: PendingAttachment) -> SubmissionOutcome {
        let mut submission = Submission::new(SubmissionPath::Image {
            name: image.name.clone(),
        });
        submission.advance(SubmissionState::Classifying);

        let user = Message::user(prompt.clone(), vec![image.clone().into_attachment()]);
        let user_id = user.id.clone();
        if let Err(err) = self.store.insert(user) {
            return submission.fail(err.into());
        }
        submission.outcome.user_message = Some(user_id);

        let policy = self.config.policy_for(StreamEndpoint::ImageAnalysis);
        let open = self.backend.infer_image(self.chat_id(), &prompt, &image);
        self.stream_reply(submission, policy, open)
            .instrument(tracing::info_span!("image", name = %image.name))
            .await
    }

    async fn extract_lab_reports(&self, pdfs: &[PendingAttachment]) -> ChatResult<String> {
        let extractions = try_join_all(pdfs.iter().map(|pdf| async move {
            self.backend
                .parse_pdf(pdf)
                .await
                .map_err(|source| ChatError::Extraction {
                    file: pdf.name.clone(),
                    source,
                })
        }))
        .await?;
        let pages: Vec<&str> = extractions
            .iter()
            .flat_map(|extraction| extraction.page_texts())
            .map(str::trim)
            .filter(|page| !page.is_empty())
            .collect();
        tracing::debug!(files = pdfs.len(), pages = pages.len(), "pdf text extracted");
        Ok(format!("{LAB_REPORT_HEADING}\n\n{}", pages.join(PAGE_SEPARATOR)))
    }

    async fn stream_reply(
        &self,
        mut submission: Submission,
        policy: AppendPolicy,
        open: impl Future<Output = Result<ByteStream, TransportError>>,
    ) -> SubmissionOutcome {
        let placeholder = Message::assistant_placeholder();
        let id = placeholder.id.clone();
        if let Err(err) = self
            .store
            .insert(placeholder)
            .and_then(|()| self.store.begin_stream(&id))
        {
            return submission.fail(err.into());
        }
        submission.outcome.placeholder = Some(id.clone());
        submission.advance(SubmissionState::AwaitingFirstByte);

        match self.consume(&mut submission, &id, policy, open).await {
            Ok(content) => {
                self.store.end_stream(&id);
                submission.outcome.persisted = self.persist(&content).await;
                submission.outcome.content = Some(content);
                submission.advance(SubmissionState::Completed);
                submission.outcome
            }
            Err(err) => {
                tracing::error!(message_id = %id, error = %err, "assistant stream failed");
                self.store.remove(&id);
                self.notifier.notify(Notification::error(
                    "Failed to get a response",
                    err.to_string(),
                ));
                submission.fail(err)
            }
        }
    }

    async fn consume(
        &self,
        submission: &mut Submission,
        id: &MessageId,
        policy: AppendPolicy,
        open: impl Future<Output = Result<ByteStream, TransportError>>,
    ) -> ChatResult<String> {
        let body = open.await?;
        let mut fragments = pin!(decode_fragments(body));
        let mut framer = EventFramer::new();
        let mut reassembler = Reassembler::new(policy);

        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            if submission.state() == SubmissionState::AwaitingFirstByte {
                submission.advance(SubmissionState::Streaming);
            }
            for payload in framer.push(&fragment) {
                let update = reassembler.push(&payload);
                self.store.apply(id, update)?;
            }
        }

        if let Some(tail) = framer.finish() {
            tracing::warn!(bytes = tail.len(), "discarding unterminated trailing event");
        }
        tracing::debug!(
            message_id = %id,
            payloads = reassembler.payload_count(),
            policy = %policy,
            "stream finished"
        );
        Ok(reassembler.into_content())
    }

    /// Saves the completed reply. Failure leaves the local message intact.
    async fn persist(&self, content: &str) -> bool {
        if !self.config.routes.persists_reply() {
            tracing::debug!(routes = %self.config.routes, "reply saved by the inference endpoint");
            return true;
        }
        match self
            .backend
            .add_message(self.chat_id(), Role::Assistant, content)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                let err = ChatError::Persistence(err);
                tracing::warn!(error = %err, "assistant reply kept locally only");
                false
            }
        }
    }
}

fn merge_lab_report(text: &str, block: &str) -> String {
    if text.is_empty() {
        block.to_string()
    } else {
        format!("{text}\n\n{block}")
    }
}
