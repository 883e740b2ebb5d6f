use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

use medisense::backend::{
    ByteStream, ChatBackend, ExtractedDocument, ExtractedPage, PdfExtraction, StoredMessage,
};
use medisense::chat::{
    Composer, Coordinator, MessageStore, Notification, Notifier, SubmissionPath, SubmissionState,
};
use medisense::stream::AppendPolicy;
use medisense::{ChatError, ClientConfig, PendingAttachment, Role, TransportError};

#[derive(Clone)]
enum Script {
    /// Sends each chunk as one read, then ends cleanly.
    Chunks(Vec<Vec<u8>>),
    /// Sends the chunks, then the connection drops.
    BreakAfter(Vec<Vec<u8>>),
    /// The request itself is rejected.
    Refuse,
}

#[derive(Default)]
struct FakeBackend {
    text_stream: Option<Script>,
    image_stream: Option<Script>,
    /// Per-file image scripts, checked before `image_stream`.
    image_streams: Vec<(&'static str, Script)>,
    pdf_pages: Option<Vec<&'static str>>,
    /// Per-file extraction results, checked before `pdf_pages`.
    pdf_pages_by_file: Vec<(&'static str, Vec<&'static str>)>,
    history_json: Option<&'static str>,
    fail_persist: bool,
    inferred: Mutex<Vec<String>>,
    image_prompts: Mutex<Vec<String>>,
    saved: Mutex<Vec<(Role, String)>>,
}

impl FakeBackend {
    fn open(script: Option<&Script>, endpoint: &str) -> Result<ByteStream, TransportError> {
        let to_items = |chunks: &Vec<Vec<u8>>| {
            chunks
                .iter()
                .map(|c| Ok(Bytes::from(c.clone())))
                .collect::<Vec<Result<Bytes, TransportError>>>()
        };
        // Yield between reads so concurrent submissions interleave.
        let paced = |items: Vec<Result<Bytes, TransportError>>| {
            stream::iter(items)
                .then(|item| async move {
                    tokio::task::yield_now().await;
                    item
                })
                .boxed()
        };
        match script {
            Some(Script::Chunks(chunks)) => Ok(paced(to_items(chunks))),
            Some(Script::BreakAfter(chunks)) => {
                let mut items = to_items(chunks);
                items.push(Err(TransportError::Stream("connection reset".into())));
                Ok(paced(items))
            }
            Some(Script::Refuse) | None => Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: 500,
                body: "boom".into(),
            }),
        }
    }

    fn saved(&self) -> Vec<(Role, String)> {
        self.saved.lock().unwrap().clone()
    }

    fn inferred(&self) -> Vec<String> {
        self.inferred.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn add_message(
        &self,
        _chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), TransportError> {
        if self.fail_persist {
            return Err(TransportError::Status {
                endpoint: "/message".into(),
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.saved.lock().unwrap().push((role, content.to_string()));
        Ok(())
    }

    async fn infer(&self, chat_id: &str, content: &str) -> Result<ByteStream, TransportError> {
        self.inferred.lock().unwrap().push(content.to_string());
        Self::open(self.text_stream.as_ref(), &format!("/chat/{chat_id}/infer"))
    }

    async fn parse_pdf(&self, file: &PendingAttachment) -> Result<PdfExtraction, TransportError> {
        let by_file = self
            .pdf_pages_by_file
            .iter()
            .find(|(name, _)| *name == file.name)
            .map(|(_, pages)| pages);
        match by_file.or(self.pdf_pages.as_ref()) {
            Some(pages) => Ok(PdfExtraction {
                text: ExtractedDocument {
                    pages: pages
                        .iter()
                        .map(|md| ExtractedPage { md: md.to_string() })
                        .collect(),
                },
            }),
            None => Err(TransportError::Status {
                endpoint: format!("/parse-pdf ({})", file.name),
                status: 422,
                body: "not a pdf".into(),
            }),
        }
    }

    async fn infer_image(
        &self,
        chat_id: &str,
        message: &str,
        file: &PendingAttachment,
    ) -> Result<ByteStream, TransportError> {
        self.image_prompts.lock().unwrap().push(message.to_string());
        let script = self
            .image_streams
            .iter()
            .find(|(name, _)| *name == file.name)
            .map(|(_, script)| script)
            .or(self.image_stream.as_ref());
        Self::open(script, &format!("/images/{chat_id}/infer/image"))
    }

    async fn get_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>, TransportError> {
        match self.history_json {
            Some(json) => Ok(serde_json::from_str(json).unwrap()),
            None => Err(TransportError::Status {
                endpoint: format!("/chat/{chat_id}/messages"),
                status: 404,
                body: "No messages found".into(),
            }),
        }
    }
}

fn sse(payloads: &[&str]) -> Vec<u8> {
    payloads
        .iter()
        .map(|p| format!("data: {p}\n\n"))
        .collect::<String>()
        .into_bytes()
}

/// Splits a body into reads of `size` bytes, ignoring character boundaries.
fn reads(body: Vec<u8>, size: usize) -> Vec<Vec<u8>> {
    body.chunks(size).map(<[u8]>::to_vec).collect()
}

fn setup(
    backend: FakeBackend,
    config: ClientConfig,
) -> (
    Coordinator,
    Arc<FakeBackend>,
    MessageStore,
    UnboundedReceiver<Notification>,
) {
    let backend = Arc::new(backend);
    let store = MessageStore::new("chat-1");
    let (notifier, notifications) = Notifier::channel();
    let coordinator = Coordinator::new(config, backend.clone(), store.clone(), notifier);
    (coordinator, backend, store, notifications)
}

fn pdf() -> PendingAttachment {
    PendingAttachment::new("labs.pdf", "application/pdf", b"%PDF-1.7".to_vec())
}

fn image() -> PendingAttachment {
    named_image("xray.png")
}

fn named_image(name: &str) -> PendingAttachment {
    PendingAttachment::new(name, "image/png", vec![0x89, b'P', b'N', b'G'])
}

fn named_pdf(name: &str) -> PendingAttachment {
    PendingAttachment::new(name, "application/pdf", b"%PDF-1.7".to_vec())
}

#[tokio::test]
async fn empty_submission_does_nothing() {
    let (coordinator, backend, store, mut notifications) =
        setup(FakeBackend::default(), ClientConfig::default());

    let result = coordinator.submit("   \n", Vec::new()).await;

    assert!(matches!(result, Err(ChatError::Validation)));
    assert!(store.is_empty());
    assert!(backend.inferred().is_empty());
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn streams_text_reply_with_fixups() {
    let body = sse(&["Hello", "|", "World 🩺", "###", "Next"]);
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(reads(body, 3))),
        ..Default::default()
    };
    let (coordinator, backend, store, mut notifications) =
        setup(backend, ClientConfig::default());

    let report = coordinator.submit("How are my results?", Vec::new()).await.unwrap();

    let outcome = report.text().unwrap();
    assert_eq!(outcome.state, SubmissionState::Completed);
    assert!(outcome.persisted);
    let expected = "Hello\n\nWorld 🩺\n\n###Next";
    assert_eq!(outcome.content.as_deref(), Some(expected));

    let messages = store.snapshot();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "How are my results?");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, expected);
    assert_eq!(store.in_flight_count(), 0);

    assert_eq!(backend.saved(), vec![(Role::Assistant, expected.to_string())]);
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn delta_policy_appends_verbatim() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["Hel", "lo|", " there"])])),
        ..Default::default()
    };
    let config = ClientConfig::default().with_append_policy(AppendPolicy::DeltaAppend);
    let (coordinator, _backend, _store, _notifications) = setup(backend, config);

    let report = coordinator.submit("hi", Vec::new()).await.unwrap();

    assert_eq!(
        report.text().unwrap().content.as_deref(),
        Some("Hello| there")
    );
}

#[tokio::test]
async fn pdf_extraction_failure_inserts_nothing() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["unused"])])),
        pdf_pages: None,
        ..Default::default()
    };
    let (coordinator, backend, store, mut notifications) =
        setup(backend, ClientConfig::default());

    let report = coordinator
        .submit("Please review", vec![pdf()])
        .await
        .unwrap();

    let outcome = report.text().unwrap();
    assert_eq!(outcome.state, SubmissionState::Failed);
    assert!(matches!(
        outcome.error,
        Some(ChatError::Extraction { ref file, .. }) if file == "labs.pdf"
    ));
    assert!(outcome.user_message.is_none());
    assert!(store.is_empty());
    assert!(backend.inferred().is_empty());

    let notification = notifications.try_recv().unwrap();
    assert!(notification.detail.contains("labs.pdf"));
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn extracted_pages_are_merged_into_the_message() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["Looks normal."])])),
        pdf_pages: Some(vec!["  # CBC  ", "", "WBC 5.1"]),
        ..Default::default()
    };
    let (coordinator, backend, store, _notifications) = setup(backend, ClientConfig::default());

    let report = coordinator.submit("Check this", vec![pdf()]).await.unwrap();

    assert_eq!(report.outcomes.len(), 1);
    let sent = "Check this\n\nLab report analysis:\n\n# CBC\n\n---\n\nWBC 5.1";
    assert_eq!(backend.inferred(), vec![sent.to_string()]);
    assert_eq!(store.snapshot()[0].content, sent);
    assert!(store.snapshot()[0].attachments.is_empty());
}

#[tokio::test]
async fn pages_from_every_pdf_are_joined() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["Reviewed."])])),
        pdf_pages_by_file: vec![
            ("cbc.pdf", vec!["# CBC", "Hb 13.9"]),
            ("lipids.pdf", vec!["LDL 2.4"]),
        ],
        ..Default::default()
    };
    let (coordinator, backend, _store, _notifications) = setup(backend, ClientConfig::default());

    coordinator
        .submit("", vec![named_pdf("cbc.pdf"), named_pdf("lipids.pdf")])
        .await
        .unwrap();

    assert_eq!(
        backend.inferred(),
        vec!["Lab report analysis:\n\n# CBC\n\n---\n\nHb 13.9\n\n---\n\nLDL 2.4".to_string()]
    );
}

#[tokio::test]
async fn pdf_failure_leaves_image_submission_running() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["unused"])])),
        image_stream: Some(Script::Chunks(vec![sse(&["Clear lungs"])])),
        pdf_pages: None,
        ..Default::default()
    };
    let (coordinator, backend, store, mut notifications) =
        setup(backend, ClientConfig::default());

    let report = coordinator
        .submit("Compare these", vec![pdf(), image()])
        .await
        .unwrap();

    assert_eq!(report.text().unwrap().state, SubmissionState::Failed);
    let image = report.images().next().unwrap();
    assert_eq!(image.state, SubmissionState::Completed);
    assert!(backend.inferred().is_empty());

    let messages = store.snapshot();
    assert_eq!(messages.len(), 2);
    assert_eq!(Some(&messages[0].id), image.user_message.as_ref());
    assert_eq!(messages[0].attachments[0].display_name, "xray.png");
    assert_eq!(Some(&messages[1].id), image.placeholder.as_ref());
    assert_eq!(messages[1].content, "Clear lungs");

    assert!(notifications.try_recv().is_ok());
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_images_keep_their_own_content() {
    let backend = FakeBackend {
        image_streams: vec![
            ("chest.png", Script::Chunks(reads(sse(&["Chest", "|", "no effusion"]), 4))),
            ("knee.png", Script::Chunks(reads(sse(&["Knee", "###", "mild wear"]), 4))),
        ],
        ..Default::default()
    };
    let (coordinator, _backend, store, _notifications) = setup(backend, ClientConfig::default());

    let report = coordinator
        .submit("", vec![named_image("chest.png"), named_image("knee.png")])
        .await
        .unwrap();

    assert_eq!(report.completed(), 2);
    let content_of = |name: &str| {
        let outcome = report
            .images()
            .find(|o| o.path == SubmissionPath::Image { name: name.into() })
            .unwrap();
        store
            .get(outcome.placeholder.as_ref().unwrap())
            .unwrap()
            .content
    };
    assert_eq!(content_of("chest.png"), "Chest\n\nno effusion");
    assert_eq!(content_of("knee.png"), "Knee\n\n###mild wear");
}

#[tokio::test]
async fn image_and_text_paths_fail_independently() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["Text answer"])])),
        image_stream: Some(Script::Refuse),
        ..Default::default()
    };
    let (coordinator, backend, store, mut notifications) =
        setup(backend, ClientConfig::default());

    let report = coordinator
        .submit("What is this?", vec![image()])
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.completed(), 1);
    assert_eq!(report.failed(), 1);

    let text = report.text().unwrap();
    let image = report.images().next().unwrap();
    assert_eq!(
        image.path,
        SubmissionPath::Image {
            name: "xray.png".into()
        }
    );
    assert_ne!(text.placeholder, image.placeholder);

    let text_placeholder = text.placeholder.clone().unwrap();
    let image_placeholder = image.placeholder.clone().unwrap();
    assert_eq!(store.get(&text_placeholder).unwrap().content, "Text answer");
    assert!(store.get(&image_placeholder).is_none());

    // Both user messages stay.
    assert!(store.get(text.user_message.as_ref().unwrap()).is_some());
    let image_user = store.get(image.user_message.as_ref().unwrap()).unwrap();
    assert_eq!(image_user.attachments[0].display_name, "xray.png");

    assert_eq!(
        *backend.image_prompts.lock().unwrap(),
        vec!["What is this?".to_string()]
    );
    assert!(notifications.try_recv().is_ok());
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn image_without_text_uses_default_prompt() {
    let backend = FakeBackend {
        image_stream: Some(Script::Chunks(vec![sse(&["Fracture", "|", "None seen"])])),
        ..Default::default()
    };
    let (coordinator, backend, store, _notifications) = setup(backend, ClientConfig::default());

    let report = coordinator.submit("", vec![image()]).await.unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert!(report.text().is_none());
    assert!(backend.inferred().is_empty());
    assert_eq!(
        *backend.image_prompts.lock().unwrap(),
        vec!["Please analyze this medical image.".to_string()]
    );
    let placeholder = report.outcomes[0].placeholder.clone().unwrap();
    assert_eq!(store.get(&placeholder).unwrap().content, "Fracture\n\nNone seen");
}

#[tokio::test]
async fn broken_stream_removes_placeholder() {
    let backend = FakeBackend {
        text_stream: Some(Script::BreakAfter(vec![sse(&["Partial"])])),
        ..Default::default()
    };
    let (coordinator, backend, store, mut notifications) =
        setup(backend, ClientConfig::default());

    let report = coordinator.submit("hello", Vec::new()).await.unwrap();

    let outcome = report.text().unwrap();
    assert_eq!(outcome.state, SubmissionState::Failed);
    assert!(matches!(outcome.error, Some(ChatError::Transport(_))));

    let messages = store.snapshot();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(store.in_flight_count(), 0);
    assert!(backend.saved().is_empty());

    let notification = notifications.try_recv().unwrap();
    assert!(notification.detail.contains("connection reset"));
}

#[tokio::test]
async fn refused_stream_removes_placeholder() {
    let backend = FakeBackend {
        text_stream: Some(Script::Refuse),
        ..Default::default()
    };
    let (coordinator, _backend, store, mut notifications) =
        setup(backend, ClientConfig::default());

    let report = coordinator.submit("hello", Vec::new()).await.unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(store.len(), 1);
    assert!(notifications.try_recv().unwrap().detail.contains("500"));
}

#[tokio::test]
async fn persistence_failure_keeps_local_reply() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["Saved locally"])])),
        fail_persist: true,
        ..Default::default()
    };
    let (coordinator, _backend, store, mut notifications) =
        setup(backend, ClientConfig::default());

    let report = coordinator.submit("hello", Vec::new()).await.unwrap();

    let outcome = report.text().unwrap();
    assert_eq!(outcome.state, SubmissionState::Completed);
    assert!(!outcome.persisted);
    let placeholder = outcome.placeholder.clone().unwrap();
    assert_eq!(store.get(&placeholder).unwrap().content, "Saved locally");
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn unterminated_trailing_event_is_dropped() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![b"data: Kept\n\ndata: Lost".to_vec()])),
        ..Default::default()
    };
    let (coordinator, _backend, _store, _notifications) = setup(backend, ClientConfig::default());

    let report = coordinator.submit("hello", Vec::new()).await.unwrap();

    assert_eq!(report.text().unwrap().content.as_deref(), Some("Kept"));
}

#[tokio::test]
async fn composer_is_emptied_on_submit() {
    let backend = FakeBackend {
        text_stream: Some(Script::Chunks(vec![sse(&["ok"])])),
        ..Default::default()
    };
    let (coordinator, _backend, _store, _notifications) = setup(backend, ClientConfig::default());

    let mut composer = Composer::new();
    assert!(matches!(
        coordinator.submit_composer(&mut composer).await,
        Err(ChatError::Validation)
    ));

    composer.set_text("notes attached");
    composer.attach(PendingAttachment::new(
        "notes.txt",
        "text/plain",
        b"bp 120/80".to_vec(),
    ));
    let report = coordinator.submit_composer(&mut composer).await.unwrap();

    assert_eq!(report.completed(), 1);
    assert!(!composer.is_submittable());
    assert!(composer.attachments().is_empty());
}

#[tokio::test]
async fn loads_history_into_store() {
    let backend = FakeBackend {
        history_json: Some(
            r#"[
                {"id":"a","content":{"text":"My labs"},"role":"user","created_at":"2024-05-01T10:00:00"},
                {"id":"b","content":"All normal.","role":"assistant","created_at":"2024-05-01T10:00:05Z"}
            ]"#,
        ),
        ..Default::default()
    };
    let (coordinator, _backend, store, _notifications) = setup(backend, ClientConfig::default());

    assert_eq!(coordinator.load_history().await.unwrap(), 2);

    let messages = store.snapshot();
    assert_eq!(messages[0].content, "My labs");
    assert_eq!(messages[1].role, Role::Assistant);
}

#[tokio::test]
async fn missing_history_is_empty() {
    let (coordinator, _backend, store, mut notifications) =
        setup(FakeBackend::default(), ClientConfig::default());

    assert_eq!(coordinator.load_history().await.unwrap(), 0);
    assert!(store.is_empty());
    assert!(notifications.try_recv().is_err());
}
