use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::stream::ContentUpdate;
use crate::types::{Message, MessageId};

const EVENT_CAPACITY: usize = 256;

/// Change notifications for observers (the UI).
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    Inserted(Message),
    /// Carries the whole current content, never a delta.
    ContentChanged { id: MessageId, content: String },
    Removed(MessageId),
    Reset,
}

#[derive(Default)]
struct StoreInner {
    messages: Vec<Message>,
    in_flight: HashSet<MessageId>,
}

/// Ordered message collection for one conversation.
///
/// Insertion order is display order. Only messages marked in-flight accept content
/// updates, and each in-flight id is owned by exactly one submission.
#[derive(Clone)]
pub struct MessageStore {
    chat_id: Arc<str>,
    inner: Arc<Mutex<StoreInner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MessageStore {
    pub fn new(chat_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            chat_id: Arc::from(chat_id.into()),
            inner: Arc::new(Mutex::new(StoreInner::default())),
            events,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn insert(&self, message: Message) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            if inner.messages.iter().any(|m| m.id == message.id) {
                return Err(StoreError::Duplicate(message.id));
            }
            inner.messages.push(message.clone());
        }
        self.emit(StoreEvent::Inserted(message));
        Ok(())
    }

    /// Marks a message as receiving a stream.
    pub fn begin_stream(&self, id: &MessageId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.messages.iter().any(|m| &m.id == id) {
            return Err(StoreError::NotFound(id.clone()));
        }
        if !inner.in_flight.insert(id.clone()) {
            return Err(StoreError::AlreadyInFlight(id.clone()));
        }
        Ok(())
    }

    pub fn end_stream(&self, id: &MessageId) {
        self.lock().in_flight.remove(id);
    }

    pub fn is_in_flight(&self, id: &MessageId) -> bool {
        self.lock().in_flight.contains(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn apply(&self, id: &MessageId, update: ContentUpdate<'_>) -> Result<(), StoreError> {
        let content = {
            let mut inner = self.lock();
            if !inner.in_flight.contains(id) {
                return Err(StoreError::NotInFlight(id.clone()));
            }
            let message = inner
                .messages
                .iter_mut()
                .find(|m| &m.id == id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            match update {
                ContentUpdate::Append(delta) => message.content.push_str(delta),
                ContentUpdate::Replace(full) => {
                    message.content.clear();
                    message.content.push_str(full);
                }
            }
            message.content.clone()
        };
        self.emit(StoreEvent::ContentChanged {
            id: id.clone(),
            content,
        });
        Ok(())
    }

    pub fn remove(&self, id: &MessageId) -> Option<Message> {
        let removed = {
            let mut inner = self.lock();
            inner.in_flight.remove(id);
            let index = inner.messages.iter().position(|m| &m.id == id)?;
            inner.messages.remove(index)
        };
        self.emit(StoreEvent::Removed(id.clone()));
        Some(removed)
    }

    /// Replaces the conversation, e.g. after loading history.
    ///
    /// Messages still receiving a stream are kept, after the new messages.
    pub fn replace_all(&self, messages: Vec<Message>) {
        {
            let mut inner = self.lock();
            let StoreInner {
                messages: current,
                in_flight,
            } = &mut *inner;
            let streaming: Vec<Message> = current
                .drain(..)
                .filter(|m| in_flight.contains(&m.id))
                .collect();
            current.extend(messages);
            current.extend(streaming);
        }
        self.emit(StoreEvent::Reset);
    }

    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.lock().messages.iter().find(|m| &m.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
