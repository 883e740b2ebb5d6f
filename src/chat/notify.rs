use tokio::sync::mpsc;

/// Failure report for the user. Failures go here, never into conversation content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub detail: String,
}

impl Notification {
    pub fn error(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("notification dropped: receiver closed");
        }
    }
}
