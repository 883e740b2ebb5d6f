use crate::types::PendingAttachment;

/// Draft input: text plus files waiting to be sent.
#[derive(Debug, Default)]
pub struct Composer {
    text: String,
    attachments: Vec<PendingAttachment>,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attach(&mut self, attachment: PendingAttachment) {
        self.attachments.push(attachment);
    }

    pub fn remove_attachment(&mut self, index: usize) -> Option<PendingAttachment> {
        (index < self.attachments.len()).then(|| self.attachments.remove(index))
    }

    pub fn attachments(&self) -> &[PendingAttachment] {
        &self.attachments
    }

    pub fn is_submittable(&self) -> bool {
        !self.text.trim().is_empty() || !self.attachments.is_empty()
    }

    /// Empties the composer, handing its contents to a submission.
    pub fn take(&mut self) -> (String, Vec<PendingAttachment>) {
        (
            std::mem::take(&mut self.text),
            std::mem::take(&mut self.attachments),
        )
    }
}
