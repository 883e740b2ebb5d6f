use std::fmt;
use std::str::FromStr;

/// Payload that starts a new markdown section.
pub const SECTION_BREAK: &str = "###";
/// Trailing delimiter the model uses in place of a paragraph break.
pub const INLINE_BREAK: char = '|';

const PARAGRAPH_BREAK: &str = "\n\n";

/// How payloads are folded into the response buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AppendPolicy {
    /// Verbatim additive appends. Used by the legacy flat endpoints.
    DeltaAppend,
    /// Break-marker fixups; observers receive the whole accumulated text after every payload.
    #[default]
    FullReplaceWithFixup,
}

impl AppendPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AppendPolicy::DeltaAppend => "delta",
            AppendPolicy::FullReplaceWithFixup => "fixup",
        }
    }
}

impl fmt::Display for AppendPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppendPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delta" | "delta-append" => Ok(AppendPolicy::DeltaAppend),
            "fixup" | "full-replace" => Ok(AppendPolicy::FullReplaceWithFixup),
            other => Err(format!("unknown append policy '{other}' (expected 'delta' or 'fixup')")),
        }
    }
}

/// What a message store should do with the placeholder content after one payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentUpdate<'a> {
    Append(&'a str),
    Replace(&'a str),
}

#[derive(Debug)]
pub struct Reassembler {
    policy: AppendPolicy,
    buffer: String,
    payloads: usize,
}

impl Reassembler {
    pub fn new(policy: AppendPolicy) -> Self {
        Self {
            policy,
            buffer: String::new(),
            payloads: 0,
        }
    }

    pub fn policy(&self) -> AppendPolicy {
        self.policy
    }

    pub fn push(&mut self, payload: &str) -> ContentUpdate<'_> {
        self.payloads += 1;
        match self.policy {
            AppendPolicy::DeltaAppend => {
                let start = self.buffer.len();
                self.buffer.push_str(payload);
                ContentUpdate::Append(&self.buffer[start..])
            }
            AppendPolicy::FullReplaceWithFixup => {
                if payload == SECTION_BREAK && !self.buffer.is_empty() {
                    self.buffer.push_str(PARAGRAPH_BREAK);
                    self.buffer.push_str(payload);
                } else if let Some(body) = payload.strip_suffix(INLINE_BREAK) {
                    self.buffer.push_str(body);
                    self.buffer.push_str(PARAGRAPH_BREAK);
                } else {
                    self.buffer.push_str(payload);
                }
                ContentUpdate::Replace(&self.buffer)
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.buffer
    }

    pub fn payload_count(&self) -> usize {
        self.payloads
    }

    pub fn into_content(self) -> String {
        self.buffer
    }
}
