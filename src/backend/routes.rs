use std::fmt;
use std::str::FromStr;

use crate::stream::AppendPolicy;

/// Which of the two streaming endpoints produced a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEndpoint {
    Inference,
    ImageAnalysis,
}

/// The backend contract a deployment speaks.
///
/// `Scoped` puts the chat id in every path and tags bodies with a role. `Flat` is the older
/// deployment with an unscoped inference endpoint and no PDF or image routes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RouteSet {
    #[default]
    Scoped,
    Flat,
}

fn segments(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

impl RouteSet {
    pub fn name(self) -> &'static str {
        match self {
            RouteSet::Scoped => "scoped",
            RouteSet::Flat => "flat",
        }
    }

    pub fn add_message(self, chat_id: &str) -> Vec<String> {
        match self {
            RouteSet::Scoped => segments(&["chat", chat_id, "add_message"]),
            RouteSet::Flat => segments(&["chat", chat_id, "message", ""]),
        }
    }

    pub fn infer(self, chat_id: &str) -> Vec<String> {
        match self {
            RouteSet::Scoped => segments(&["chat", chat_id, "infer"]),
            RouteSet::Flat => segments(&["chat", "infer", ""]),
        }
    }

    pub fn get_messages(self, chat_id: &str) -> Vec<String> {
        match self {
            RouteSet::Scoped => segments(&["chat", chat_id, "get_messages"]),
            RouteSet::Flat => segments(&["chat", chat_id, "messages", ""]),
        }
    }

    pub fn parse_pdf(self) -> Option<Vec<String>> {
        match self {
            RouteSet::Scoped => Some(segments(&["chat", "parse-pdf"])),
            RouteSet::Flat => None,
        }
    }

    pub fn infer_image(self, chat_id: &str) -> Option<Vec<String>> {
        match self {
            RouteSet::Scoped => Some(segments(&["images", chat_id, "infer", "image"])),
            RouteSet::Flat => None,
        }
    }

    /// Whether the client saves the finished assistant reply itself.
    ///
    /// The flat inference endpoint stores both turns server-side.
    pub fn persists_reply(self) -> bool {
        match self {
            RouteSet::Scoped => true,
            RouteSet::Flat => false,
        }
    }

    pub fn default_policy(self, endpoint: StreamEndpoint) -> AppendPolicy {
        match (self, endpoint) {
            (_, StreamEndpoint::ImageAnalysis) => AppendPolicy::FullReplaceWithFixup,
            (RouteSet::Scoped, StreamEndpoint::Inference) => AppendPolicy::FullReplaceWithFixup,
            (RouteSet::Flat, StreamEndpoint::Inference) => AppendPolicy::DeltaAppend,
        }
    }
}

impl fmt::Display for RouteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RouteSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scoped" => Ok(RouteSet::Scoped),
            "flat" | "legacy" => Ok(RouteSet::Flat),
            other => Err(format!("unknown route set '{other}' (expected 'scoped' or 'flat')")),
        }
    }
}
