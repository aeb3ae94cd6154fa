use serde::{Deserialize, Serialize};

use narrative_llm::StreamEvent;

/// One unit pushed to a streaming caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFrame {
    Token(String),
    Done,
    Error(String),
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }

    /// Server-Sent Events encoding.  Each line of a multi-line fragment gets
    /// its own `data:` field so the client can rejoin them with `\n`.
    pub fn to_sse(&self) -> String {
        match self {
            Self::Token(text) => data_event(text),
            Self::Done => "data: [DONE]\n\n".to_string(),
            Self::Error(message) => data_event(&format!("[ERROR] {message}")),
        }
    }
}

fn data_event(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

impl From<StreamEvent> for StreamFrame {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Token(text) => Self::Token(text),
            StreamEvent::Done => Self::Done,
            StreamEvent::Error(message) => Self::Error(message),
        }
    }
}
