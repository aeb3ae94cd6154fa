use serde::{Deserialize, Serialize};
use tracing::warn;

/// How much creative latitude the generator gets.
///
/// | Mode        | temperature | top_p | top_k | intent                         |
/// |-------------|-------------|-------|-------|--------------------------------|
/// | `AiLead`    | 0.95        | 0.95  | 40    | maximal creative deviation     |
/// | `UserLead`  | 0.30        | 0.80  | 20    | conservative, match the author |
/// | `CoAuthor`  | 0.70        | 0.90  | 30    | balanced                       |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum WritingMode {
    AiLead,
    UserLead,
    #[default]
    CoAuthor,
}

impl WritingMode {
    pub const ALL: [WritingMode; 3] = [Self::AiLead, Self::UserLead, Self::CoAuthor];

    pub fn slug(self) -> &'static str {
        match self {
            Self::AiLead => "ai_lead",
            Self::UserLead => "user_lead",
            Self::CoAuthor => "co_author",
        }
    }

    /// Parse a mode label.  Unknown labels fail closed to [`WritingMode::CoAuthor`].
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ai_lead" | "ailead" => Self::AiLead,
            "user_lead" | "userlead" => Self::UserLead,
            "co_author" | "coauthor" => Self::CoAuthor,
            other => {
                warn!(mode = other, "unknown writing mode; using co_author");
                Self::CoAuthor
            }
        }
    }

    pub fn sampling_profile(self) -> SamplingProfile {
        match self {
            Self::AiLead => SamplingProfile {
                temperature: 0.95,
                top_p: 0.95,
                top_k: 40,
            },
            Self::UserLead => SamplingProfile {
                temperature: 0.30,
                top_p: 0.80,
                top_k: 20,
            },
            Self::CoAuthor => SamplingProfile {
                temperature: 0.70,
                top_p: 0.90,
                top_k: 30,
            },
        }
    }
}

impl From<String> for WritingMode {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingProfile {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl SamplingProfile {
    /// An explicit temperature always wins over the mode default.
    pub fn with_temperature(self, temperature: Option<f32>) -> Self {
        match temperature {
            Some(temperature) => Self {
                temperature,
                ..self
            },
            None => self,
        }
    }
}
