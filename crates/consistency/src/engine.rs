//! Full analysis and quick check.  Neither touches story state: both read
//! snapshots, ask the generator, and parse its JSON verdict.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use narrative_config::ConsistencyConfig;
use narrative_core::{Chapter, Character, NarrativeError, Plotline, Result, StoryBible, StorySnapshot};
use narrative_llm::{GenerationRequest, TextGenerator, WritingMode, extract_json_output};

use crate::report::{ConsistencyIssue, ConsistencyReport, IssueType, Severity};

/// How many earlier chapters feed the "previous events" block.
const PREVIOUS_CHAPTER_WINDOW: usize = 5;

const FULL_SYSTEM_PROMPT: &str = "You are an expert continuity editor. Identify \
inconsistencies, contradictions and violations of established rules in the narrative. \
Respond with JSON only.";

const QUICK_SYSTEM_PROMPT: &str = "You are a fast continuity checker. Flag only clear \
problems. Respond with JSON only.";

const FULL_RESPONSE_SHAPE: &str = r#"{
  "summary": "one or two sentences",
  "issues": [
    {"type": "character_behavior|timeline|world_rule|point_of_view|tone_drift",
     "severity": "low|medium|high|critical",
     "description": "what is wrong",
     "location": "quote or position in the content",
     "suggestion": "how to fix it"}
  ],
  "recommendations": ["..."]
}"#;

const QUICK_RESPONSE_SHAPE: &str = r#"{
  "issues": [
    {"type": "character_behavior|tone_drift", "severity": "low|medium|high|critical", "description": "what is wrong"}
  ]
}"#;

#[derive(Debug, Default, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    issues: Vec<RawIssue>,
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    #[serde(rename = "type", default)]
    issue_type: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    suggestion: Option<String>,
}

impl RawIssue {
    fn into_issue(self) -> Option<ConsistencyIssue> {
        let Some(issue_type) = IssueType::from_label(&self.issue_type) else {
            debug!(label = %self.issue_type, "dropping issue outside the taxonomy");
            return None;
        };
        if self.description.trim().is_empty() {
            return None;
        }
        Some(ConsistencyIssue {
            issue_type,
            severity: Severity::from_label(&self.severity),
            description: self.description.trim().to_string(),
            location: non_blank(self.location),
            suggestion: non_blank(self.suggestion),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Snapshot of the story's structured knowledge handed to the analyzer.
pub struct AnalysisInputs<'a> {
    pub content: &'a str,
    pub story: &'a StorySnapshot,
    pub characters: &'a [Character],
    pub plotlines: &'a [Plotline],
    pub story_bible: Option<&'a StoryBible>,
    pub previous_chapters: &'a [Chapter],
    pub current_chapter: Option<&'a Chapter>,
}

#[derive(Clone)]
pub struct ConsistencyEngine {
    generator: Arc<dyn TextGenerator>,
    config: ConsistencyConfig,
}

impl ConsistencyEngine {
    pub fn new(generator: Arc<dyn TextGenerator>, config: ConsistencyConfig) -> Self {
        Self { generator, config }
    }

    /// Full analysis across all five categories.
    #[instrument(skip_all, fields(story_id = %inputs.story.id, chars = inputs.content.len()))]
    pub async fn analyze(&self, inputs: &AnalysisInputs<'_>) -> Result<ConsistencyReport> {
        let request = GenerationRequest::new(
            build_full_prompt(inputs),
            FULL_SYSTEM_PROMPT,
            WritingMode::UserLead,
        )
        .with_max_tokens(self.config.full_max_tokens);

        let budget = Duration::from_secs(self.config.full_timeout_secs);
        let reply = self.ask(&request, budget).await?;
        let verdict: RawVerdict = extract_json_output(&reply).ok_or_else(|| {
            NarrativeError::MalformedBackendResponse("consistency verdict was not JSON".to_string())
        })?;

        let issues: Vec<ConsistencyIssue> =
            verdict.issues.into_iter().filter_map(RawIssue::into_issue).collect();
        let summary = verdict
            .summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| default_summary(issues.len()));
        let report = ConsistencyReport::new(summary, issues, verdict.recommendations);

        info!(
            issues = report.issues().len(),
            score = report.overall_score(),
            critical = report.has_critical_issues(),
            "consistency analysis complete"
        );
        Ok(report)
    }

    /// Reduced-context pass for live editor feedback.  Never fails: a slow or
    /// broken backend yields no issues.  Suggestions are omitted.
    #[instrument(skip_all, fields(story_id = %story.id, chars = content.len()))]
    pub async fn quick_check(
        &self,
        content: &str,
        characters: &[Character],
        story: &StorySnapshot,
    ) -> Vec<ConsistencyIssue> {
        let request = GenerationRequest::new(
            build_quick_prompt(content, characters, story),
            QUICK_SYSTEM_PROMPT,
            WritingMode::UserLead,
        )
        .with_max_tokens(self.config.quick_max_tokens);

        let budget = Duration::from_secs(self.config.quick_timeout_secs);
        let reply = match self.ask(&request, budget).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "quick check unavailable");
                return Vec::new();
            }
        };
        let Some(verdict) = extract_json_output::<RawVerdict>(&reply) else {
            warn!("quick check reply was not JSON");
            return Vec::new();
        };

        let mut issues: Vec<ConsistencyIssue> = verdict
            .issues
            .into_iter()
            .filter_map(RawIssue::into_issue)
            .map(|mut issue| {
                issue.suggestion = None;
                issue
            })
            .collect();
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        debug!(issues = issues.len(), "quick check complete");
        issues
    }

    async fn ask(&self, request: &GenerationRequest, budget: Duration) -> Result<String> {
        let result = tokio::time::timeout(budget, self.generator.generate(request))
            .await
            .map_err(|_| {
                NarrativeError::BackendUnavailable(format!(
                    "consistency check exceeded {}s",
                    budget.as_secs()
                ))
            })?;
        if !result.success {
            return Err(NarrativeError::BackendUnavailable(
                result.error.unwrap_or_else(|| "generation failed".to_string()),
            ));
        }
        Ok(result.content)
    }
}

fn default_summary(issue_count: usize) -> String {
    match issue_count {
        0 => "No consistency issues found.".to_string(),
        1 => "1 consistency issue found.".to_string(),
        n => format!("{n} consistency issues found."),
    }
}

fn build_full_prompt(inputs: &AnalysisInputs<'_>) -> String {
    let characters = if inputs.characters.is_empty() {
        "(none)".to_string()
    } else {
        inputs
            .characters
            .iter()
            .map(Character::profile_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let world_rules = match inputs.story_bible {
        Some(bible) if !bible.world_rules.is_empty() => {
            let mut rules: Vec<_> = bible.world_rules.iter().collect();
            rules.sort_by(|a, b| b.importance.cmp(&a.importance).then_with(|| a.title.cmp(&b.title)));
            rules
                .iter()
                .map(|r| format!("- ({}) {}: {}", r.category, r.title, r.description))
                .collect::<Vec<_>>()
                .join("\n")
        }
        _ => "(none)".to_string(),
    };

    let unresolved: Vec<String> = inputs
        .plotlines
        .iter()
        .filter(|p| p.status.is_active())
        .map(|p| format!("- {} [{}]: {}", p.title, p.status.slug(), p.description))
        .collect();
    let unresolved = if unresolved.is_empty() {
        "(none)".to_string()
    } else {
        unresolved.join("\n")
    };

    let previous_events = previous_events(inputs.previous_chapters, inputs.current_chapter);

    let mut position = String::new();
    if let Some(chapter) = inputs.current_chapter {
        position = format!("\n\nCURRENT CHAPTER: {} - {}", chapter.number, chapter.title);
        if let Some(pov) = chapter
            .pov_character_id
            .and_then(|id| inputs.characters.iter().find(|c| c.id == id))
        {
            position.push_str(&format!("\nPOINT OF VIEW: {}", pov.name));
        }
    }

    format!(
        "Analyze this content for consistency issues.\n\n\
         STORY: {title} ({genre}, {tone}){position}\n\n\
         CONTENT TO ANALYZE:\n{content}\n\n\
         ESTABLISHED CHARACTERS:\n{characters}\n\n\
         WORLD RULES:\n{world_rules}\n\n\
         UNRESOLVED PLOTLINES:\n{unresolved}\n\n\
         PREVIOUS EVENTS:\n{previous_events}\n\n\
         Check for:\n\
         1. Character behavior inconsistencies\n\
         2. Timeline contradictions\n\
         3. World rule violations\n\
         4. Point-of-view inconsistencies\n\
         5. Tone drift from a {tone} tone\n\n\
         Answer with a JSON object of this shape:\n{shape}",
        title = inputs.story.title,
        genre = inputs.story.genre,
        tone = inputs.story.tone,
        content = inputs.content,
        shape = FULL_RESPONSE_SHAPE,
    )
}

/// Summaries (or key events) of the chapters just before the current one.
fn previous_events(chapters: &[Chapter], current: Option<&Chapter>) -> String {
    let mut earlier: Vec<&Chapter> = chapters
        .iter()
        .filter(|c| match current {
            Some(cur) => c.id != cur.id && c.number < cur.number,
            None => true,
        })
        .collect();
    earlier.sort_by_key(|c| c.number);
    let start = earlier.len().saturating_sub(PREVIOUS_CHAPTER_WINDOW);

    let lines: Vec<String> = earlier[start..]
        .iter()
        .filter_map(|c| {
            let gist = match (&c.summary, c.key_events.is_empty()) {
                (Some(summary), _) if !summary.trim().is_empty() => summary.trim().to_string(),
                (_, false) => c.key_events.join("; "),
                _ => return None,
            };
            Some(format!("Chapter {} ({}): {gist}", c.number, c.title))
        })
        .collect();

    if lines.is_empty() {
        "(none recorded)".to_string()
    } else {
        lines.join("\n")
    }
}

fn build_quick_prompt(content: &str, characters: &[Character], story: &StorySnapshot) -> String {
    let cast = if characters.is_empty() {
        "(none)".to_string()
    } else {
        characters
            .iter()
            .map(|c| {
                let traits = if c.personality_traits.is_empty() {
                    String::new()
                } else {
                    format!(" - {}", c.personality_traits.join(", "))
                };
                format!("- {} ({}){traits}", c.name, c.role.label())
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Quickly check this passage from \"{title}\" ({genre}, {tone} tone) for characters \
         acting against their nature and for tone drift.\n\n\
         CHARACTERS:\n{cast}\n\n\
         PASSAGE:\n{content}\n\n\
         Answer with a JSON object of this shape (empty list if nothing is wrong):\n{shape}",
        title = story.title,
        genre = story.genre,
        tone = story.tone,
        shape = QUICK_RESPONSE_SHAPE,
    )
}
