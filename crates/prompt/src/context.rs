//! Provenance tagging of retrieved context and the knowledge blocks shared
//! by several prompt builders.

use narrative_core::{Character, Plotline, StoryBible};
use narrative_memory::{AggregatedContext, RetrievedContext};

/// Tag every hit with where it came from.  Chapters first, then characters,
/// then bible entries, each in retrieval order.
pub fn tag_retrieved(context: &AggregatedContext) -> Vec<String> {
    let chapters = context.chapters.iter().map(|hit| format!("[Previous Scene] {}", hit.text));
    let characters = context.characters.iter().map(|hit| {
        format!("[{} Info] {}", meta_or(hit, "character_name", "Character"), hit.text)
    });
    let bible = context.bible.iter().map(|hit| {
        format!("[{}] {}", meta_or(hit, "type", "World").to_uppercase(), hit.text)
    });
    chapters.chain(characters).chain(bible).collect()
}

fn meta_or<'a>(hit: &'a RetrievedContext, key: &str, fallback: &'a str) -> &'a str {
    hit.metadata
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(fallback)
}

/// The last `max_chars` characters of `text`, split on a char boundary.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub(crate) fn characters_block(characters: &[Character]) -> String {
    if characters.is_empty() {
        return "(no characters defined)".to_string();
    }
    characters
        .iter()
        .map(Character::profile_text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Plotlines still in play, most important first.  Evaluated on every call.
pub(crate) fn active_plotlines_block(plotlines: &[Plotline]) -> String {
    let mut active: Vec<&Plotline> = plotlines.iter().filter(|p| p.status.is_active()).collect();
    active.sort_by(|a, b| b.importance.cmp(&a.importance).then_with(|| a.title.cmp(&b.title)));
    if active.is_empty() {
        return "(no active plotlines)".to_string();
    }
    active
        .iter()
        .map(|p| format!("- {} [{}]: {}", p.title, p.status.slug(), p.description))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn bible_block(bible: Option<&StoryBible>) -> String {
    let Some(bible) = bible else {
        return "(no story bible)".to_string();
    };
    let mut lines = Vec::new();
    if let Some(name) = &bible.world_name {
        lines.push(format!("World: {name}"));
    }
    if let Some(description) = &bible.world_description {
        lines.push(format!("Setting: {description}"));
    }
    if let Some(magic) = &bible.magic_system {
        lines.push(format!("Magic system: {magic}"));
    }
    if let Some(tech) = &bible.technology_level {
        lines.push(format!("Technology: {tech}"));
    }
    if !bible.central_themes.is_empty() {
        lines.push(format!("Themes: {}", bible.central_themes.join(", ")));
    }
    if let Some(tone) = &bible.tone_guidelines {
        lines.push(format!("Tone: {tone}"));
    }
    let mut rules: Vec<_> = bible.world_rules.iter().collect();
    rules.sort_by(|a, b| b.importance.cmp(&a.importance).then_with(|| a.title.cmp(&b.title)));
    for rule in rules {
        lines.push(format!("Rule ({}): {} - {}", rule.category, rule.title, rule.description));
    }
    for fact in &bible.quick_facts {
        lines.push(format!("Fact: {fact}"));
    }
    if lines.is_empty() {
        return "(story bible is empty)".to_string();
    }
    lines.join("\n")
}
