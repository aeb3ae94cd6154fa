use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{Chapter, Character, Plotline, StorySnapshot, WORDS_PER_MINUTE};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryStats {
    pub story_title: String,
    pub genre: String,
    pub tone: String,
    pub total_words: usize,
    pub chapter_count: usize,
    pub average_chapter_length: usize,
    pub character_count: usize,
    /// Character name → number of chapters the character appears in.
    pub character_appearances: BTreeMap<String, usize>,
    /// Plotline status slug → count.
    pub plotline_status: BTreeMap<String, usize>,
    pub estimated_reading_time_minutes: usize,
}

pub fn story_stats(
    story: &StorySnapshot,
    chapters: &[Chapter],
    characters: &[Character],
    plotlines: &[Plotline],
) -> StoryStats {
    let total_words: usize = chapters.iter().map(|c| c.word_count).sum();
    let average_chapter_length = if chapters.is_empty() {
        0
    } else {
        (total_words as f64 / chapters.len() as f64).round() as usize
    };

    let character_appearances = characters
        .iter()
        .map(|c| (c.name.clone(), c.chapter_appearances.len()))
        .collect();

    let mut plotline_status = BTreeMap::new();
    for plot in plotlines {
        *plotline_status.entry(plot.status.slug().to_string()).or_insert(0) += 1;
    }

    StoryStats {
        story_title: story.title.clone(),
        genre: story.genre.clone(),
        tone: story.tone.clone(),
        total_words,
        chapter_count: chapters.len(),
        average_chapter_length,
        character_count: characters.len(),
        character_appearances,
        plotline_status,
        estimated_reading_time_minutes: total_words / WORDS_PER_MINUTE,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::model::{CharacterRole, PlotlineStatus};

    #[test]
    fn aggregates_words_and_statuses() {
        let story_id = Uuid::new_v4();
        let story = StorySnapshot {
            id: story_id,
            title: "Ash".to_string(),
            genre: "fantasy".to_string(),
            tone: "grim".to_string(),
            target_word_count: None,
            synopsis: None,
            style_guide: None,
        };
        let chapter = |words: usize| Chapter {
            id: Uuid::new_v4(),
            story_id,
            title: String::new(),
            number: 1,
            content: String::new(),
            summary: None,
            pov_character_id: None,
            key_events: Vec::new(),
            word_count: words,
            reading_time_minutes: 0,
            updated_at: Utc::now(),
        };
        let plot = |status| Plotline {
            id: Uuid::new_v4(),
            story_id,
            title: String::new(),
            description: String::new(),
            status,
            importance: 5,
        };
        let hero = Character {
            id: Uuid::new_v4(),
            story_id,
            name: "Ren".to_string(),
            role: CharacterRole::Protagonist,
            description: String::new(),
            personality_traits: Vec::new(),
            backstory: None,
            speech_pattern: None,
            goals: Vec::new(),
            current_state: None,
            chapter_appearances: vec![Uuid::new_v4(), Uuid::new_v4()],
        };

        let stats = story_stats(
            &story,
            &[chapter(300), chapter(201)],
            &[hero],
            &[
                plot(PlotlineStatus::Developing),
                plot(PlotlineStatus::Developing),
                plot(PlotlineStatus::Resolved),
            ],
        );

        assert_eq!(stats.total_words, 501);
        assert_eq!(stats.average_chapter_length, 251);
        assert_eq!(stats.estimated_reading_time_minutes, 2);
        assert_eq!(stats.character_appearances.get("Ren"), Some(&2));
        assert_eq!(stats.plotline_status.get("developing"), Some(&2));
        assert_eq!(stats.plotline_status.get("resolved"), Some(&1));
    }
}
