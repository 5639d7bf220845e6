use crate::types::{AdventureId, ClientId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of chapters in an adventure.
pub const DEFAULT_STORY_LENGTH: u32 = 10;

/// Shortest plannable adventure: opening STORY, one middle slot, the
/// penultimate STORY, and the CONCLUSION.
pub const MIN_STORY_LENGTH: u32 = 4;

/// Fallback protagonist used when a loaded record lost its description.
pub const FALLBACK_PROTAGONIST: &str =
    "a curious young adventurer with bright eyes, tousled hair, and a well-worn travel cloak";

/// Fallback recap text recorded when background summarization fails.
pub const SUMMARY_UNAVAILABLE: &str = "Chapter summary not available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChapterType {
    /// Narrative chapter ending in three user-selectable paths.
    Story,
    /// Chapter carrying a single educational question; its answers are the
    /// only choices.
    Lesson,
    /// Narrative challenge probing the preceding lesson; always follows a
    /// LESSON and is always followed by a STORY.
    Reflect,
    /// Final chapter; narrative only, no choices, no response.
    Conclusion,
}

impl std::fmt::Display for ChapterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChapterType::Story => "STORY",
            ChapterType::Lesson => "LESSON",
            ChapterType::Reflect => "REFLECT",
            ChapterType::Conclusion => "CONCLUSION",
        };
        f.write_str(s)
    }
}

/// Coarse position label derived from chapter index, used to shape prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorytellingPhase {
    Exposition,
    Rising,
    Trials,
    Climax,
    Return,
}

impl StorytellingPhase {
    /// Phase of chapter `number` (1-based) in an adventure of `total` chapters.
    pub fn for_chapter(number: u32, total: u32) -> Self {
        if number <= 1 {
            StorytellingPhase::Exposition
        } else if number >= total {
            StorytellingPhase::Return
        } else {
            let fraction = f64::from(number) / f64::from(total.max(1));
            if fraction <= 0.4 {
                StorytellingPhase::Rising
            } else if fraction <= 0.75 {
                StorytellingPhase::Trials
            } else {
                StorytellingPhase::Climax
            }
        }
    }
}

/// One selectable narrative path out of a STORY or REFLECT chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryChoice {
    pub id: String,
    pub text: String,
}

/// An educational question bound to a LESSON chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonQuestion {
    pub topic: String,
    pub question: String,
    pub answers: Vec<String>,
    pub correct_index: usize,
    pub explanation: String,
}

/// Recap artifact: a question as the user answered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    pub question: String,
    pub chosen_answer: String,
    pub was_correct: bool,
    pub explanation: String,
}

/// The user's recorded reaction to a chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChapterResponse {
    Narrative { chosen_path: String, choice_text: String },
    Lesson { answer_index: usize, is_correct: bool },
}

/// A user-chosen power, companion, role, or artifact fixed at Chapter 1 and
/// referenced throughout the adventure. `category` and `name` are never
/// overwritten once set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    pub category: String,
    pub name: String,
    pub visual_details: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdventureMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<Agency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub chapter_number: u32,
    pub chapter_type: ChapterType,
    pub content: String,
    #[serde(default)]
    pub choices: Vec<StoryChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<LessonQuestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ChapterResponse>,
}

impl Chapter {
    /// STORY or REFLECT chapter with its three narrative choices.
    pub fn narrative(
        number: u32,
        chapter_type: ChapterType,
        content: impl Into<String>,
        choices: Vec<StoryChoice>,
    ) -> Self {
        debug_assert!(matches!(chapter_type, ChapterType::Story | ChapterType::Reflect));
        Self {
            chapter_number: number,
            chapter_type,
            content: content.into(),
            choices,
            question: None,
            response: None,
        }
    }

    /// LESSON chapter; the question's answers become the choice set.
    pub fn lesson(number: u32, content: impl Into<String>, question: LessonQuestion) -> Self {
        let choices = question
            .answers
            .iter()
            .enumerate()
            .map(|(i, answer)| StoryChoice { id: i.to_string(), text: answer.clone() })
            .collect();
        Self {
            chapter_number: number,
            chapter_type: ChapterType::Lesson,
            content: content.into(),
            choices,
            question: Some(question),
            response: None,
        }
    }

    /// Terminal CONCLUSION chapter: no choices, no response.
    pub fn conclusion(number: u32, content: impl Into<String>) -> Self {
        Self {
            chapter_number: number,
            chapter_type: ChapterType::Conclusion,
            content: content.into(),
            choices: Vec::new(),
            question: None,
            response: None,
        }
    }
}

/// The single authoritative record of one adventure session.
///
/// Mutated exclusively by the owning session engine; background tasks feed
/// changes through the engine's serialized update channel rather than
/// touching this struct directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdventureState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adventure_id: Option<AdventureId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uuid: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub story_category: String,
    pub lesson_topic: String,
    pub story_length: u32,
    pub planned_chapter_types: Vec<ChapterType>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    pub protagonist_description: String,
    #[serde(default)]
    pub character_visuals: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: AdventureMetadata,
    #[serde(default)]
    pub chapter_summaries: Vec<String>,
    #[serde(default)]
    pub summary_chapter_titles: Vec<String>,
    #[serde(default)]
    pub lesson_questions: Vec<AnsweredQuestion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdventureState {
    pub fn new(
        story_category: impl Into<String>,
        lesson_topic: impl Into<String>,
        planned_chapter_types: Vec<ChapterType>,
        protagonist_description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let story_length = planned_chapter_types.len() as u32;
        Self {
            adventure_id: None,
            client_uuid: None,
            user_id: None,
            story_category: story_category.into(),
            lesson_topic: lesson_topic.into(),
            story_length,
            planned_chapter_types,
            chapters: Vec::new(),
            protagonist_description: protagonist_description.into(),
            character_visuals: BTreeMap::new(),
            metadata: AdventureMetadata::default(),
            chapter_summaries: Vec::new(),
            summary_chapter_titles: Vec::new(),
            lesson_questions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 1-based number of the next chapter to generate.
    pub fn next_chapter_number(&self) -> u32 {
        self.chapters.len() as u32 + 1
    }

    /// Planned type of the next chapter, if any remain.
    pub fn next_chapter_type(&self) -> Option<ChapterType> {
        self.planned_chapter_types.get(self.chapters.len()).copied()
    }

    /// Phase of the chapter currently being generated (or the last one, once
    /// the plan is exhausted).
    pub fn current_storytelling_phase(&self) -> StorytellingPhase {
        let number = self.next_chapter_number().min(self.story_length.max(1));
        StorytellingPhase::for_chapter(number, self.story_length.max(1))
    }

    /// Append the next chapter, enforcing numbering and plan conformance.
    pub fn append_chapter(&mut self, chapter: Chapter) -> crate::Result<()> {
        if self.chapters.len() as u32 >= self.story_length {
            return Err(crate::TaleError::Protocol(format!(
                "adventure already has {} of {} chapters",
                self.chapters.len(),
                self.story_length
            )));
        }
        let expected_number = self.next_chapter_number();
        if chapter.chapter_number != expected_number {
            return Err(crate::TaleError::Protocol(format!(
                "expected chapter {expected_number}, got {}",
                chapter.chapter_number
            )));
        }
        let planned = self.planned_chapter_types[self.chapters.len()];
        if chapter.chapter_type != planned {
            return Err(crate::TaleError::Protocol(format!(
                "chapter {expected_number} planned as {planned}, got {}",
                chapter.chapter_type
            )));
        }
        self.chapters.push(chapter);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the response to chapter `number`. Returns `false` when the
    /// chapter does not exist, already has a response, or is the CONCLUSION:
    /// duplicate choices are a no-op, not an error.
    pub fn record_response(&mut self, number: u32, response: ChapterResponse) -> bool {
        let Some(chapter) = self.chapters.iter_mut().find(|c| c.chapter_number == number) else {
            return false;
        };
        if chapter.response.is_some() || chapter.chapter_type == ChapterType::Conclusion {
            return false;
        }
        chapter.response = Some(response);
        self.updated_at = Utc::now();
        true
    }

    /// Set agency exactly once; later calls are ignored.
    pub fn set_agency(&mut self, agency: Agency) -> bool {
        if self.metadata.agency.is_some() {
            return false;
        }
        self.metadata.agency = Some(agency);
        self.updated_at = Utc::now();
        true
    }

    /// Merge a character-visual extraction delta. Entries are added or
    /// refined, never removed.
    pub fn merge_character_visuals(&mut self, delta: BTreeMap<String, String>) {
        for (name, visual) in delta {
            if name.trim().is_empty() || visual.trim().is_empty() {
                continue;
            }
            self.character_visuals.insert(name, visual);
        }
        self.updated_at = Utc::now();
    }

    /// Record the recap artifacts for chapter `number` (1-based). Slots for
    /// earlier chapters are back-filled with the unavailable marker so the
    /// vectors stay index-aligned with `chapters`.
    pub fn record_summary(&mut self, number: u32, title: String, summary: String) {
        let idx = number.saturating_sub(1) as usize;
        while self.chapter_summaries.len() <= idx {
            self.chapter_summaries.push(SUMMARY_UNAVAILABLE.to_string());
        }
        while self.summary_chapter_titles.len() <= idx {
            self.summary_chapter_titles.push(format!("Chapter {}", self.summary_chapter_titles.len() + 1));
        }
        self.chapter_summaries[idx] = summary;
        self.summary_chapter_titles[idx] = title;
        self.updated_at = Utc::now();
    }

    /// Derived completion flag: the CONCLUSION chapter has been generated.
    pub fn is_complete(&self) -> bool {
        self.chapters
            .last()
            .map(|c| c.chapter_type == ChapterType::Conclusion && !c.content.is_empty())
            .unwrap_or(false)
    }

    /// Number of chapters with recorded content.
    pub fn completed_chapter_count(&self) -> u32 {
        self.chapters.len() as u32
    }

    /// Repair a loaded record in place, returning a description of every
    /// repair made. An empty list means the record was valid.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut repairs = Vec::new();

        if self.story_length < MIN_STORY_LENGTH {
            repairs.push(format!(
                "story_length {} below minimum, reset to {DEFAULT_STORY_LENGTH}",
                self.story_length
            ));
            self.story_length = DEFAULT_STORY_LENGTH;
        }

        if self.planned_chapter_types.len() as u32 != self.story_length
            || !plan_endpoints_valid(&self.planned_chapter_types)
        {
            repairs.push("planned chapter sequence invalid, rebuilt with an all-STORY middle".into());
            self.planned_chapter_types = fallback_plan(self.story_length);
        }

        if self.chapters.len() as u32 > self.story_length {
            repairs.push(format!(
                "chapter list truncated from {} to {}",
                self.chapters.len(),
                self.story_length
            ));
            self.chapters.truncate(self.story_length as usize);
        }

        for (i, chapter) in self.chapters.iter_mut().enumerate() {
            let expected = i as u32 + 1;
            if chapter.chapter_number != expected {
                repairs.push(format!(
                    "chapter at index {i} renumbered {} -> {expected}",
                    chapter.chapter_number
                ));
                chapter.chapter_number = expected;
            }
        }

        if self.protagonist_description.trim().is_empty() {
            repairs.push("protagonist description missing, default applied".into());
            self.protagonist_description = FALLBACK_PROTAGONIST.to_string();
        }

        if !repairs.is_empty() {
            self.updated_at = Utc::now();
        }
        repairs
    }
}

fn plan_endpoints_valid(plan: &[ChapterType]) -> bool {
    plan.len() >= MIN_STORY_LENGTH as usize
        && plan.first() == Some(&ChapterType::Story)
        && plan.last() == Some(&ChapterType::Conclusion)
        && plan.get(plan.len() - 2) == Some(&ChapterType::Story)
}

/// STORY everywhere except the final CONCLUSION; always valid.
pub fn fallback_plan(story_length: u32) -> Vec<ChapterType> {
    let mut plan = vec![ChapterType::Story; story_length as usize];
    if let Some(last) = plan.last_mut() {
        *last = ChapterType::Conclusion;
    }
    plan
}
