//! Prompt composers. Each returns a [`Prompt`] built from string templates
//! parameterized by [`AdventureState`] fields; nothing here performs I/O.

use crate::catalog::{phase_guidance, sensory_mood_for};
use tale_core::{
    AdventureState, Agency, Chapter, ChapterResponse, ChapterType, LessonQuestion, Prompt,
    PromptPurpose, StorytellingPhase,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Compose the prompt for the next chapter (`next_index` is 0-based into the
/// planned sequence).
///
/// Injects full prior-chapter content including each chosen option, the
/// protagonist and agency, phase-keyed choice guidance, and for LESSON
/// chapters the sampled question verbatim.
pub fn compose_chapter(
    state: &AdventureState,
    next_index: usize,
    question: Option<&LessonQuestion>,
) -> Prompt {
    let chapter_number = next_index as u32 + 1;
    let chapter_type = state.planned_chapter_types[next_index];
    let phase = StorytellingPhase::for_chapter(chapter_number, state.story_length);

    let mut text = String::new();
    let _ = writeln!(
        text,
        "You are the narrator of an interactive educational adventure set in \"{}\".\n\
         The protagonist is {}.",
        state.story_category, state.protagonist_description
    );

    if let Some(agency) = &state.metadata.agency {
        let _ = writeln!(text, "{}", agency_clause(agency));
    }

    if !state.character_visuals.is_empty() {
        let _ = writeln!(text, "\nCharacters seen so far:");
        for (name, visual) in &state.character_visuals {
            let _ = writeln!(text, "- {name}: {visual}");
        }
    }

    if !state.chapters.is_empty() {
        let _ = writeln!(text, "\nThe story so far:");
        for chapter in &state.chapters {
            let _ = writeln!(text, "\n--- Chapter {} ---\n{}", chapter.chapter_number, chapter.content);
            if let Some(choice) = response_text(chapter) {
                let _ = writeln!(text, "[The reader chose: {choice}]");
            }
        }
    }

    let _ = writeln!(
        text,
        "\nWrite chapter {chapter_number} of {} ({:?} phase).",
        state.story_length, phase
    );
    let _ = writeln!(text, "Guidance: {}", phase_guidance(phase));
    let _ = writeln!(
        text,
        "Write 3 to 5 flowing paragraphs separated by blank lines. Stay warm, vivid, and \
         age-appropriate."
    );

    match chapter_type {
        ChapterType::Story | ChapterType::Reflect => {
            if chapter_type == ChapterType::Reflect {
                let _ = writeln!(
                    text,
                    "This chapter is a reflection: weave a narrative challenge that tests whether \
                     the reader truly understood the previous lesson, without quizzing directly."
                );
            }
            let _ = writeln!(
                text,
                "End the chapter with exactly three choices in this format and nothing after it:\n\
                 <CHOICES>\n\
                 Choice A: [first path]\n\
                 Choice B: [second path]\n\
                 Choice C: [third path]\n\
                 </CHOICES>"
            );
        }
        ChapterType::Lesson => {
            let question = question.expect("LESSON chapter composed without a question");
            let _ = writeln!(
                text,
                "This chapter carries a lesson about {}. Build the narrative so a character \
                 naturally poses this exact question, reproduced verbatim as the final line:\n\
                 {}\n\
                 Do not offer answer options or a choices block; the reader will answer \
                 directly.",
                question.topic, question.question
            );
        }
        ChapterType::Conclusion => {
            let _ = writeln!(
                text,
                "This is the conclusion. Resolve the journey and the protagonist's growth. \
                 Do not offer any choices and do not end with a choices block."
            );
        }
    }

    Prompt::new(PromptPurpose::Chapter, text)
}

/// Compose the summarization prompt for a completed chapter.
pub fn compose_summary(chapter: &Chapter, choice_context: Option<&str>) -> Prompt {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "Summarize this adventure chapter for a recap page. Respond with JSON only:\n\
         {{\"title\": \"<evocative 2-5 word title>\", \"summary\": \"<2-3 sentence summary>\"}}"
    );
    let _ = writeln!(text, "\nChapter {} content:\n{}", chapter.chapter_number, chapter.content);
    if let Some(choice) = choice_context {
        let _ = writeln!(text, "\nThe reader then chose: {choice}");
    }
    Prompt::new(PromptPurpose::Summary, text)
}

/// Compose the character-visual extraction prompt for a completed chapter.
pub fn compose_character_visual_update(
    chapter_content: &str,
    existing_visuals: &BTreeMap<String, String>,
) -> Prompt {
    let existing = serde_json::to_string_pretty(existing_visuals).unwrap_or_else(|_| "{}".into());
    let text = format!(
        "Track character appearances for illustration continuity.\n\
         Known visuals:\n{existing}\n\n\
         Chapter text:\n{chapter_content}\n\n\
         Respond with JSON only: an object mapping each character name that appears in the \
         chapter to a one-sentence visual description. Refine known entries if the chapter \
         adds detail; include new characters; never invent characters not in the text."
    );
    Prompt::new(PromptPurpose::VisualUpdate, text)
}

/// Compose the scene-extraction prompt for the image pipeline.
pub fn compose_image_scene(chapter_content: &str) -> Prompt {
    let text = format!(
        "Pick the single most visually striking moment of this chapter and describe it in \
         2-3 sentences as a concrete scene: who is present, where they are, what is \
         happening. No camera or style directions.\n\nChapter:\n{chapter_content}"
    );
    Prompt::new(PromptPurpose::ImageScene, text)
}

/// Compose the final image-synthesis prompt from the extracted scene and the
/// adventure's visual anchors.
pub fn compose_image_synthesis(
    scene: &str,
    protagonist: &str,
    agency: Option<&Agency>,
    character_visuals: &BTreeMap<String, String>,
    sensory_mood: &str,
) -> Prompt {
    let mut text = String::new();
    let _ = writeln!(text, "Children's storybook illustration, painterly, no text in image.");
    let _ = writeln!(text, "Scene: {scene}");
    let _ = writeln!(text, "Protagonist: {protagonist}");
    if let Some(agency) = agency {
        if !agency.visual_details.is_empty() {
            let _ = writeln!(text, "Always depict with them: {} ({})", agency.name, agency.visual_details);
        }
    }
    for (name, visual) in character_visuals {
        let _ = writeln!(text, "{name}: {visual}");
    }
    let _ = writeln!(text, "Mood: {sensory_mood}");
    Prompt::new(PromptPurpose::ImageSynthesis, text)
}

/// Convenience for the engine: synthesis prompt straight from state.
pub fn compose_image_synthesis_for(state: &AdventureState, scene: &str) -> Prompt {
    compose_image_synthesis(
        scene,
        &state.protagonist_description,
        state.metadata.agency.as_ref(),
        &state.character_visuals,
        sensory_mood_for(&state.story_category),
    )
}

fn agency_clause(agency: &Agency) -> String {
    if agency.visual_details.is_empty() {
        format!("At the journey's start the reader chose: {}.", agency.description)
    } else {
        format!(
            "The protagonist's companion through this journey is their chosen {}: {} ({}). \
             Reference it naturally where it fits.",
            agency.category.to_lowercase(),
            agency.name,
            agency.visual_details
        )
    }
}

fn response_text(chapter: &Chapter) -> Option<String> {
    match chapter.response.as_ref()? {
        ChapterResponse::Narrative { choice_text, .. } => Some(choice_text.clone()),
        ChapterResponse::Lesson { answer_index, is_correct } => {
            let answer = chapter
                .question
                .as_ref()
                .and_then(|q| q.answers.get(*answer_index))
                .cloned()
                .unwrap_or_else(|| format!("answer {answer_index}"));
            Some(if *is_correct {
                format!("{answer} (correct)")
            } else {
                format!("{answer} (incorrect)")
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tale_core::StoryChoice;

    fn base_state() -> AdventureState {
        let plan = vec![
            ChapterType::Story,
            ChapterType::Lesson,
            ChapterType::Story,
            ChapterType::Conclusion,
        ];
        AdventureState::new("enchanted_forest", "Human Body", plan, "a curious girl with copper hair")
    }

    fn question() -> LessonQuestion {
        LessonQuestion {
            topic: "Human Body".into(),
            question: "Which organ pumps blood through the body?".into(),
            answers: vec!["The heart".into(), "The lungs".into(), "The liver".into()],
            correct_index: 0,
            explanation: "The heart pumps blood through the circulatory system.".into(),
        }
    }

    #[test]
    fn chapter_prompt_injects_prior_content_and_choice() {
        let mut state = base_state();
        state
            .append_chapter(Chapter::narrative(
                1,
                ChapterType::Story,
                "The forest gate creaked open.",
                vec![StoryChoice { id: "1_0".into(), text: "Step through".into() }],
            ))
            .unwrap();
        state.record_response(
            1,
            ChapterResponse::Narrative { chosen_path: "1_0".into(), choice_text: "Step through".into() },
        );

        let prompt = compose_chapter(&state, 1, Some(&question()));
        assert!(prompt.text.contains("The forest gate creaked open."));
        assert!(prompt.text.contains("[The reader chose: Step through]"));
        assert!(prompt.text.contains("Which organ pumps blood through the body?"));
        assert!(!prompt.text.contains("<CHOICES>"));
    }

    #[test]
    fn story_prompt_instructs_choice_block() {
        let state = base_state();
        let prompt = compose_chapter(&state, 0, None);
        assert!(prompt.text.contains("<CHOICES>"));
        assert!(prompt.text.contains("exactly three choices"));
    }

    #[test]
    fn conclusion_prompt_forbids_choices() {
        let mut state = base_state();
        state.planned_chapter_types =
            vec![ChapterType::Story, ChapterType::Story, ChapterType::Story, ChapterType::Conclusion];
        let prompt = compose_chapter(&state, 3, None);
        assert!(prompt.text.contains("Do not offer any choices"));
    }

    #[test]
    fn lesson_question_appears_verbatim() {
        let state = base_state();
        let q = question();
        let prompt = compose_chapter(&state, 1, Some(&q));
        assert!(prompt.text.contains(&q.question));
    }

    #[test]
    fn synthesis_prompt_carries_visual_anchors() {
        let mut state = base_state();
        state.metadata.agency = Some(Agency {
            category: "Meet a Companion".into(),
            name: "Clockwork Owl".into(),
            visual_details: "a brass owl with amber lens-eyes".into(),
            description: "chose the owl".into(),
        });
        state
            .character_visuals
            .insert("Mira".into(), "silver-haired scout".into());

        let prompt = compose_image_synthesis_for(&state, "The owl circles a mossy archway.");
        assert!(prompt.text.contains("Clockwork Owl"));
        assert!(prompt.text.contains("Mira: silver-haired scout"));
        assert!(prompt.text.contains("dappled green-gold light"));
    }
}
