//! Chapter-type sequencing.
//!
//! Produces the full `planned_chapter_types` sequence for a new adventure:
//! fixed endpoints (opening STORY, penultimate STORY, final CONCLUSION) and a
//! flexible middle where LESSON and REFLECT slots are interleaved under the
//! adjacency constraints. The planner is deterministic; variety comes from
//! the generated narrative, not the slot layout.

use tale_core::{ChapterType, Result, TaleError, adventure};

/// A planned chapter sequence plus any degradations taken to produce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub chapter_types: Vec<ChapterType>,
    pub warnings: Vec<PlannerWarning>,
}

impl Plan {
    pub fn lesson_count(&self) -> usize {
        self.chapter_types.iter().filter(|t| **t == ChapterType::Lesson).count()
    }

    pub fn reflect_count(&self) -> usize {
        self.chapter_types.iter().filter(|t| **t == ChapterType::Reflect).count()
    }
}

/// Non-fatal degradations, forwarded to telemetry by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerWarning {
    /// Fewer questions were available than the lesson target wanted.
    InsufficientQuestions { target: usize, available: usize },
    /// The produced sequence failed validation and was replaced with an
    /// all-STORY middle.
    ValidationFallback { violation: String },
}

impl std::fmt::Display for PlannerWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerWarning::InsufficientQuestions { target, available } => {
                write!(f, "lesson target {target} capped by {available} available questions")
            }
            PlannerWarning::ValidationFallback { violation } => {
                write!(f, "plan validation failed ({violation}); fell back to all-STORY middle")
            }
        }
    }
}

/// Plan the chapter-type sequence for an adventure of `story_length`
/// chapters, given how many distinct questions the lesson topic can supply.
///
/// Fixed positions: `0` STORY, `L-2` STORY, `L-1` CONCLUSION. The middle is
/// built as `LESSON [REFLECT] STORY` chunks while targets remain, then
/// STORY-filled, a construction that cannot violate the adjacency rules.
/// Targets: `lesson = min(floor((L-2)/2), available)`, `reflect =
/// floor(lesson/2)`.
pub fn plan(story_length: u32, available_questions: usize) -> Result<Plan> {
    if story_length < adventure::MIN_STORY_LENGTH {
        return Err(TaleError::InvalidConfiguration(format!(
            "story_length {story_length} is below the minimum of {}",
            adventure::MIN_STORY_LENGTH
        )));
    }

    let len = story_length as usize;
    let middle_len = len - 3;
    let lesson_target = (len - 2) / 2;
    let capped_target = lesson_target.min(available_questions);

    let mut warnings = Vec::new();
    if capped_target < lesson_target {
        warnings.push(PlannerWarning::InsufficientQuestions {
            target: lesson_target,
            available: available_questions,
        });
    }

    let mut chapter_types = Vec::with_capacity(len);
    chapter_types.push(ChapterType::Story);
    chapter_types.extend(build_middle(middle_len, capped_target));
    chapter_types.push(ChapterType::Story);
    chapter_types.push(ChapterType::Conclusion);

    if let Err(violation) = validate(&chapter_types) {
        tracing::warn!(%violation, story_length, "planner produced an invalid sequence");
        warnings.push(PlannerWarning::ValidationFallback { violation });
        chapter_types = adventure::fallback_plan(story_length);
    }

    Ok(Plan { chapter_types, warnings })
}

fn build_middle(middle_len: usize, lesson_target: usize) -> Vec<ChapterType> {
    let mut middle = Vec::with_capacity(middle_len);
    let mut lessons_left = lesson_target;
    let mut reflects_left = lesson_target / 2;

    while middle.len() < middle_len {
        if lessons_left == 0 {
            middle.push(ChapterType::Story);
            continue;
        }
        lessons_left -= 1;
        middle.push(ChapterType::Lesson);
        if reflects_left > 0 && middle.len() < middle_len {
            reflects_left -= 1;
            middle.push(ChapterType::Reflect);
        }
        // Separator so the next chunk's LESSON is never adjacent, and every
        // REFLECT is followed by STORY.
        if middle.len() < middle_len {
            middle.push(ChapterType::Story);
        }
    }

    middle
}

/// Check every structural invariant of a planned sequence. Returns the first
/// violation found.
pub fn validate(plan: &[ChapterType]) -> std::result::Result<(), String> {
    use ChapterType::*;

    let len = plan.len();
    if len < adventure::MIN_STORY_LENGTH as usize {
        return Err(format!("plan has {len} slots, minimum is {}", adventure::MIN_STORY_LENGTH));
    }
    if plan[0] != Story {
        return Err("first chapter must be STORY".into());
    }
    if plan[len - 1] != Conclusion {
        return Err("last chapter must be CONCLUSION".into());
    }
    if plan[len - 2] != Story {
        return Err("penultimate chapter must be STORY".into());
    }
    if plan[..len - 1].contains(&Conclusion) {
        return Err("CONCLUSION may only appear last".into());
    }

    for (i, pair) in plan.windows(2).enumerate() {
        if pair[0] == Lesson && pair[1] == Lesson {
            return Err(format!("adjacent LESSONs at positions {i} and {}", i + 1));
        }
        if pair[1] == Reflect && pair[0] != Lesson {
            return Err(format!("REFLECT at position {} does not follow a LESSON", i + 1));
        }
        if pair[0] == Reflect && pair[1] != Story {
            return Err(format!("REFLECT at position {i} is not followed by STORY"));
        }
    }
    let lesson_count = plan.iter().filter(|t| **t == Lesson).count();
    let reflect_count = plan.iter().filter(|t| **t == Reflect).count();
    if lesson_count >= 2 && reflect_count == 0 {
        return Err(format!("{lesson_count} LESSONs but no REFLECT"));
    }

    Ok(())
}
