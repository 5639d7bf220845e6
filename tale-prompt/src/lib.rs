//! Prompt composition for the adventure engine.
//!
//! Pure functions over [`tale_core::AdventureState`] plus the fixed pools the
//! narrative draws from (protagonists, agency catalog, sensory moods, phase
//! guidance). No I/O. The choice-marker and JSON parsers live here too: they
//! are the inverse of the formats the composers instruct.

pub mod catalog;
pub mod compose;
pub mod parse;

pub use catalog::{
    AGENCY_CATALOG, AgencyOption, PROTAGONIST_POOL, agency_from_choice, match_agency,
    phase_guidance, sensory_mood_for,
};
pub use compose::{
    compose_chapter, compose_character_visual_update, compose_image_scene,
    compose_image_synthesis, compose_image_synthesis_for, compose_summary,
};
pub use parse::{extract_json, parse_choice_block, parse_summary_response, parse_visual_update};
