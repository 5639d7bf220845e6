//! Fixed pools referenced across an adventure: protagonist descriptions, the
//! agency catalog offered at Chapter 1, sensory moods per story category, and
//! phase-keyed choice guidance.

use tale_core::{Agency, StorytellingPhase};

/// Protagonist descriptions; one is selected at adventure creation and never
/// changes.
pub const PROTAGONIST_POOL: &[&str] = &[
    "a curious girl with braided copper hair, freckles, and a patched satchel full of maps",
    "a quiet boy with round spectacles, a green scarf, and a notebook of half-finished sketches",
    "a bold child with a mop of dark curls, a crooked grin, and boots one size too big",
    "a thoughtful kid with warm brown eyes, a knitted cap, and a compass on a fraying cord",
];

/// One option within an agency category, in `name [visual details]` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgencyOption {
    pub name: &'static str,
    pub visual_details: &'static str,
}

/// The agency catalog: four categories, each with a handful of options. The
/// Chapter 1 choices are drawn from these; the chosen option is fixed for the
/// rest of the adventure.
pub const AGENCY_CATALOG: &[(&str, &[AgencyOption])] = &[
    (
        "Gain a Special Ability",
        &[
            AgencyOption {
                name: "Element Bender",
                visual_details: "a swirling figure with hands sparking flames, trailing ribbons of water, wind, and stone",
            },
            AgencyOption {
                name: "Animal Whisperer",
                visual_details: "a gentle figure ringed by birds, foxes, and moths leaning in to listen",
            },
            AgencyOption {
                name: "Shadow Stepper",
                visual_details: "a half-seen silhouette sliding between patches of dusk-blue shade",
            },
        ],
    ),
    (
        "Meet a Companion",
        &[
            AgencyOption {
                name: "Clockwork Owl",
                visual_details: "a brass owl with amber lens-eyes and softly ticking wings",
            },
            AgencyOption {
                name: "Starlight Fox",
                visual_details: "a slender fox whose fur glimmers like a clear night sky",
            },
            AgencyOption {
                name: "Pebble Golem",
                visual_details: "a knee-high figure of stacked river stones with mossy shoulders",
            },
        ],
    ),
    (
        "Take on a Role",
        &[
            AgencyOption {
                name: "Junior Mapmaker",
                visual_details: "ink-stained fingers, a leather map tube, and a spyglass on a strap",
            },
            AgencyOption {
                name: "Story Keeper",
                visual_details: "a heavy journal with a brass clasp and ribbons marking favorite pages",
            },
            AgencyOption {
                name: "Lantern Bearer",
                visual_details: "a tall iron lantern whose flame burns a steady honey-gold",
            },
        ],
    ),
    (
        "Carry a Special Item",
        &[
            AgencyOption {
                name: "Compass of Truth",
                visual_details: "a silver compass whose needle glows when pointed at an honest answer",
            },
            AgencyOption {
                name: "Lantern of Echoes",
                visual_details: "a glass lantern that replays faint images of what its light has seen",
            },
            AgencyOption {
                name: "Cloak of Seasons",
                visual_details: "a cloak whose hem cycles slowly through spring blossom and autumn leaf",
            },
        ],
    ),
];

/// Match a Chapter-1 choice text against the catalog. The match is by option
/// name, case-insensitive, anywhere in the text.
pub fn match_agency(choice_text: &str) -> Option<Agency> {
    let lowered = choice_text.to_lowercase();
    for (category, options) in AGENCY_CATALOG {
        for option in *options {
            if lowered.contains(&option.name.to_lowercase()) {
                return Some(Agency {
                    category: (*category).to_string(),
                    name: option.name.to_string(),
                    visual_details: option.visual_details.to_string(),
                    description: choice_text.to_string(),
                });
            }
        }
    }
    None
}

/// Catalog match with the unmatched fallback: the raw chosen text becomes the
/// description, visual details stay empty, and the name is a truncated form
/// of the text so later prompts still have something to reference.
pub fn agency_from_choice(choice_text: &str) -> Agency {
    match_agency(choice_text).unwrap_or_else(|| {
        let name: String = choice_text
            .split(['.', ',', '[', '('])
            .next()
            .unwrap_or(choice_text)
            .trim()
            .chars()
            .take(60)
            .collect();
        Agency {
            category: String::new(),
            name,
            visual_details: String::new(),
            description: choice_text.to_string(),
        }
    })
}

/// Choice-writing guidance keyed by storytelling phase.
pub fn phase_guidance(phase: StorytellingPhase) -> &'static str {
    match phase {
        StorytellingPhase::Exposition => {
            "Choices should establish who the protagonist is and what they care about. \
             Offer paths that reveal temperament, not yet danger."
        }
        StorytellingPhase::Rising => {
            "Choices should pull the protagonist deeper into the unfamiliar. Each path \
             hints at a different cost or curiosity."
        }
        StorytellingPhase::Trials => {
            "Choices are tests. Each option should demand something: courage, patience, \
             honesty, or cleverness."
        }
        StorytellingPhase::Climax => {
            "Choices carry real stakes now. Make consequences legible and let the \
             protagonist's agency matter in every option."
        }
        StorytellingPhase::Return => {
            "No choices remain. Resolve the journey and reflect what the protagonist \
             has learned and become."
        }
    }
}

/// Sensory mood injected into image-synthesis prompts, keyed by story
/// category. Unknown categories get a neutral storybook mood.
pub fn sensory_mood_for(story_category: &str) -> &'static str {
    match story_category {
        "enchanted_forest" => "dappled green-gold light, moss and fern textures, drifting pollen motes",
        "mountain_quest" => "thin crystalline air, slate and snow palette, long cold shadows",
        "ocean_voyage" => "teal depths and foam-white crests, shifting caustic light, salt haze",
        "desert_caravan" => "amber dunes at dusk, heat shimmer, star-pricked indigo sky",
        "city_of_gears" => "warm brass and copper glints, steam curls, lamplit cobbles",
        _ => "soft storybook light, rich color, gentle painterly texture",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_match_extracts_category_name_and_visuals() {
        let choice = "Become the Element Bender and feel the storm answer your call";
        let agency = match_agency(choice).unwrap();
        assert_eq!(agency.category, "Gain a Special Ability");
        assert_eq!(agency.name, "Element Bender");
        assert!(agency.visual_details.starts_with("a swirling figure with hands sparking flames"));
        assert_eq!(agency.description, choice);
    }

    #[test]
    fn match_is_case_insensitive() {
        assert!(match_agency("take the COMPASS OF TRUTH from the pedestal").is_some());
    }

    #[test]
    fn unmatched_choice_falls_back_to_raw_text() {
        let agency = agency_from_choice("Slip away quietly before anyone notices you were there");
        assert!(agency.category.is_empty());
        assert!(agency.visual_details.is_empty());
        assert_eq!(agency.description, "Slip away quietly before anyone notices you were there");
        assert!(!agency.name.is_empty());
    }

    #[test]
    fn every_option_name_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for (_, options) in AGENCY_CATALOG {
            for option in *options {
                assert!(seen.insert(option.name), "duplicate option {}", option.name);
            }
        }
    }
}
