use proptest::prelude::*;
use tale_prompt::{extract_json, parse_choice_block};

proptest! {
    // The parsers run over raw model output; they must be total.
    #[test]
    fn choice_parser_never_panics(input in ".{0,2000}") {
        let (cleaned, choices) = parse_choice_block(&input);
        prop_assert!(choices.len() <= 3);
        prop_assert!(cleaned.len() <= input.len());
    }

    #[test]
    fn json_extractor_never_panics(input in ".{0,2000}") {
        let _ = extract_json(&input);
    }

    #[test]
    fn cleaned_text_never_contains_open_tag(body in "[a-zA-Z \n]{0,200}") {
        let raw = format!("{body}\n<CHOICES>\nChoice A: x\nChoice B: y\nChoice C: z\n</CHOICES>");
        let (cleaned, choices) = parse_choice_block(&raw);
        prop_assert!(!cleaned.to_lowercase().contains("<choices>"));
        prop_assert_eq!(choices.len(), 3);
    }
}
