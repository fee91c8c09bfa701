//! Storage key layout
//!
//! Every key belonging to a section is `{section_id}_{field}`. No field name
//! is an `_`-suffix of another, so splitting a key on its known field suffix
//! is unambiguous and two sections can never produce the same key.

/// Cross-section key recording the section the user was last on
pub const CURRENT_SECTION_KEY: &str = "current_section_id";

/// Per-section storage fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    SectionState,
    ExamState,
    PerformanceData,
    Chat,
    UserInput,
    ShowPrompts,
    CurrentVideoId,
    CurrentPlaybackTime,
    CurrentVideoDuration,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::SectionState,
        Field::ExamState,
        Field::PerformanceData,
        Field::Chat,
        Field::UserInput,
        Field::ShowPrompts,
        Field::CurrentVideoId,
        Field::CurrentPlaybackTime,
        Field::CurrentVideoDuration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::SectionState => "section_state",
            Field::ExamState => "exam_state",
            Field::PerformanceData => "performance_data",
            Field::Chat => "chat",
            Field::UserInput => "user_input",
            Field::ShowPrompts => "show_prompts",
            Field::CurrentVideoId => "current_video_id",
            Field::CurrentPlaybackTime => "current_playback_time",
            Field::CurrentVideoDuration => "current_video_duration",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key derivation for one section
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionNamespace {
    section_id: String,
}

impl SectionNamespace {
    pub fn new(section_id: impl Into<String>) -> Self {
        Self {
            section_id: section_id.into(),
        }
    }

    pub fn section_id(&self) -> &str {
        &self.section_id
    }

    /// Key for one field of this section
    pub fn key_for(&self, field: Field) -> String {
        key_for(&self.section_id, field)
    }

    /// Every key this section may own
    pub fn all_keys(&self) -> Vec<String> {
        all_keys_for(&self.section_id)
    }

    /// Whether `key` belongs to this section
    pub fn owns(&self, key: &str) -> bool {
        owning_section(key) == Some(self.section_id.as_str())
    }
}

pub fn key_for(section_id: &str, field: Field) -> String {
    format!("{}_{}", section_id, field.as_str())
}

pub fn all_keys_for(section_id: &str) -> Vec<String> {
    Field::ALL
        .iter()
        .map(|field| key_for(section_id, *field))
        .collect()
}

/// Reverse-map a key to the section that owns it.
///
/// Returns `None` for the cross-section key and for keys outside the layout.
pub fn owning_section(key: &str) -> Option<&str> {
    if key == CURRENT_SECTION_KEY {
        return None;
    }

    Field::ALL.iter().find_map(|field| {
        key.strip_suffix(field.as_str())
            .and_then(|rest| rest.strip_suffix('_'))
            .filter(|section| !section.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_layout() {
        let ns = SectionNamespace::new("ask-ai-main");
        assert_eq!(ns.key_for(Field::Chat), "ask-ai-main_chat");
        assert_eq!(ns.key_for(Field::CurrentPlaybackTime), "ask-ai-main_current_playback_time");
        assert_eq!(ns.all_keys().len(), Field::ALL.len());
    }

    #[test]
    fn test_no_field_is_suffix_of_another() {
        for a in Field::ALL {
            for b in Field::ALL {
                if a != b {
                    let suffix = format!("_{}", b.as_str());
                    assert!(!a.as_str().ends_with(&suffix), "{} ends with {}", a, suffix);
                }
            }
        }
    }

    #[test]
    fn test_owning_section() {
        assert_eq!(owning_section("exam-3_exam_state"), Some("exam-3"));
        assert_eq!(owning_section("a_b_chat"), Some("a_b"));
        assert_eq!(owning_section(CURRENT_SECTION_KEY), None);
        assert_eq!(owning_section("_chat"), None);
        assert_eq!(owning_section("theme"), None);
    }

    proptest! {
        #[test]
        fn prop_keys_never_collide(
            a in "[a-z_-]{1,12}",
            b in "[a-z_-]{1,12}",
            fa in 0usize..9,
            fb in 0usize..9,
        ) {
            let (fa, fb) = (Field::ALL[fa], Field::ALL[fb]);
            prop_assume!(a != b || fa != fb);
            prop_assert_ne!(key_for(&a, fa), key_for(&b, fb));
        }

        #[test]
        fn prop_owning_section_inverts_key_for(section in "[a-z0-9_-]{1,16}", field in 0usize..9) {
            let key = key_for(&section, Field::ALL[field]);
            prop_assert_eq!(owning_section(&key), Some(section.as_str()));
        }
    }
}
