use serde::{Deserialize, Serialize};

const CJK_UNIFIED_IDEOGRAPHS: std::ops::RangeInclusive<char> = '\u{4e00}'..='\u{9fff}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageHint {
    Cjk,
    Other,
}

impl LanguageHint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cjk => "cjk",
            Self::Other => "other",
        }
    }
}

/// A single ideograph in U+4E00..=U+9FFF is enough to count as CJK.
pub fn classify_language(text: &str) -> LanguageHint {
    if text
        .chars()
        .any(|ch| CJK_UNIFIED_IDEOGRAPHS.contains(&ch))
    {
        LanguageHint::Cjk
    } else {
        LanguageHint::Other
    }
}
