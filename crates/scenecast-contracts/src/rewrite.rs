use serde::{Deserialize, Serialize};

use crate::language::{classify_language, LanguageHint};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRequest {
    raw_text: String,
    language: LanguageHint,
}

impl RewriteRequest {
    /// Accepts one inbound message. Blank lines and `/command` tokens are not
    /// prompts and yield `None`.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.starts_with('/') {
            return None;
        }
        Some(Self {
            raw_text: trimmed.to_string(),
            language: classify_language(trimmed),
        })
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn language(&self) -> LanguageHint {
        self.language
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    RemoteStatus,
    Transport,
    EmptyResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteResult {
    pub final_prompt: String,
    pub used_fallback: bool,
    pub fallback_reason: Option<FallbackReason>,
}

impl RewriteResult {
    pub fn passthrough(prompt: impl Into<String>) -> Self {
        Self {
            final_prompt: prompt.into(),
            used_fallback: false,
            fallback_reason: None,
        }
    }

    pub fn fallback(prompt: impl Into<String>, reason: FallbackReason) -> Self {
        Self {
            final_prompt: prompt.into(),
            used_fallback: true,
            fallback_reason: Some(reason),
        }
    }
}
