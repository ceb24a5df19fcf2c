use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;
use crate::jobs::GenerationOutcome;
use crate::language::LanguageHint;
use crate::rewrite::{FallbackReason, RewriteRequest, RewriteResult};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What one inbound phrase turned into, written next to the delivered image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReceipt {
    pub schema_version: u64,
    pub request_id: String,
    pub raw_text: String,
    pub language: LanguageHint,
    pub final_prompt: String,
    pub used_fallback: bool,
    pub fallback_reason: Option<FallbackReason>,
    pub task_id: Option<String>,
    pub outcome: String,
    pub result_url: Option<String>,
    pub failure_reason: Option<String>,
    pub image_path: Option<PathBuf>,
    pub created_at: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GenerationReceipt {
    pub fn new(
        request_id: impl Into<String>,
        request: &RewriteRequest,
        rewrite: &RewriteResult,
    ) -> Self {
        Self {
            schema_version: RECEIPT_SCHEMA_VERSION,
            request_id: request_id.into(),
            raw_text: request.raw_text().to_string(),
            language: request.language(),
            final_prompt: rewrite.final_prompt.clone(),
            used_fallback: rewrite.used_fallback,
            fallback_reason: rewrite.fallback_reason,
            task_id: None,
            outcome: "pending".to_string(),
            result_url: None,
            failure_reason: None,
            image_path: None,
            created_at: now_utc_iso(),
            metadata: Map::new(),
        }
    }

    pub fn with_outcome(mut self, outcome: &GenerationOutcome) -> Self {
        self.task_id = Some(outcome.task_id().to_string());
        self.outcome = outcome.kind().to_string();
        self.result_url = outcome.result_url().map(str::to_string);
        self.failure_reason = outcome.failure_reason();
        self
    }

    pub fn with_submission_error(mut self, reason: impl Into<String>) -> Self {
        self.outcome = "submission_failed".to_string();
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }
}

pub fn write_receipt(path: &Path, receipt: &GenerationReceipt) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(receipt)?)?;
    Ok(())
}
