use scenecast_contracts::events::{EventPayload, EventWriter};
use scenecast_contracts::language::{classify_language, LanguageHint};
use scenecast_contracts::rewrite::{FallbackReason, RewriteRequest, RewriteResult};
use serde_json::{json, Value};

use crate::config::RewriteSettings;
use crate::{CompletionRequest, TextCompletionService};

const STRAY_QUOTES: [char; 3] = ['"', '\u{201c}', '\u{201d}'];

/// Turns an inbound phrase into an image prompt.
///
/// Text without CJK ideographs is passed through untouched. CJK text is
/// expanded into a concrete scene by one completion call; any failure of that
/// call yields a deterministic fallback prompt instead of an error.
pub struct PromptRewriter<T> {
    service: T,
    settings: RewriteSettings,
    events: EventWriter,
}

impl<T: TextCompletionService> PromptRewriter<T> {
    pub fn new(service: T, settings: RewriteSettings, events: EventWriter) -> Self {
        Self {
            service,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &RewriteSettings {
        &self.settings
    }

    pub fn rewrite(&self, raw_text: &str) -> RewriteResult {
        self.rewrite_classified(raw_text, classify_language(raw_text))
    }

    pub fn rewrite_request(&self, request: &RewriteRequest) -> RewriteResult {
        self.rewrite_classified(request.raw_text(), request.language())
    }

    fn rewrite_classified(&self, raw_text: &str, language: LanguageHint) -> RewriteResult {
        match language {
            LanguageHint::Other => RewriteResult::passthrough(raw_text),
            LanguageHint::Cjk => self.expand_scene(raw_text),
        }
    }

    fn expand_scene(&self, raw_text: &str) -> RewriteResult {
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            system_prompt: scene_instruction(&self.settings.locale),
            user_prompt: format!("短语：{raw_text}"),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };
        let response = match self.service.complete(&request) {
            Ok(response) => response,
            Err(err) => {
                self.record_failure(raw_text, FallbackReason::Transport, None, format!("{err:#}"));
                return self.fallback(raw_text, FallbackReason::Transport);
            }
        };
        if !response.is_ok() {
            let reason = format!(
                "{} - {}",
                response.code.as_deref().unwrap_or("unknown"),
                response.message.as_deref().unwrap_or("no message")
            );
            self.record_failure(
                raw_text,
                FallbackReason::RemoteStatus,
                Some(response.status_code),
                reason,
            );
            return self.fallback(raw_text, FallbackReason::RemoteStatus);
        }
        let cleaned = response
            .output_text
            .as_deref()
            .map(clean_rewritten_prompt)
            .unwrap_or_default();
        if cleaned.is_empty() {
            self.record_failure(
                raw_text,
                FallbackReason::EmptyResponse,
                Some(response.status_code),
                "completion returned no text".to_string(),
            );
            return self.fallback(raw_text, FallbackReason::EmptyResponse);
        }
        RewriteResult::passthrough(cleaned)
    }

    fn fallback(&self, raw_text: &str, reason: FallbackReason) -> RewriteResult {
        RewriteResult::fallback(
            fallback_prompt(&self.settings.locale, raw_text, reason),
            reason,
        )
    }

    fn record_failure(
        &self,
        raw_text: &str,
        reason: FallbackReason,
        status_code: Option<u16>,
        detail: String,
    ) {
        let mut payload = EventPayload::new();
        payload.insert("raw_text".to_string(), json!(raw_text));
        payload.insert("fallback_reason".to_string(), json!(reason));
        payload.insert("reason".to_string(), Value::String(detail));
        if let Some(code) = status_code {
            payload.insert("status_code".to_string(), json!(code));
        }
        self.events.record("prompt_rewrite_failed", payload);
    }
}

fn scene_instruction(locale: &str) -> String {
    format!(
        "你是一个专为图像生成模型设计的提示词工程师。\
请将用户给出的中文短语（可能抽象）转化为一个具体、生动、视觉化的场景描述。\
要求：\
1. 场景必须设定在{locale}的一个具体地点；\
2. 主角是一位有名字的年轻人（避免敏感或浪漫化描述）；\
3. 包含具体地点（如茶馆、公园、图书馆、街道）、活动、表情、天气、光线、物品等细节，并体现整体氛围；\
4. 语言简洁，用中文输出，不要解释，只输出改写后的描述。"
    )
}

pub fn fallback_prompt(locale: &str, raw_text: &str, reason: FallbackReason) -> String {
    match reason {
        FallbackReason::Transport => {
            format!("{locale}街头，年轻人正在体现'{raw_text}'的概念，自然光线，日常环境")
        }
        FallbackReason::RemoteStatus | FallbackReason::EmptyResponse => {
            format!("{locale}场景中，人们正在体验'{raw_text}'，真实生活，细节丰富")
        }
    }
}

fn clean_rewritten_prompt(text: &str) -> String {
    text.trim()
        .chars()
        .filter(|ch| !STRAY_QUOTES.contains(ch))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::bail;
    use scenecast_contracts::events::EventWriter;
    use scenecast_contracts::rewrite::{FallbackReason, RewriteRequest};
    use serde_json::Value;

    use super::{clean_rewritten_prompt, PromptRewriter};
    use crate::config::RewriteSettings;
    use crate::{CompletionRequest, CompletionResponse, TextCompletionService};

    enum Reply {
        Text(&'static str),
        Status(u16),
        Transport,
    }

    struct FakeCompletion {
        reply: Reply,
        calls: AtomicUsize,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl FakeCompletion {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TextCompletionService for FakeCompletion {
        fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            match self.reply {
                Reply::Text(text) => Ok(CompletionResponse {
                    status_code: 200,
                    output_text: Some(text.to_string()),
                    code: None,
                    message: None,
                }),
                Reply::Status(status_code) => Ok(CompletionResponse {
                    status_code,
                    output_text: None,
                    code: Some("Throttling".to_string()),
                    message: Some("Requests rate limit exceeded".to_string()),
                }),
                Reply::Transport => bail!("connection reset by peer"),
            }
        }
    }

    fn rewriter(fake: &Arc<FakeCompletion>) -> PromptRewriter<Arc<FakeCompletion>> {
        PromptRewriter::new(
            Arc::clone(fake),
            RewriteSettings::default(),
            EventWriter::discard("req-test"),
        )
    }

    #[test]
    fn non_cjk_input_passes_through_without_remote_call() {
        let fake = FakeCompletion::new(Reply::Text("unused"));
        let rewriter = rewriter(&fake);

        let first = rewriter.rewrite("a lighthouse in a storm, oil painting");
        let second = rewriter.rewrite("a lighthouse in a storm, oil painting");

        assert_eq!(first, second);
        assert_eq!(first.final_prompt, "a lighthouse in a storm, oil painting");
        assert!(!first.used_fallback);
        assert_eq!(fake.calls(), 0);
    }

    #[test]
    fn cjk_input_is_expanded_and_quotes_stripped() {
        let fake = FakeCompletion::new(Reply::Text(
            "  \u{201c}小林在人民公园的茶馆里读书，午后阳光斜照\u{201d}\n",
        ));
        let rewriter = rewriter(&fake);

        let result = rewriter.rewrite("安静");

        assert_eq!(result.final_prompt, "小林在人民公园的茶馆里读书，午后阳光斜照");
        assert!(!result.used_fallback);
        assert_eq!(fake.calls(), 1);

        let request = fake.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.model, "qwen-plus");
        assert_eq!(request.max_tokens, 200);
        assert!((request.temperature - 0.6).abs() < f64::EPSILON);
        assert!(request.user_prompt.contains("安静"));
        assert!(request.system_prompt.contains("成都"));
    }

    #[test]
    fn remote_status_error_falls_back_with_raw_text() {
        let fake = FakeCompletion::new(Reply::Status(429));
        let result = rewriter(&fake).rewrite("思念");

        assert!(result.used_fallback);
        assert_eq!(result.fallback_reason, Some(FallbackReason::RemoteStatus));
        assert!(result.final_prompt.contains("思念"));
    }

    #[test]
    fn transport_error_falls_back_with_raw_text() {
        let fake = FakeCompletion::new(Reply::Transport);
        let result = rewriter(&fake).rewrite("自由");

        assert!(result.used_fallback);
        assert_eq!(result.fallback_reason, Some(FallbackReason::Transport));
        assert!(result.final_prompt.contains("自由"));
    }

    #[test]
    fn blank_completion_falls_back() {
        let fake = FakeCompletion::new(Reply::Text(" \u{201c}\u{201d} "));
        let result = rewriter(&fake).rewrite("梦");

        assert!(result.used_fallback);
        assert_eq!(result.fallback_reason, Some(FallbackReason::EmptyResponse));
        assert!(result.final_prompt.contains("梦"));
    }

    #[test]
    fn fallback_prompt_is_deterministic() {
        let fake = FakeCompletion::new(Reply::Status(500));
        let rewriter = rewriter(&fake);
        assert_eq!(rewriter.rewrite("雨"), rewriter.rewrite("雨"));
    }

    #[test]
    fn failures_are_logged_once_each() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let fake = FakeCompletion::new(Reply::Transport);
        let rewriter = PromptRewriter::new(
            Arc::clone(&fake),
            RewriteSettings::default(),
            EventWriter::new(&path, "req-1"),
        );

        let request = RewriteRequest::parse("离别").unwrap();
        rewriter.rewrite_request(&request);

        let types: Vec<String> = std::fs::read_to_string(&path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types, vec!["prompt_rewrite_failed"]);
        Ok(())
    }

    #[test]
    fn passthrough_writes_no_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let fake = FakeCompletion::new(Reply::Text("unused"));
        let rewriter = PromptRewriter::new(
            Arc::clone(&fake),
            RewriteSettings::default(),
            EventWriter::new(&path, "req-1"),
        );

        let request = RewriteRequest::parse("a quiet harbour at dawn").unwrap();
        rewriter.rewrite_request(&request);
        rewriter.rewrite("neon alley");

        assert!(!path.exists());
        assert_eq!(fake.calls(), 0);
        Ok(())
    }

    #[test]
    fn cleaning_keeps_inner_text() {
        assert_eq!(clean_rewritten_prompt("\"a\" b \u{201c}c\u{201d}"), "a b c");
        assert_eq!(clean_rewritten_prompt("  plain  "), "plain");
    }
}
