use std::sync::Arc;

use anyhow::Result;
use scenecast_contracts::events::EventWriter;
use scenecast_contracts::jobs::GenerationOutcome;
use scenecast_contracts::rewrite::{RewriteRequest, RewriteResult};
use serde_json::{json, Map, Value};

pub mod config;
mod dashscope;
mod poller;
mod rewriter;

pub use config::{EngineConfig, ImageJobSettings, PollSettings, RewriteSettings};
pub use dashscope::DashScopeClient;
pub use poller::{
    CancelToken, DiscardNotices, GenerationJobPoller, NoticeSink, PollClock, SubmissionError,
    ThreadClock,
};
pub use rewriter::{fallback_prompt, PromptRewriter};

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub status_code: u16,
    pub output_text: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl CompletionResponse {
    pub fn is_ok(&self) -> bool {
        is_success_status(self.status_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJobRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub status_code: u16,
    pub task_id: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl SubmitResponse {
    pub fn is_ok(&self) -> bool {
        is_success_status(self.status_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status_code: u16,
    pub task_status: Option<String>,
    pub result_urls: Vec<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl FetchResponse {
    pub fn is_ok(&self) -> bool {
        is_success_status(self.status_code)
    }
}

/// Remote text completion. `Err` means the call never produced a response;
/// a rejected call is an `Ok` carrying a non-2xx `status_code`.
pub trait TextCompletionService: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Remote asynchronous image generation, same error convention as
/// [`TextCompletionService`].
pub trait ImageJobService: Send + Sync {
    fn submit(&self, request: &ImageJobRequest) -> Result<SubmitResponse>;
    fn fetch(&self, task_id: &str) -> Result<FetchResponse>;
}

impl<T: TextCompletionService + ?Sized> TextCompletionService for Arc<T> {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        (**self).complete(request)
    }
}

impl<T: ImageJobService + ?Sized> ImageJobService for Arc<T> {
    fn submit(&self, request: &ImageJobRequest) -> Result<SubmitResponse> {
        (**self).submit(request)
    }

    fn fetch(&self, task_id: &str) -> Result<FetchResponse> {
        (**self).fetch(task_id)
    }
}

#[derive(Debug)]
pub struct SceneReport {
    pub rewrite: RewriteResult,
    pub outcome: Result<GenerationOutcome, SubmissionError>,
}

impl SceneReport {
    pub fn result_url(&self) -> Option<&str> {
        self.outcome.as_ref().ok().and_then(GenerationOutcome::result_url)
    }
}

/// Rewrite then generate, one request at a time per call. Instances hold no
/// per-request state and can serve several threads.
pub struct ScenePipeline<T, S, C = ThreadClock> {
    rewriter: PromptRewriter<T>,
    poller: GenerationJobPoller<S, C>,
    events: EventWriter,
}

impl ScenePipeline<Arc<DashScopeClient>, Arc<DashScopeClient>, ThreadClock> {
    pub fn from_config(config: &EngineConfig, events: EventWriter) -> Result<Self> {
        let client = Arc::new(DashScopeClient::from_config(config)?);
        Ok(Self::with_client(client, config, events))
    }

    /// Builds a pipeline over an existing client, so callers can open one
    /// client and give each request its own event writer.
    pub fn with_client(
        client: Arc<DashScopeClient>,
        config: &EngineConfig,
        events: EventWriter,
    ) -> Self {
        Self::new(
            PromptRewriter::new(Arc::clone(&client), config.rewrite.clone(), events.clone()),
            GenerationJobPoller::new(client, config.image.clone(), config.poll, events.clone()),
            events,
        )
    }
}

impl<T, S, C> ScenePipeline<T, S, C>
where
    T: TextCompletionService,
    S: ImageJobService,
    C: PollClock,
{
    pub fn new(
        rewriter: PromptRewriter<T>,
        poller: GenerationJobPoller<S, C>,
        events: EventWriter,
    ) -> Self {
        Self {
            rewriter,
            poller,
            events,
        }
    }

    pub fn rewriter(&self) -> &PromptRewriter<T> {
        &self.rewriter
    }

    pub fn poller(&self) -> &GenerationJobPoller<S, C> {
        &self.poller
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn generate(
        &self,
        request: &RewriteRequest,
        notices: &dyn NoticeSink,
        cancel: &CancelToken,
    ) -> SceneReport {
        let rewrite = self.rewriter.rewrite_request(request);
        self.events.record(
            "prompt_rewritten",
            map_object(json!({
                "raw_text": request.raw_text(),
                "final_prompt": rewrite.final_prompt,
                "language": request.language().as_str(),
                "used_fallback": rewrite.used_fallback,
            })),
        );
        let outcome = self.poller.run(&rewrite.final_prompt, notices, cancel);
        SceneReport { rewrite, outcome }
    }
}

fn is_success_status(status_code: u16) -> bool {
    (200..300).contains(&status_code)
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
