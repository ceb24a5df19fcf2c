use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::{
    truncate_text, CompletionRequest, CompletionResponse, FetchResponse, ImageJobRequest,
    ImageJobService, SubmitResponse, TextCompletionService,
};

/// Blocking client for the DashScope text-generation and async image
/// synthesis endpoints.
pub struct DashScopeClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl DashScopeClient {
    pub fn new(api_base: &str, api_key: &str) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build DashScope HTTP client")?;
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let Some(api_key) = config.api_key.as_deref() else {
            bail!("DASHSCOPE_API_KEY not set");
        };
        Self::new(&config.api_base, api_key)
    }

    fn text_generation_endpoint(&self) -> String {
        format!("{}/services/aigc/text-generation/generation", self.api_base)
    }

    fn image_synthesis_endpoint(&self) -> String {
        format!("{}/services/aigc/text2image/image-synthesis", self.api_base)
    }

    fn task_endpoint(&self, task_id: &str) -> String {
        format!("{}/tasks/{}", self.api_base, task_id)
    }
}

impl TextCompletionService for DashScopeClient {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let endpoint = self.text_generation_endpoint();
        let payload = json!({
            "model": request.model,
            "input": {
                "messages": [
                    {"role": "system", "content": request.system_prompt},
                    {"role": "user", "content": request.user_prompt},
                ],
            },
            "parameters": {
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
            },
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("DashScope text request failed ({endpoint})"))?;
        let (status_code, body) = read_payload("DashScope text", response)?;
        Ok(parse_completion(status_code, &body))
    }
}

impl ImageJobService for DashScopeClient {
    fn submit(&self, request: &ImageJobRequest) -> Result<SubmitResponse> {
        let endpoint = self.image_synthesis_endpoint();
        let payload = json!({
            "model": request.model,
            "input": {"prompt": request.prompt},
            "parameters": {
                "size": request.size,
                "n": request.count,
            },
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("X-DashScope-Async", "enable")
            .json(&payload)
            .send()
            .with_context(|| format!("DashScope image submit failed ({endpoint})"))?;
        let (status_code, body) = read_payload("DashScope image submit", response)?;
        Ok(parse_submit(status_code, &body))
    }

    fn fetch(&self, task_id: &str) -> Result<FetchResponse> {
        let endpoint = self.task_endpoint(task_id);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&self.api_key)
            .send()
            .with_context(|| format!("DashScope task poll failed ({endpoint})"))?;
        let (status_code, body) = read_payload("DashScope task poll", response)?;
        Ok(parse_fetch(status_code, &body))
    }
}

/// Non-2xx answers come back as a status code plus whatever the body says;
/// only an unreadable or non-JSON success body is an error.
fn read_payload(label: &str, response: HttpResponse) -> Result<(u16, Value)> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    match serde_json::from_str::<Value>(&body) {
        Ok(parsed) => Ok((code, parsed)),
        Err(_) if !status.is_success() => Ok((
            code,
            json!({ "message": truncate_text(body.trim(), 512) }),
        )),
        Err(err) => Err(err).with_context(|| {
            format!(
                "{label} returned invalid JSON payload: {}",
                truncate_text(&body, 512)
            )
        }),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// Error `code`/`message` sit at the top level on rejected calls and under
/// `output` on failed tasks.
fn error_fields(body: &Value) -> (Option<String>, Option<String>) {
    let output = body.get("output").unwrap_or(&Value::Null);
    let code = string_field(body, "code").or_else(|| string_field(output, "code"));
    let message = string_field(body, "message").or_else(|| string_field(output, "message"));
    (code, message)
}

pub(crate) fn parse_completion(status_code: u16, body: &Value) -> CompletionResponse {
    let output = body.get("output").unwrap_or(&Value::Null);
    let output_text = string_field(output, "text").or_else(|| {
        output
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| string_field(message, "content"))
    });
    let (code, message) = error_fields(body);
    CompletionResponse {
        status_code,
        output_text,
        code,
        message,
    }
}

pub(crate) fn parse_submit(status_code: u16, body: &Value) -> SubmitResponse {
    let output = body.get("output").unwrap_or(&Value::Null);
    let (code, message) = error_fields(body);
    SubmitResponse {
        status_code,
        task_id: string_field(output, "task_id"),
        code,
        message,
    }
}

pub(crate) fn parse_fetch(status_code: u16, body: &Value) -> FetchResponse {
    let output = body.get("output").unwrap_or(&Value::Null);
    let result_urls = output
        .get("results")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| string_field(row, "url"))
                .collect()
        })
        .unwrap_or_default();
    let (code, message) = error_fields(body);
    FetchResponse {
        status_code,
        task_status: string_field(output, "task_status"),
        result_urls,
        code,
        message,
    }
}
