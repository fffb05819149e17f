//! # 生成式合成模块（外部边界）
//!
//! ## 设计思路
//!
//! 生成式模型只是一个“输入主体 + 场景 + 指令，输出一张图”的外部能力。
//! 核心流水线只依赖 `GenerativeCompositor` trait，具体传输协议由各后端自行实现，
//! 测试中可以直接注入桩实现。
//!
//! ## 实现思路
//!
//! - `OpenAiImageEditor`：`/v1/images/edits`，multipart 上传两张 PNG，读取 `data[0].b64_json`。
//! - `GeminiImageComposer`：`:generateContent`，JSON 内联两张 PNG，读取首个 `inlineData`。
//! - 三类失败严格区分：调用失败 / 响应中没有图片 / 图片无法解码。

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use image::DynamicImage;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::pipeline::encode_png;
use super::retry::{RetryPolicy, send_with_retry, truncate_for_log};
use super::source::CompositionRequest;
use super::{ComposeConfig, ComposeError};

const ERROR_BODY_LOG_CHARS: usize = 300;

/// 生成式合成能力。
#[async_trait]
pub trait GenerativeCompositor: Send + Sync {
    /// 后端名称（用于日志）。
    fn name(&self) -> &'static str;

    /// 执行一次合成，返回唯一一张生成图。
    async fn compose(&self, request: &CompositionRequest) -> Result<DynamicImage, ComposeError>;
}

/// 构建外部调用共用的 HTTP 客户端。
pub(crate) fn build_http_client(timeout_secs: u64, config: &ComposeConfig) -> Result<reqwest::Client, ComposeError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| ComposeError::Internal(format!("无法创建 HTTP 客户端：{}", e)))
}

fn retry_policy(config: &ComposeConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.network_retry_max_attempts,
        base_delay_ms: config.network_retry_base_delay_ms,
    }
}

/// 在阻塞线程中把主体与场景编码为 PNG。
async fn encode_inputs(request: &CompositionRequest) -> Result<(Vec<u8>, Vec<u8>), ComposeError> {
    let subject = request.subject.clone();
    let scene = Arc::clone(&request.scene);

    tokio::task::spawn_blocking(move || Ok((encode_png(&subject)?, encode_png(&scene)?)))
        .await
        .map_err(|e| ComposeError::Internal(format!("PNG 编码线程执行失败：{}", e)))?
}

fn decode_generated_base64(payload: &str) -> Result<DynamicImage, ComposeError> {
    let bytes = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ComposeError::GenerativeResponseUndecodable(format!("base64 解码失败：{}", e)))?;

    image::load_from_memory(&bytes)
        .map_err(|e| ComposeError::GenerativeResponseUndecodable(format!("图片解码失败：{}", e)))
}

async fn read_success_body(backend: &str, response: reqwest::Response) -> Result<bytes::Bytes, ComposeError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| ComposeError::GenerativeCallFailed(format!("{} 响应读取失败：{}", backend, e)))?;

    if !status.is_success() {
        return Err(ComposeError::GenerativeCallFailed(format!(
            "{} 返回 HTTP {}：{}",
            backend,
            status.as_u16(),
            truncate_for_log(&String::from_utf8_lossy(&body), ERROR_BODY_LOG_CHARS)
        )));
    }

    Ok(body)
}

fn map_send_error(backend: &str, err: reqwest::Error) -> ComposeError {
    if err.is_timeout() {
        ComposeError::GenerativeCallFailed(format!("{} 请求超时", backend))
    } else if err.is_connect() {
        ComposeError::GenerativeCallFailed(format!("{} 无法连接：{}", backend, err))
    } else {
        ComposeError::GenerativeCallFailed(format!("{} 请求失败：{}", backend, err))
    }
}

/// OpenAI 图片编辑后端。
pub struct OpenAiImageEditor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct OpenAiImagesResponse {
    #[serde(default)]
    data: Vec<OpenAiImageData>,
}

#[derive(Deserialize)]
struct OpenAiImageData {
    #[serde(default)]
    b64_json: Option<String>,
}

impl OpenAiImageEditor {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        config: &ComposeConfig,
    ) -> Result<Self, ComposeError> {
        Ok(Self {
            client: build_http_client(config.generative_timeout_secs, config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            retry: retry_policy(config),
        })
    }

    fn parse_response(body: &[u8]) -> Result<DynamicImage, ComposeError> {
        let parsed: OpenAiImagesResponse = serde_json::from_slice(body).map_err(|e| {
            ComposeError::GenerativeResponseEmpty(format!("响应不是预期的 JSON：{}", e))
        })?;

        let payload = parsed
            .data
            .into_iter()
            .next()
            .and_then(|item| item.b64_json)
            .filter(|b64| !b64.trim().is_empty())
            .ok_or_else(|| ComposeError::GenerativeResponseEmpty("响应中没有 b64_json 图片".to_string()))?;

        decode_generated_base64(&payload)
    }
}

#[async_trait]
impl GenerativeCompositor for OpenAiImageEditor {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn compose(&self, request: &CompositionRequest) -> Result<DynamicImage, ComposeError> {
        let (person_png, scene_png) = encode_inputs(request).await?;
        let size = format!("{}x{}", request.target_size.0, request.target_size.1);
        let url = format!("{}/v1/images/edits", self.base_url);

        log::info!(
            "🎨 调用 OpenAI 图片编辑 - model={} size={} person={}KB scene={}KB",
            self.model,
            size,
            person_png.len() / 1024,
            scene_png.len() / 1024
        );

        let response = send_with_retry("OpenAI Images", self.retry, || {
            let form = reqwest::multipart::Form::new()
                .text("model", self.model.clone())
                .text("prompt", request.instruction.clone())
                .text("size", size.clone())
                .part(
                    "image[]",
                    reqwest::multipart::Part::bytes(person_png.clone())
                        .file_name("person.png")
                        .mime_str("image/png")?,
                )
                .part(
                    "image[]",
                    reqwest::multipart::Part::bytes(scene_png.clone())
                        .file_name("scene.png")
                        .mime_str("image/png")?,
                );

            Ok(self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .multipart(form))
        })
        .await
        .map_err(|e| map_send_error("OpenAI Images", e))?;

        let body = read_success_body("OpenAI Images", response).await?;
        Self::parse_response(&body)
    }
}

/// Gemini 图片生成后端。
pub struct GeminiImageComposer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Deserialize)]
struct GeminiInlineData {
    #[serde(default)]
    data: String,
}

impl GeminiImageComposer {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        config: &ComposeConfig,
    ) -> Result<Self, ComposeError> {
        Ok(Self {
            client: build_http_client(config.generative_timeout_secs, config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            retry: retry_policy(config),
        })
    }

    fn parse_response(body: &[u8]) -> Result<DynamicImage, ComposeError> {
        let parsed: GeminiResponse = serde_json::from_slice(body).map_err(|e| {
            ComposeError::GenerativeResponseEmpty(format!("响应不是预期的 JSON：{}", e))
        })?;

        let payload = parsed
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .filter_map(|part| part.inline_data)
            .map(|inline| inline.data)
            .find(|data| !data.trim().is_empty())
            .ok_or_else(|| ComposeError::GenerativeResponseEmpty("响应中没有内联图片".to_string()))?;

        decode_generated_base64(&payload)
    }
}

#[async_trait]
impl GenerativeCompositor for GeminiImageComposer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn compose(&self, request: &CompositionRequest) -> Result<DynamicImage, ComposeError> {
        let (person_png, scene_png) = encode_inputs(request).await?;
        let person_b64 = general_purpose::STANDARD.encode(person_png);
        let scene_b64 = general_purpose::STANDARD.encode(scene_png);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);

        let payload = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": request.instruction },
                    { "inline_data": { "mime_type": "image/png", "data": person_b64 } },
                    { "inline_data": { "mime_type": "image/png", "data": scene_b64 } }
                ]
            }],
            "generationConfig": { "responseModalities": ["IMAGE"] }
        });

        log::info!("🎨 调用 Gemini 图片生成 - model={}", self.model);

        let response = send_with_retry("Gemini", self.retry, || {
            Ok(self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&payload))
        })
        .await
        .map_err(|e| map_send_error("Gemini", e))?;

        let body = read_success_body("Gemini", response).await?;
        Self::parse_response(&body)
    }
}
