//! 启动配置模块
//!
//! # 设计思路
//!
//! 进程启动时从环境变量（以及可选的 `.env` 文件）构建一次 `Settings`，
//! 之后只读共享。任何缺失的凭据或非法取值都直接让启动失败，
//! 而不是在第一次请求时才暴露。
//!
//! # 实现思路
//!
//! - `from_env` 先用 `dotenvy` 加载 `.env`，再委托给 `from_lookup`。
//! - `from_lookup` 接收任意查找函数，测试中可以直接传入 `HashMap`。
//! - 空字符串视为未设置。

use std::path::PathBuf;
use std::sync::Arc;

use crate::compose::{ComposeConfig, GenerativeBackendKind, PromptStyle};
use crate::error::AppError;
use crate::storage::{KeepLatest, RetentionPolicy, StorageLayout, Unlimited};

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_SCENE_FILE: &str = "ship_day_4k.jpg";
const DEFAULT_FRAME_FILE: &str = "frame.png";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_OPENAI_MODEL: &str = "gpt-image-1";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image";

/// 服务启动配置。
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: GenerativeBackendKind,
    pub api_key: String,
    pub generative_base_url: String,
    pub generative_model: String,
    pub bind: String,
    pub layout: StorageLayout,
    pub scene_file: PathBuf,
    pub frame_file: PathBuf,
    /// 配置后启用背景移除阶段。
    pub segmentation_url: Option<String>,
    /// 固定对外地址；未配置时按请求头推导。
    pub public_base_url: Option<String>,
    /// 最多保留的产物组数；`None` 表示不清理。
    pub retention_max_artifacts: Option<usize>,
    pub compose: ComposeConfig,
}

impl Settings {
    /// 从进程环境（含 `.env`）读取配置。
    pub fn from_env() -> Result<Self, AppError> {
        match dotenvy::dotenv() {
            Ok(path) => log::info!("📄 已加载环境文件: {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("⚠️ 加载 .env 失败，忽略: {}", e),
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过任意查找函数读取配置。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let backend = match get("COMPOSE_BACKEND") {
            Some(raw) => GenerativeBackendKind::from_str(&raw).map_err(AppError::Config)?,
            None => GenerativeBackendKind::OpenAi,
        };

        let api_key = get(backend.api_key_env()).ok_or_else(|| {
            AppError::Config(format!("缺少凭据环境变量 {}", backend.api_key_env()))
        })?;

        let (generative_base_url, generative_model) = match backend {
            GenerativeBackendKind::OpenAi => (
                get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                get("OPENAI_IMAGE_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            ),
            GenerativeBackendKind::Gemini => (
                get("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
                get("GEMINI_IMAGE_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            ),
        };

        let layout = StorageLayout::new(get("COMPOSE_BASE_DIR").unwrap_or_else(|| ".".to_string()));
        let scene_file = layout
            .assets
            .join(get("COMPOSE_SCENE_FILE").unwrap_or_else(|| DEFAULT_SCENE_FILE.to_string()));
        let frame_file = layout
            .assets
            .join(get("COMPOSE_FRAME_FILE").unwrap_or_else(|| DEFAULT_FRAME_FILE.to_string()));

        let mut compose = ComposeConfig::default();

        if let Some(raw) = get("COMPOSE_FRAME_ENABLED") {
            compose.frame_enabled = parse_bool("COMPOSE_FRAME_ENABLED", &raw)?;
        }
        if let Some(raw) = get("COMPOSE_FRAME_OFFSET") {
            compose.frame_offset = parse_offset(&raw)?;
        }
        if let Some(raw) = get("COMPOSE_SUBJECT_HEIGHT_FRACTION") {
            compose.subject_height_fraction = Some(parse_fraction(&raw)?);
        }
        if let Some(raw) = get("COMPOSE_PROMPT_STYLE") {
            compose.prompt_style = PromptStyle::from_str(&raw).map_err(AppError::Config)?;
        }
        compose.prompt_override = get("COMPOSE_PROMPT");
        if let Some(raw) = get("COMPOSE_GENERATIVE_TIMEOUT_SECS") {
            compose.generative_timeout_secs = parse_positive("COMPOSE_GENERATIVE_TIMEOUT_SECS", &raw)?;
        }

        let retention_max_artifacts = match get("COMPOSE_RETENTION_MAX_ARTIFACTS") {
            Some(raw) => {
                let n = parse_positive("COMPOSE_RETENTION_MAX_ARTIFACTS", &raw)?;
                Some(usize::try_from(n).map_err(|_| {
                    AppError::Config(format!("COMPOSE_RETENTION_MAX_ARTIFACTS 取值过大: {}", raw))
                })?)
            }
            None => None,
        };

        Ok(Self {
            backend,
            api_key,
            generative_base_url,
            generative_model,
            bind: get("COMPOSE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            layout,
            scene_file,
            frame_file,
            segmentation_url: get("COMPOSE_SEGMENTATION_URL"),
            public_base_url: get("COMPOSE_PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            retention_max_artifacts,
            compose,
        })
    }

    pub fn retention_policy(&self) -> Arc<dyn RetentionPolicy> {
        match self.retention_max_artifacts {
            Some(n) => Arc::new(KeepLatest(n)),
            None => Arc::new(Unlimited),
        }
    }

    /// 打印生效配置（不含凭据）。
    pub fn log_summary(&self) {
        log::info!(
            "⚙️ 生成后端: {} 模型: {} 地址: {}",
            self.backend.as_str(),
            self.generative_model,
            self.generative_base_url
        );
        log::info!(
            "⚙️ 场景: {} 边框: {}（启用: {} 偏移: {:?}）",
            self.scene_file.display(),
            self.frame_file.display(),
            self.compose.frame_enabled,
            self.compose.frame_offset
        );
        log::info!(
            "⚙️ 画布: {} 背景移除: {} 比例适配: {:?} 提示词风格: {}{}",
            self.compose.canvas_size_label(),
            if self.segmentation_url.is_some() { "启用" } else { "关闭" },
            self.compose.subject_height_fraction,
            self.compose.prompt_style.as_str(),
            if self.compose.prompt_override.is_some() { "（已被自定义提示词覆盖）" } else { "" }
        );
        log::info!(
            "⚙️ 静态目录: {} 保留策略: {}",
            self.layout.static_root.display(),
            self.retention_policy().name()
        );
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, AppError> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(AppError::Config(format!("{} 不是合法的布尔值: {}", key, other))),
    }
}

fn parse_offset(raw: &str) -> Result<(u32, u32), AppError> {
    let invalid = || AppError::Config(format!("COMPOSE_FRAME_OFFSET 应为 \"x,y\"，实际: {}", raw));

    let (x, y) = raw.split_once(',').ok_or_else(invalid)?;
    let x = x.trim().parse::<u32>().map_err(|_| invalid())?;
    let y = y.trim().parse::<u32>().map_err(|_| invalid())?;
    Ok((x, y))
}

fn parse_fraction(raw: &str) -> Result<f32, AppError> {
    let value = raw.parse::<f32>().map_err(|_| {
        AppError::Config(format!("COMPOSE_SUBJECT_HEIGHT_FRACTION 不是数字: {}", raw))
    })?;

    if !(value > 0.0 && value <= 1.0) {
        return Err(AppError::Config(format!(
            "COMPOSE_SUBJECT_HEIGHT_FRACTION 应在 (0, 1] 区间内: {}",
            raw
        )));
    }
    Ok(value)
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, AppError> {
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(AppError::Config(format!("{} 应为正整数: {}", key, raw))),
    }
}
