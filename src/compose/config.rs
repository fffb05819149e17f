//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `ComposeConfig`，保证运行时行为可观测、可调整、可测试。
//! 原先几个近似重复的接口变体（是否抠图、是否叠加边框、提示词风格、生成后端）
//! 在这里收敛为同一条流水线上的配置开关。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的配置（1024 画布、Lanczos3、JPEG 95）。
//! - `PromptStyle` 负责风格字符串解析与反向输出，并映射到内置提示词。
//! - `GenerativeBackendKind` 描述使用哪个生成式服务。
//! - 配置在进程启动时构建一次，之后只读共享。

use image::imageops::FilterType;

const PHOTOREALISTIC_PROMPT: &str = "\
Use the FIRST image as the exact reference of the person:
- keep face, age, expression, hair, skin tone and clothing
- do not change logos, colors or text on the clothing

Use the SECOND image as the scene.
- cut the person out of the first image
- place the person standing in the foreground, centered, looking at the camera
- match lighting, shadows and colors with the scene
- do not stylize as a drawing; keep a realistic photographic style

Return a single final image with the person inserted into the scene.";

const STYLIZED_PROMPT: &str = "\
Use the FIRST image as the reference of the person:
- keep the face recognizable, with the same age, expression, hair and skin tone
- keep the clothing shapes and colors

Use the SECOND image as the scene.
- cut the person out of the first image
- place the person standing in the foreground, centered, looking at the camera
- render the whole picture as a colorful illustrated poster, person and scene in the same style

Return a single final image with the person inserted into the scene.";

/// 合成流水线配置。
///
/// 字段覆盖了解码限制、主体准备、场景画布、边框叠加、持久化与外部调用五个阶段。
#[derive(Debug, Clone)]
pub struct ComposeConfig {
    /// 上传请求体允许的最大字节数。
    pub max_upload_bytes: usize,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 主体长边上限，超过时等比缩小，绝不放大。
    pub max_subject_dimension: u32,
    /// 生成画布宽度。
    pub canvas_width: u32,
    /// 生成画布高度。
    pub canvas_height: u32,
    /// 所有缩放共用的滤镜。
    pub resize_filter: FilterType,
    /// 主体高度占画布高度的比例；`None` 表示不做本地比例适配。
    pub subject_height_fraction: Option<f32>,
    /// 是否尝试叠加边框素材（素材缺失时自动降级）。
    pub frame_enabled: bool,
    /// 生成图在边框画布上的固定偏移。
    pub frame_offset: (u32, u32),
    /// 最终 JPEG 质量。
    pub jpeg_quality: u8,
    /// 二维码单个模块的像素尺寸。
    pub qr_module_pixels: u32,
    /// 提示词风格。
    pub prompt_style: PromptStyle,
    /// 自定义提示词，设置后覆盖 `prompt_style`。
    pub prompt_override: Option<String>,
    /// 生成式调用整体超时（秒）。
    pub generative_timeout_secs: u64,
    /// 背景移除调用整体超时（秒）。
    pub segmentation_timeout_secs: u64,
    /// 建立连接（TCP/TLS）超时时间（秒）。
    pub connect_timeout_secs: u64,
    /// 外部调用最大尝试次数（含首次）。
    pub network_retry_max_attempts: u8,
    /// 重试基础退避（毫秒）。
    pub network_retry_base_delay_ms: u64,
    /// 是否按“路径 + 修改时间”缓存场景与边框素材。
    pub asset_cache_enabled: bool,
    /// 素材缓存条目上限。
    pub asset_cache_capacity: usize,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 50 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            max_subject_dimension: 1024,
            canvas_width: 1024,
            canvas_height: 1024,
            resize_filter: FilterType::Lanczos3,
            subject_height_fraction: None,
            frame_enabled: true,
            frame_offset: (20, 270),
            jpeg_quality: 95,
            qr_module_pixels: 10,
            prompt_style: PromptStyle::Photorealistic,
            prompt_override: None,
            generative_timeout_secs: 180,
            segmentation_timeout_secs: 60,
            connect_timeout_secs: 10,
            network_retry_max_attempts: 2,
            network_retry_base_delay_ms: 500,
            asset_cache_enabled: true,
            asset_cache_capacity: 4,
        }
    }
}

impl ComposeConfig {
    /// 本次请求实际发送给生成式服务的指令文本。
    pub fn instruction(&self) -> &str {
        match self.prompt_override.as_deref() {
            Some(custom) if !custom.trim().is_empty() => custom,
            _ => self.prompt_style.instruction(),
        }
    }

    /// 画布尺寸的 `宽x高` 表示，供生成式服务的 `size` 参数使用。
    pub fn canvas_size_label(&self) -> String {
        format!("{}x{}", self.canvas_width, self.canvas_height)
    }
}

/// 提示词风格。
///
/// - `Photorealistic`：保持写实摄影风格
/// - `Stylized`：插画海报风格
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    Photorealistic,
    Stylized,
}

impl PromptStyle {
    /// 从外部字符串解析风格。
    ///
    /// # 示例
    /// ```rust
    /// use totem_compose::compose::PromptStyle;
    ///
    /// let style = PromptStyle::from_str("stylized").unwrap();
    /// assert_eq!(style.as_str(), "stylized");
    /// ```
    pub fn from_str(style: &str) -> Result<Self, String> {
        match style.trim().to_lowercase().as_str() {
            "photorealistic" | "realistic" => Ok(Self::Photorealistic),
            "stylized" => Ok(Self::Stylized),
            other => Err(format!(
                "未知提示词风格：{}（可选：photorealistic / stylized）",
                other
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photorealistic => "photorealistic",
            Self::Stylized => "stylized",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Self::Photorealistic => PHOTOREALISTIC_PROMPT,
            Self::Stylized => STYLIZED_PROMPT,
        }
    }
}

/// 生成式图片服务后端。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerativeBackendKind {
    OpenAi,
    Gemini,
}

impl GenerativeBackendKind {
    pub fn from_str(backend: &str) -> Result<Self, String> {
        match backend.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            other => Err(format!("未知生成后端：{}（可选：openai / gemini）", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    /// 该后端读取凭据的环境变量名。
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}
