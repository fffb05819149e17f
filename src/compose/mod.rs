//! # 照片合成模块
//!
//! ## 模块职责
//!
//! - `config`：流水线配置与提示词风格
//! - `error`：统一错误模型
//! - `source`：上传输入、生成请求与最终产物模型
//! - `loader`：上传解码校验、场景/边框素材缓存
//! - `pipeline`：长边限制、比例适配、场景归一化、PNG 编码
//! - `segmentation`：可选的背景移除服务
//! - `generative`：生成式图片服务（OpenAI / Gemini）
//! - `frame`：边框叠加
//! - `qr`：二维码渲染
//! - `retry`：外部调用的超时重试
//! - `handler`：流程编排

mod config;
mod error;
mod frame;
mod generative;
mod handler;
mod loader;
mod pipeline;
mod qr;
mod retry;
mod segmentation;
mod source;

#[cfg(test)]
mod test_support;

pub use config::{ComposeConfig, GenerativeBackendKind, PromptStyle};
pub use error::ComposeError;
pub use frame::composite_with_frame;
pub use generative::{GeminiImageComposer, GenerativeCompositor, OpenAiImageEditor};
pub use handler::ComposeHandler;
pub use loader::decode_upload;
pub use pipeline::{bounded_dimensions, encode_png, fitted_dimensions, resize_image};
pub use qr::render_qr;
pub use segmentation::{HttpSegmenter, Segmenter};
pub use source::{ComposedArtifact, CompositionRequest, UploadedPhoto};
