//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载合成链路中的所有失败点，避免字符串拼接式错误处理。
//! 通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配。
//!
//! 每个分支都能给出稳定的 `code()` 与 `stage()`，便于日志检索；
//! `is_client_error()` 决定 HTTP 层返回 400 还是 500。

/// 合成流水线统一错误类型。
///
/// 该类型会在 HTTP 层被上转为 `AppError`，最终以 `{detail}` 形式返回给终端。
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("上传的文件不是有效的图片：{0}")]
    InvalidImageInput(String),

    #[error("场景素材不存在：{0}")]
    SceneAssetMissing(String),

    #[error("场景素材无法解码：{0}")]
    SceneAssetUnreadable(String),

    #[error("背景移除失败：{0}")]
    SegmentationFailed(String),

    #[error("调用生成式图片服务失败：{0}")]
    GenerativeCallFailed(String),

    #[error("生成式图片服务未返回图片：{0}")]
    GenerativeResponseEmpty(String),

    #[error("生成式图片服务返回的内容无法解码：{0}")]
    GenerativeResponseUndecodable(String),

    #[error("保存最终图片失败：{0}")]
    ArtifactPersistFailed(String),

    #[error("保存二维码失败：{0}")]
    QrPersistFailed(String),

    #[error("内部错误：{0}")]
    Internal(String),
}

impl ComposeError {
    /// 稳定的机器可读错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidImageInput(_) => "invalid_image_input",
            Self::SceneAssetMissing(_) => "scene_asset_missing",
            Self::SceneAssetUnreadable(_) => "scene_asset_unreadable",
            Self::SegmentationFailed(_) => "segmentation_failed",
            Self::GenerativeCallFailed(_) => "generative_call_failed",
            Self::GenerativeResponseEmpty(_) => "generative_response_empty",
            Self::GenerativeResponseUndecodable(_) => "generative_response_undecodable",
            Self::ArtifactPersistFailed(_) => "artifact_persist_failed",
            Self::QrPersistFailed(_) => "qr_persist_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// 出错所在的流水线阶段。
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidImageInput(_) => "decode",
            Self::SceneAssetMissing(_) | Self::SceneAssetUnreadable(_) => "scene",
            Self::SegmentationFailed(_) => "segment",
            Self::GenerativeCallFailed(_)
            | Self::GenerativeResponseEmpty(_)
            | Self::GenerativeResponseUndecodable(_) => "generate",
            Self::ArtifactPersistFailed(_) => "persist",
            Self::QrPersistFailed(_) => "qr",
            Self::Internal(_) => "internal",
        }
    }

    /// 是否属于调用方输入问题（HTTP 400）。
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidImageInput(_))
    }
}
