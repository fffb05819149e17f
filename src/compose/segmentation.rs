//! # 背景移除模块（外部边界）
//!
//! 可选阶段：把主体的背景去掉后再交给生成式服务。
//! 未配置背景移除服务时流水线直接跳过本阶段。

use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};

use super::generative::build_http_client;
use super::pipeline::encode_png;
use super::retry::{RetryPolicy, send_with_retry, truncate_for_log};
use super::{ComposeConfig, ComposeError};

/// 背景移除能力：RGBA 输入，同尺寸 RGBA 输出。
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn remove_background(&self, subject: RgbaImage) -> Result<RgbaImage, ComposeError>;
}

/// 基于 HTTP 的背景移除服务（rembg 风格：上传 `file`，返回带透明通道的图片）。
pub struct HttpSegmenter {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpSegmenter {
    pub fn new(endpoint: impl Into<String>, config: &ComposeConfig) -> Result<Self, ComposeError> {
        Ok(Self {
            client: build_http_client(config.segmentation_timeout_secs, config)?,
            endpoint: endpoint.into(),
            retry: RetryPolicy {
                max_attempts: config.network_retry_max_attempts,
                base_delay_ms: config.network_retry_base_delay_ms,
            },
        })
    }
}

#[async_trait]
impl Segmenter for HttpSegmenter {
    async fn remove_background(&self, subject: RgbaImage) -> Result<RgbaImage, ComposeError> {
        let (width, height) = subject.dimensions();
        let png = tokio::task::spawn_blocking(move || encode_png(&DynamicImage::ImageRgba8(subject)))
            .await
            .map_err(|e| ComposeError::Internal(format!("PNG 编码线程执行失败：{}", e)))??;

        let response = send_with_retry("背景移除", self.retry, || {
            let form = reqwest::multipart::Form::new().part(
                "file",
                reqwest::multipart::Part::bytes(png.clone())
                    .file_name("subject.png")
                    .mime_str("image/png")?,
            );
            Ok(self.client.post(&self.endpoint).multipart(form))
        })
        .await
        .map_err(|e| ComposeError::SegmentationFailed(format!("请求失败：{}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ComposeError::SegmentationFailed(format!("响应读取失败：{}", e)))?;

        if !status.is_success() {
            return Err(ComposeError::SegmentationFailed(format!(
                "HTTP {}：{}",
                status.as_u16(),
                truncate_for_log(&String::from_utf8_lossy(&body), 300)
            )));
        }

        let cutout = tokio::task::spawn_blocking(move || image::load_from_memory(&body).map(|img| img.to_rgba8()))
            .await
            .map_err(|e| ComposeError::Internal(format!("解码线程执行失败：{}", e)))?
            .map_err(|e| ComposeError::SegmentationFailed(format!("结果无法解码：{}", e)))?;

        if cutout.dimensions() != (width, height) {
            return Err(ComposeError::SegmentationFailed(format!(
                "结果尺寸不一致：期望 {}x{}，实际 {}x{}",
                width,
                height,
                cutout.width(),
                cutout.height()
            )));
        }

        Ok(cutout)
    }
}
