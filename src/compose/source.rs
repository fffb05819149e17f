//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入”和“流水线中间结果”解耦：
//! - `UploadedPhoto` 表示终端上传、尚未解码的字节
//! - `CompositionRequest` 表示交给生成式服务的一次合成请求
//! - `ComposedArtifact` 表示已经落盘并可寻址的最终产物

use image::DynamicImage;
use std::sync::Arc;

/// 终端上传的原始照片。
pub struct UploadedPhoto {
    /// 原始图片字节。
    pub bytes: Vec<u8>,
    /// 上传时携带的文件名（仅用于日志）。
    pub file_name: Option<String>,
}

/// 一次生成式合成请求。
///
/// 每次上传构建一次，外部调用返回（或失败）后即丢弃。
pub struct CompositionRequest {
    /// 已准备好的主体图（可能已抠图、已按比例适配）。
    pub subject: DynamicImage,
    /// 已归一化到画布尺寸的场景图（与素材缓存共享）。
    pub scene: Arc<DynamicImage>,
    /// 合成指令文本。
    pub instruction: String,
    /// 目标输出尺寸（宽, 高）。
    pub target_size: (u32, u32),
}

/// 已持久化的最终产物。
#[derive(Debug, Clone, serde::Serialize)]
pub struct ComposedArtifact {
    /// 唯一标识（UUID v4）。
    #[serde(skip)]
    pub id: String,
    /// 最终图片的公开地址。
    pub final_url: String,
    /// 指向最终图片的二维码公开地址。
    pub qr_url: String,
}
