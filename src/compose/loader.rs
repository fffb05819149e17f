//! # 加载与校验模块
//!
//! ## 设计思路
//!
//! 统一处理两类输入：终端上传的照片字节，以及本地磁盘上的场景/边框素材。
//! 目标是尽快失败，减少不必要的内存与 CPU 消耗。
//!
//! ## 实现思路
//!
//! - 上传：空内容检查 → 文件签名（magic bytes）→ 读取头部尺寸并做像素上限 → 完整解码。
//! - 素材：按“路径 + 修改时间 + 文件大小”做 LRU 缓存；文件变化或被删除时立即失效。
//! - 所有函数都是同步阻塞实现，由 `handler` 放到 `spawn_blocking` 中执行。

use image::{DynamicImage, GenericImageView};
use lru::LruCache;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::source::UploadedPhoto;
use super::{ComposeConfig, ComposeError};

/// 将上传字节解码为不透明 RGB 图像。
///
/// 任何失败都映射为 `InvalidImageInput`，调用方据此返回 400 且不产生副作用。
pub fn decode_upload(upload: &UploadedPhoto, config: &ComposeConfig) -> Result<DynamicImage, ComposeError> {
    validate_image_signature(&upload.bytes)?;

    let (header_width, header_height) = inspect_dimensions_from_memory(&upload.bytes)?;
    validate_pixel_limits(config, header_width, header_height)?;

    let decoded = image::load_from_memory(&upload.bytes)
        .map_err(|e| ComposeError::InvalidImageInput(format!("图片解码失败：{}", e)))?;

    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(ComposeError::InvalidImageInput("图片尺寸为 0".to_string()));
    }

    log::info!(
        "✅ 上传图片解码成功 - 文件: {} 尺寸: {}x{}",
        upload.file_name.as_deref().unwrap_or("<未命名>"),
        width,
        height
    );

    Ok(DynamicImage::ImageRgb8(decoded.to_rgb8()))
}

/// 通过文件签名校验输入是否为图片。
///
/// `infer` 不认识的签名（如 PNM、QOI）不在此处拒绝，交给 `image` 的格式探测决定。
fn validate_image_signature(bytes: &[u8]) -> Result<(), ComposeError> {
    if bytes.is_empty() {
        return Err(ComposeError::InvalidImageInput("上传内容为空".to_string()));
    }

    let Some(kind) = infer::get(bytes) else {
        return Ok(());
    };

    if kind.matcher_type() != infer::MatcherType::Image {
        return Err(ComposeError::InvalidImageInput(format!(
            "文件签名不是图片类型：{}",
            kind.mime_type()
        )));
    }

    Ok(())
}

/// 仅通过图片头信息读取宽高，用于在完整解码前做像素限制检查。
fn inspect_dimensions_from_memory(bytes: &[u8]) -> Result<(u32, u32), ComposeError> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ComposeError::InvalidImageInput(format!("无法识别图片格式：{}", e)))?
        .into_dimensions()
        .map_err(|e| ComposeError::InvalidImageInput(format!("无法读取图片尺寸：{}", e)))
}

fn validate_pixel_limits(config: &ComposeConfig, width: u32, height: u32) -> Result<(), ComposeError> {
    let pixels = (width as u64) * (height as u64);

    if pixels > config.max_decoded_pixels {
        return Err(ComposeError::InvalidImageInput(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, config.max_decoded_pixels
        )));
    }

    Ok(())
}

/// 素材查找结果。
pub(crate) enum AssetLookup {
    /// 文件不存在。
    Missing,
    /// 已加载（可能来自缓存）。
    Loaded(Arc<DynamicImage>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct AssetStamp {
    modified: SystemTime,
    len: u64,
}

struct CachedAsset {
    stamp: AssetStamp,
    image: Arc<DynamicImage>,
}

/// 本地素材缓存。
///
/// 键为素材路径；命中时还会比对修改时间与文件大小，任一变化即视为失效。
pub(crate) struct AssetCache {
    enabled: bool,
    entries: Mutex<LruCache<PathBuf, CachedAsset>>,
}

impl AssetCache {
    pub(crate) fn new(config: &ComposeConfig) -> Self {
        let capacity = NonZeroUsize::new(config.asset_cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: config.asset_cache_enabled,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 读取素材并用 `prepare` 做一次性预处理；预处理结果才是被缓存的内容。
    ///
    /// `Err` 携带“文件存在但无法读取/解码”的原因。
    pub(crate) fn load<F>(&self, path: &Path, prepare: F) -> Result<AssetLookup, String>
    where
        F: FnOnce(DynamicImage) -> Result<DynamicImage, ComposeError>,
    {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                self.forget(path);
                return Ok(AssetLookup::Missing);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.forget(path);
                return Ok(AssetLookup::Missing);
            }
            Err(e) => return Err(format!("无法读取文件信息：{}", e)),
        };

        let stamp = metadata.modified().ok().map(|modified| AssetStamp {
            modified,
            len: metadata.len(),
        });

        if let Some(stamp) = stamp {
            if let Some(image) = self.cached(path, stamp) {
                log::debug!("♻️ 命中素材缓存 - 路径: {}", path.display());
                return Ok(AssetLookup::Loaded(image));
            }
        }

        let bytes = std::fs::read(path).map_err(|e| format!("无法读取文件：{}", e))?;
        let decoded = image::load_from_memory(&bytes).map_err(|e| format!("解码失败：{}", e))?;
        let prepared = Arc::new(prepare(decoded).map_err(|e| e.to_string())?);

        log::info!(
            "📁 已加载素材 - 路径: {} 尺寸: {}x{}",
            path.display(),
            prepared.width(),
            prepared.height()
        );

        if let Some(stamp) = stamp {
            self.store(path, stamp, Arc::clone(&prepared));
        }

        Ok(AssetLookup::Loaded(prepared))
    }

    fn cached(&self, path: &Path, stamp: AssetStamp) -> Option<Arc<DynamicImage>> {
        if !self.enabled {
            return None;
        }

        let mut entries = self.entries.lock().ok()?;
        match entries.get(path) {
            Some(entry) if entry.stamp == stamp => Some(Arc::clone(&entry.image)),
            Some(_) => {
                entries.pop(path);
                None
            }
            None => None,
        }
    }

    fn store(&self, path: &Path, stamp: AssetStamp, image: Arc<DynamicImage>) {
        if !self.enabled {
            return;
        }

        if let Ok(mut entries) = self.entries.lock() {
            entries.put(path.to_path_buf(), CachedAsset { stamp, image });
        }
    }

    fn forget(&self, path: &Path) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.pop(path);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}
