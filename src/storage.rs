//! 产物存储与保留策略模块
//!
//! # 设计思路
//!
//! 统一管理服务的固定目录布局（素材目录 + 对外只读的静态目录），
//! 以及最终照片和二维码的落盘、寻址与清理。
//!
//! # 实现思路
//!
//! - 启动时 `StorageLayout::ensure` 一次性创建所有目录，上层不再判断。
//! - 每个产物用全新的 UUID v4 命名：`fotos/<id>.jpg` 与 `qr/<id>.png`，写入后不再修改。
//! - 先写临时文件再 `rename`，静态文件服务永远看不到半截文件。
//! - 删除只通过显式的 `RetentionPolicy` 发生，默认不删除。
//! - 所有写入函数都是同步阻塞实现，由调用方放到 `spawn_blocking` 中执行。

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, ImageFormat, RgbImage};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::compose::ComposeError;
use crate::error::AppError;

/// 静态目录对外挂载的 URL 前缀。
pub const STATIC_PREFIX: &str = "/static";
const PHOTOS_DIR_NAME: &str = "fotos";
const QR_DIR_NAME: &str = "qr";

/// 服务使用的固定目录布局。
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base: PathBuf,
    /// 场景与边框素材目录。
    pub assets: PathBuf,
    /// 以 `/static` 只读对外提供的根目录。
    pub static_root: PathBuf,
    pub photos: PathBuf,
    pub qr: PathBuf,
}

impl StorageLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let static_root = base.join("static");
        Self {
            assets: base.join("assets"),
            photos: static_root.join(PHOTOS_DIR_NAME),
            qr: static_root.join(QR_DIR_NAME),
            static_root,
            base,
        }
    }

    /// 创建所有目录（已存在时不做任何事）。
    pub fn ensure(&self) -> Result<(), AppError> {
        for dir in [&self.assets, &self.static_root, &self.photos, &self.qr] {
            fs::create_dir_all(dir).map_err(|e| {
                AppError::Storage(format!("创建目录 '{}' 失败: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// 最终照片与二维码的公开地址。
pub fn public_urls(origin: &str, id: &str) -> (String, String) {
    let origin = origin.trim_end_matches('/');
    (
        format!("{}{}/{}/{}.jpg", origin, STATIC_PREFIX, PHOTOS_DIR_NAME, id),
        format!("{}{}/{}/{}.png", origin, STATIC_PREFIX, QR_DIR_NAME, id),
    )
}

/// 存储目录信息（路径 + 占用大小 + 文件数）
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub path: String,
    pub total_size: u64,
    pub file_count: u64,
}

/// 已落盘的一组产物。
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub id: String,
    pub photo_bytes: u64,
    pub created_at: DateTime<Local>,
}

/// 照片与二维码的读写入口。
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    photos: PathBuf,
    qr: PathBuf,
}

impl ArtifactStore {
    pub fn new(layout: &StorageLayout) -> Self {
        Self {
            photos: layout.photos.clone(),
            qr: layout.qr.clone(),
        }
    }

    pub fn photo_path(&self, id: &str) -> PathBuf {
        self.photos.join(format!("{}.jpg", id))
    }

    pub fn qr_path(&self, id: &str) -> PathBuf {
        self.qr.join(format!("{}.png", id))
    }

    /// 以基线 JPEG 写入最终照片。
    pub fn persist_photo(&self, id: &str, image: &RgbImage, quality: u8) -> Result<PathBuf, ComposeError> {
        let path = self.photo_path(id);
        write_atomically(&path, |writer| {
            JpegEncoder::new_with_quality(writer, quality.clamp(1, 100))
                .encode_image(image)
                .map_err(|e| e.to_string())
        })
        .map_err(|e| ComposeError::ArtifactPersistFailed(format!("{}：{}", path.display(), e)))?;

        log::info!("💾 已保存照片 - 路径: {}", path.display());
        Ok(path)
    }

    pub fn persist_qr(&self, id: &str, qr: &GrayImage) -> Result<PathBuf, ComposeError> {
        let path = self.qr_path(id);
        write_atomically(&path, |writer| {
            let mut cursor = std::io::Cursor::new(Vec::new());
            qr.write_to(&mut cursor, ImageFormat::Png)
                .map_err(|e| e.to_string())?;
            writer.write_all(cursor.get_ref()).map_err(|e| e.to_string())
        })
        .map_err(|e| ComposeError::QrPersistFailed(format!("{}：{}", path.display(), e)))?;

        log::info!("💾 已保存二维码 - 路径: {}", path.display());
        Ok(path)
    }

    /// 删除一组产物；文件不存在不算错误。
    pub fn discard(&self, id: &str) {
        for path in [self.photo_path(id), self.qr_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => log::info!("🗑️ 已删除产物文件 - 路径: {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("⚠️ 删除产物文件失败 - 路径: {} 错误: {}", path.display(), e),
            }
        }
    }

    /// 按照片文件列出所有产物。
    pub fn list_artifacts(&self) -> Result<Vec<ArtifactEntry>, AppError> {
        let mut artifacts = Vec::new();

        for entry in fs::read_dir(&self.photos)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jpg") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let created_at = metadata
                .modified()
                .map(DateTime::<Local>::from)
                .unwrap_or_else(|_| Local::now());

            artifacts.push(ArtifactEntry {
                id: id.to_string(),
                photo_bytes: metadata.len(),
                created_at,
            });
        }

        Ok(artifacts)
    }

    /// 静态目录占用统计（照片 + 二维码）。
    pub fn stats(&self) -> StorageInfo {
        let mut total_size: u64 = 0;
        let mut file_count: u64 = 0;

        for dir in [&self.photos, &self.qr] {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    if let Ok(metadata) = entry.metadata() {
                        if metadata.is_file() {
                            total_size += metadata.len();
                            file_count += 1;
                        }
                    }
                }
            }
        }

        StorageInfo {
            path: self
                .photos
                .parent()
                .unwrap_or(&self.photos)
                .to_string_lossy()
                .to_string(),
            total_size,
            file_count,
        }
    }

    /// 执行保留策略，返回被删除的产物组数。
    pub fn apply_retention(&self, policy: &dyn RetentionPolicy) -> Result<usize, AppError> {
        let artifacts = self.list_artifacts()?;
        let expired = policy.expired(&artifacts);

        for id in &expired {
            self.discard(id);
        }

        if !expired.is_empty() {
            log::info!(
                "🧹 保留策略 {} 清理了 {} 组产物（清理前共 {} 组）",
                policy.name(),
                expired.len(),
                artifacts.len()
            );
        }

        Ok(expired.len())
    }
}

fn write_atomically<F>(path: &Path, write: F) -> Result<(), String>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> Result<(), String>,
{
    let partial = path.with_extension("part");

    let result = (|| {
        let file = fs::File::create(&partial).map_err(|e| e.to_string())?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush().map_err(|e| e.to_string())?;
        fs::rename(&partial, path).map_err(|e| e.to_string())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

/// 产物保留策略。
pub trait RetentionPolicy: Send + Sync {
    fn name(&self) -> String;

    /// 返回应删除的产物 id。
    fn expired(&self, artifacts: &[ArtifactEntry]) -> Vec<String>;
}

/// 永不删除（默认）。
pub struct Unlimited;

impl RetentionPolicy for Unlimited {
    fn name(&self) -> String {
        "unlimited".to_string()
    }

    fn expired(&self, _artifacts: &[ArtifactEntry]) -> Vec<String> {
        Vec::new()
    }
}

/// 只保留最新的 N 组产物。
pub struct KeepLatest(pub usize);

impl RetentionPolicy for KeepLatest {
    fn name(&self) -> String {
        format!("keep-latest({})", self.0)
    }

    fn expired(&self, artifacts: &[ArtifactEntry]) -> Vec<String> {
        let mut ordered: Vec<&ArtifactEntry> = artifacts.iter().collect();
        ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        ordered.into_iter().skip(self.0).map(|entry| entry.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use image::{Luma, Rgb};

    fn store_in(dir: &Path) -> (StorageLayout, ArtifactStore) {
        let layout = StorageLayout::new(dir);
        layout.ensure().expect("ensure failed");
        let store = ArtifactStore::new(&layout);
        (layout, store)
    }

    fn entry(id: &str, minutes_ago: i64) -> ArtifactEntry {
        ArtifactEntry {
            id: id.to_string(),
            photo_bytes: 1,
            created_at: Local::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn ensure_creates_full_layout() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let (layout, _) = store_in(dir.path());

        assert!(layout.assets.is_dir());
        assert!(layout.photos.is_dir());
        assert!(layout.qr.is_dir());
        assert!(layout.photos.starts_with(&layout.static_root));
    }

    #[test]
    fn public_urls_follow_static_layout() {
        let (photo, qr) = public_urls("http://totem.local:8000/", "abc");

        assert_eq!(photo, "http://totem.local:8000/static/fotos/abc.jpg");
        assert_eq!(qr, "http://totem.local:8000/static/qr/abc.png");
    }

    #[test]
    fn persisted_photo_is_a_decodable_jpeg() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let (_, store) = store_in(dir.path());

        let path = store
            .persist_photo("id-1", &RgbImage::from_pixel(20, 10, Rgb([10, 200, 30])), 95)
            .expect("persist failed");

        let bytes = fs::read(&path).expect("read failed");
        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
        let decoded = image::load_from_memory(&bytes).expect("decode failed");
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
        assert!(!path.with_extension("part").exists());
    }

    #[test]
    fn persist_photo_fails_when_directory_is_gone() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let (layout, store) = store_in(dir.path());
        fs::remove_dir_all(&layout.photos).expect("remove failed");

        let result = store.persist_photo("id-1", &RgbImage::new(4, 4), 95);
        assert!(matches!(result, Err(ComposeError::ArtifactPersistFailed(_))));
    }

    #[test]
    fn discard_removes_both_files_and_tolerates_missing() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let (_, store) = store_in(dir.path());

        store.persist_photo("gone", &RgbImage::new(4, 4), 95).expect("persist failed");
        store
            .persist_qr("gone", &GrayImage::from_pixel(4, 4, Luma([0])))
            .expect("persist failed");

        store.discard("gone");
        store.discard("gone");

        assert!(!store.photo_path("gone").exists());
        assert!(!store.qr_path("gone").exists());
        assert_eq!(store.stats().file_count, 0);
    }

    #[test]
    fn keep_latest_selects_only_oldest() {
        let artifacts = vec![entry("old", 30), entry("newest", 1), entry("middle", 10)];

        assert_eq!(KeepLatest(2).expired(&artifacts), vec!["old".to_string()]);
        assert_eq!(KeepLatest(5).expired(&artifacts), Vec::<String>::new());
        assert!(Unlimited.expired(&artifacts).is_empty());
    }

    #[test]
    fn apply_retention_deletes_expired_pairs() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let (_, store) = store_in(dir.path());

        for id in ["a", "b", "c"] {
            store.persist_photo(id, &RgbImage::new(4, 4), 95).expect("persist failed");
            store.persist_qr(id, &GrayImage::new(4, 4)).expect("persist failed");
        }

        let removed = store.apply_retention(&KeepLatest(1)).expect("retention failed");

        assert_eq!(removed, 2);
        assert_eq!(store.list_artifacts().expect("list failed").len(), 1);
        assert_eq!(store.stats().file_count, 2);
    }
}
