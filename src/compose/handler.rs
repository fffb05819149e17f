//! # 核心编排模块
//!
//! ## 设计思路
//!
//! `ComposeHandler` 只负责流程编排，不直接与 HTTP 框架绑定。
//! 处理链路固定为：
//! 1. 解码上传并限制主体长边
//! 2. 加载场景与边框（素材问题在任何外部调用之前失败）
//! 3. 可选背景移除、可选按画布比例适配
//! 4. 调用生成式服务
//! 5. 可选叠加边框
//! 6. 落盘照片与二维码，计算公开地址
//! 7. 执行保留策略
//!
//! ## 实现思路
//!
//! - 配置与协作者在启动时构建一次，通过 `Arc` 共享；外部服务都是 trait 对象，测试可替换。
//! - 解码、缩放、合成、编码、写文件全部放到 `spawn_blocking`，不阻塞 reactor。
//! - 记录 `decode/scene/segment/generate/frame/persist/total` 阶段耗时，便于性能诊断。
//! - 请求 future 被丢弃（客户端断开）时，进行中的外部调用随之取消。

use image::{DynamicImage, GenericImageView};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::frame::composite_with_frame;
use super::generative::GenerativeCompositor;
use super::loader::{AssetCache, AssetLookup, decode_upload};
use super::pipeline::{bound_subject, ensure_fittable, fit_subject_to_canvas, normalize_scene};
use super::qr::render_qr;
use super::segmentation::Segmenter;
use super::source::{ComposedArtifact, CompositionRequest, UploadedPhoto};
use super::{ComposeConfig, ComposeError};
use crate::storage::{ArtifactStore, RetentionPolicy, Unlimited, public_urls};

/// 退避与排队的额外余量（秒）。
const GENERATION_BUDGET_SLACK_SECS: u64 = 30;

/// 合成处理器。
///
/// 持有只读配置、素材缓存与所有外部协作者，每个请求独立执行一条流水线。
pub struct ComposeHandler {
    config: Arc<ComposeConfig>,
    assets: Arc<AssetCache>,
    scene_path: PathBuf,
    frame_path: PathBuf,
    compositor: Arc<dyn GenerativeCompositor>,
    segmenter: Option<Arc<dyn Segmenter>>,
    store: ArtifactStore,
    retention: Arc<dyn RetentionPolicy>,
}

impl ComposeHandler {
    /// 创建处理器；背景移除默认关闭，保留策略默认不清理。
    pub fn new(
        config: ComposeConfig,
        compositor: Arc<dyn GenerativeCompositor>,
        store: ArtifactStore,
        scene_path: impl Into<PathBuf>,
        frame_path: impl Into<PathBuf>,
    ) -> Self {
        let assets = Arc::new(AssetCache::new(&config));
        Self {
            config: Arc::new(config),
            assets,
            scene_path: scene_path.into(),
            frame_path: frame_path.into(),
            compositor,
            segmenter: None,
            store,
            retention: Arc::new(Unlimited),
        }
    }

    pub fn with_segmenter(mut self, segmenter: Arc<dyn Segmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn with_retention(mut self, retention: Arc<dyn RetentionPolicy>) -> Self {
        self.retention = retention;
        self
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// 处理主入口：上传照片 → 最终照片与二维码的公开地址。
    ///
    /// `origin` 为对外可访问的 `scheme://host[:port]`。
    pub async fn compose(&self, upload: UploadedPhoto, origin: &str) -> Result<ComposedArtifact, ComposeError> {
        let result = self.run_pipeline(upload, origin).await;

        if let Err(err) = &result {
            if err.is_client_error() {
                log::warn!("⚠️ 拒绝上传 - code={} detail={}", err.code(), err);
            } else {
                log::error!("❌ 合成失败 - code={} stage={} detail={}", err.code(), err.stage(), err);
            }
        }

        result
    }

    async fn run_pipeline(&self, upload: UploadedPhoto, origin: &str) -> Result<ComposedArtifact, ComposeError> {
        let total_start = Instant::now();

        let decode_start = Instant::now();
        let config = Arc::clone(&self.config);
        let subject = run_blocking("decode", move || {
            let decoded = decode_upload(&upload, &config)?;
            let bounded = bound_subject(decoded, &config)?;
            let (width, height) = bounded.dimensions();
            ensure_fittable(width, height, &config)?;
            Ok(bounded)
        })
        .await?;
        let decode_elapsed = decode_start.elapsed();

        let scene_start = Instant::now();
        let scene = self.load_scene().await?;
        let frame = self.load_frame().await?;
        let scene_elapsed = scene_start.elapsed();

        let segment_start = Instant::now();
        let subject = self.prepare_subject(subject).await?;
        let segment_elapsed = segment_start.elapsed();

        let generate_start = Instant::now();
        let request = CompositionRequest {
            subject,
            scene,
            instruction: self.config.instruction().to_string(),
            target_size: (self.config.canvas_width, self.config.canvas_height),
        };
        let generated = self.generate(&request).await?;
        drop(request);
        let generate_elapsed = generate_start.elapsed();

        let frame_start = Instant::now();
        let offset = self.config.frame_offset;
        let artifact_image = run_blocking("frame", move || {
            Ok(composite_with_frame(&generated, frame.as_deref(), offset))
        })
        .await?;
        let frame_elapsed = frame_start.elapsed();

        let persist_start = Instant::now();
        let id = Uuid::new_v4().to_string();
        let (final_url, qr_url) = public_urls(origin, &id);
        self.persist(id.clone(), artifact_image, final_url.clone()).await?;
        let persist_elapsed = persist_start.elapsed();

        self.enforce_retention().await;

        log::info!(
            "✅ 合成完成 - id={} decode={}ms scene={}ms segment={}ms generate={}ms frame={}ms persist={}ms total={}ms",
            id,
            decode_elapsed.as_millis(),
            scene_elapsed.as_millis(),
            segment_elapsed.as_millis(),
            generate_elapsed.as_millis(),
            frame_elapsed.as_millis(),
            persist_elapsed.as_millis(),
            total_start.elapsed().as_millis()
        );

        Ok(ComposedArtifact { id, final_url, qr_url })
    }

    async fn load_scene(&self) -> Result<Arc<DynamicImage>, ComposeError> {
        let assets = Arc::clone(&self.assets);
        let config = Arc::clone(&self.config);
        let path = self.scene_path.clone();

        let lookup = run_blocking("scene", {
            let path = path.clone();
            move || Ok(assets.load(&path, |image| normalize_scene(image, &config)))
        })
        .await?;

        match lookup {
            Ok(AssetLookup::Loaded(scene)) => Ok(scene),
            Ok(AssetLookup::Missing) => Err(ComposeError::SceneAssetMissing(path.display().to_string())),
            Err(reason) => Err(ComposeError::SceneAssetUnreadable(format!("{}：{}", path.display(), reason))),
        }
    }

    /// 边框缺失时降级为无边框；存在但无法解码属于部署错误。
    async fn load_frame(&self) -> Result<Option<Arc<DynamicImage>>, ComposeError> {
        if !self.config.frame_enabled {
            return Ok(None);
        }

        let assets = Arc::clone(&self.assets);
        let path = self.frame_path.clone();

        let lookup = run_blocking("frame", {
            let path = path.clone();
            move || Ok(assets.load(&path, |image| Ok(DynamicImage::ImageRgba8(image.to_rgba8()))))
        })
        .await?;

        match lookup {
            Ok(AssetLookup::Loaded(frame)) => Ok(Some(frame)),
            Ok(AssetLookup::Missing) => {
                log::info!("🖼️ 未找到边框素材，跳过边框叠加 - 路径: {}", path.display());
                Ok(None)
            }
            Err(reason) => Err(ComposeError::Internal(format!(
                "边框素材无法解码 {}：{}",
                path.display(),
                reason
            ))),
        }
    }

    /// 可选背景移除 + 可选比例适配。
    async fn prepare_subject(&self, subject: DynamicImage) -> Result<DynamicImage, ComposeError> {
        let subject = match &self.segmenter {
            Some(segmenter) => {
                let rgba = run_blocking("segment", move || Ok(subject.to_rgba8())).await?;
                DynamicImage::ImageRgba8(segmenter.remove_background(rgba).await?)
            }
            None => subject,
        };

        if self.config.subject_height_fraction.is_none() {
            return Ok(subject);
        }

        let config = Arc::clone(&self.config);
        run_blocking("fit", move || fit_subject_to_canvas(subject, &config)).await
    }

    async fn generate(&self, request: &CompositionRequest) -> Result<DynamicImage, ComposeError> {
        let budget = Duration::from_secs(
            self.config
                .generative_timeout_secs
                .saturating_mul(self.config.network_retry_max_attempts.max(1) as u64)
                .saturating_add(GENERATION_BUDGET_SLACK_SECS),
        );

        log::info!("🚀 开始生成式合成 - 后端: {}", self.compositor.name());

        match tokio::time::timeout(budget, self.compositor.compose(request)).await {
            Ok(result) => result,
            Err(_) => Err(ComposeError::GenerativeCallFailed(format!(
                "{} 在 {} 秒内未完成",
                self.compositor.name(),
                budget.as_secs()
            ))),
        }
    }

    /// 写照片再写二维码；二维码失败时删除已写入的照片。
    async fn persist(&self, id: String, image: image::RgbImage, final_url: String) -> Result<(), ComposeError> {
        let store = self.store.clone();
        let quality = self.config.jpeg_quality;
        let module_pixels = self.config.qr_module_pixels;

        run_blocking("persist", move || {
            store.persist_photo(&id, &image, quality)?;

            let qr_result = render_qr(&final_url, module_pixels).and_then(|qr| store.persist_qr(&id, &qr));
            if let Err(err) = qr_result {
                store.discard(&id);
                return Err(err);
            }
            Ok(())
        })
        .await
    }

    async fn enforce_retention(&self) {
        let store = self.store.clone();
        let retention = Arc::clone(&self.retention);

        let outcome = tokio::task::spawn_blocking(move || store.apply_retention(retention.as_ref())).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => log::warn!("⚠️ 执行保留策略失败: {}", err),
            Err(err) => log::warn!("⚠️ 保留策略线程执行失败: {}", err),
        }
    }
}

/// 在阻塞线程池中执行 CPU / 文件操作。
async fn run_blocking<T, F>(stage: &'static str, work: F) -> Result<T, ComposeError>
where
    F: FnOnce() -> Result<T, ComposeError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ComposeError::Internal(format!("{} 阶段线程执行失败：{}", stage, e)))?
}
