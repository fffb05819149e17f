//! HTTP 服务层
//!
//! # 设计思路
//!
//! 路由层只做三件事：解析 multipart 上传、推导对外地址、把结果序列化为 JSON。
//! 业务流程全部委托给 `ComposeHandler`，静态目录以只读方式挂载在 `/static` 下。
//!
//! # 实现思路
//!
//! - `build_handler` 根据 `Settings` 选择生成后端并组装协作者。
//! - `router` 只依赖 `AppState`，集成测试可以注入桩协作者后直接 `oneshot`。
//! - 对外地址优先取配置的固定地址，否则依次读取 `X-Forwarded-Proto/Host` 与 `Host`。

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::services::ServeDir;

use crate::compose::{
    ComposeHandler, ComposedArtifact, GeminiImageComposer, GenerativeBackendKind, GenerativeCompositor,
    HttpSegmenter, OpenAiImageEditor, UploadedPhoto,
};
use crate::error::AppError;
use crate::settings::Settings;
use crate::storage::{ArtifactStore, STATIC_PREFIX};

/// multipart 边界与其他字段的额外余量。
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// 路由共享状态。
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<ComposeHandler>,
    /// 固定对外地址；`None` 时按请求头推导。
    pub public_base_url: Option<String>,
}

/// 根据启动配置组装合成处理器。
pub fn build_handler(settings: &Settings) -> Result<ComposeHandler, AppError> {
    let compositor: Arc<dyn GenerativeCompositor> = match settings.backend {
        GenerativeBackendKind::OpenAi => Arc::new(OpenAiImageEditor::new(
            settings.api_key.as_str(),
            settings.generative_base_url.as_str(),
            settings.generative_model.as_str(),
            &settings.compose,
        )?),
        GenerativeBackendKind::Gemini => Arc::new(GeminiImageComposer::new(
            settings.api_key.as_str(),
            settings.generative_base_url.as_str(),
            settings.generative_model.as_str(),
            &settings.compose,
        )?),
    };

    let mut handler = ComposeHandler::new(
        settings.compose.clone(),
        compositor,
        ArtifactStore::new(&settings.layout),
        settings.scene_file.clone(),
        settings.frame_file.clone(),
    )
    .with_retention(settings.retention_policy());

    if let Some(url) = &settings.segmentation_url {
        handler = handler.with_segmenter(Arc::new(HttpSegmenter::new(url.as_str(), &settings.compose)?));
    }

    Ok(handler)
}

/// 构建路由。
pub fn router(state: AppState, static_root: impl AsRef<std::path::Path>) -> Router {
    let body_limit = state
        .handler
        .config()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/", get(root))
        .route("/ping", get(ping))
        .route("/compose", post(compose_photo))
        .nest_service(STATIC_PREFIX, ServeDir::new(static_root.as_ref()))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// 创建目录、组装处理器并开始监听，直到收到退出信号。
pub async fn serve(settings: Settings) -> Result<(), AppError> {
    settings.layout.ensure()?;

    let handler = build_handler(&settings)?;
    let stats = handler.store().stats();
    log::info!(
        "📁 静态目录: {} 现有文件: {} 占用: {}KB",
        stats.path,
        stats.file_count,
        stats.total_size / 1024
    );

    let state = AppState {
        handler: Arc::new(handler),
        public_base_url: settings.public_base_url.clone(),
    };
    let app = router(state, &settings.layout.static_root);

    let listener = tokio::net::TcpListener::bind(&settings.bind)
        .await
        .map_err(|e| AppError::Config(format!("无法监听 {}: {}", settings.bind, e)))?;
    log::info!("🚀 服务已启动: http://{}", settings.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("👋 服务已退出");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("⚠️ 监听退出信号失败: {err}");
        std::future::pending::<()>().await;
    }
    log::info!("🛑 收到退出信号，停止接收新请求");
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "message": "照片合成服务运行中" }))
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "msg": "pong" }))
}

async fn compose_photo(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ComposedArtifact>, AppError> {
    let mut multipart = multipart.map_err(|e| AppError::BadUpload(e.to_string()))?;
    let upload = read_upload(&mut multipart).await?;
    let origin = request_origin(state.public_base_url.as_deref(), &headers);

    log::info!(
        "📥 收到上传 - 文件: {} 大小: {}KB",
        upload.file_name.as_deref().unwrap_or("<未命名>"),
        upload.bytes.len() / 1024
    );

    let artifact = state.handler.compose(upload, &origin).await?;
    Ok(Json(artifact))
}

/// 读取 `file` 字段；没有时接受第一个文件字段。
async fn read_upload(multipart: &mut Multipart) -> Result<UploadedPhoto, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadUpload(e.to_string()))?
    {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadUpload(e.to_string()))?;

        return Ok(UploadedPhoto {
            bytes: bytes.to_vec(),
            file_name,
        });
    }

    Err(AppError::BadUpload("缺少文件字段 file".to_string()))
}

/// 推导对外可访问的 `scheme://host`。
pub fn request_origin(public_base_url: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(url) = public_base_url {
        return url.trim_end_matches('/').to_string();
    }

    let first_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let scheme = first_value("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = first_value("x-forwarded-host")
        .or_else(|| first_value(header::HOST.as_str()))
        .unwrap_or_else(|| "localhost".to_string());

    format!("{}://{}", scheme, host)
}
