//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 定义服务级统一的 `AppError` 枚举：启动阶段的配置/目录错误，
//! 以及请求阶段的上传与合成错误，都收敛到这里。
//!
//! 所有 HTTP 处理函数统一返回 `Result<T, AppError>`，
//! 终端通过 `{"detail": "..."}` 获得人类可读的错误信息。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `ComposeError` / `std::io::Error` 提供 `From` 转换，无需手动 map。
//! - 实现 `IntoResponse`：调用方输入问题返回 400，其余一律 500。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::compose::ComposeError;

/// 服务级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 环境变量缺失或取值非法（启动即失败）
    #[error("配置错误: {0}")]
    Config(String),

    /// 存储目录不可用
    #[error("存储目录不可用: {0}")]
    Storage(String),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 上传请求本身不合法（缺少文件字段、multipart 格式错误等）
    #[error("上传请求无效: {0}")]
    BadUpload(String),

    /// 合成流水线错误
    #[error("{0}")]
    Compose(#[from] ComposeError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadUpload(_) => StatusCode::BAD_REQUEST,
            Self::Compose(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
