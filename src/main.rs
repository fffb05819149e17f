//! # 照片合成服务 — 应用入口
//!
//! 本文件仅负责日志初始化、读取配置与启动服务。
//! 业务逻辑分布在各子模块中，详见 `lib.rs` 架构文档。

use totem_compose::error::AppError;
use totem_compose::server;
use totem_compose::settings::Settings;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        log::error!("❌ 服务启动失败: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let settings = Settings::from_env()?;
    settings.log_summary();
    server::serve(settings).await
}
