//! # 照片合成服务 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                终端 (Kiosk / Unity 客户端)               │
//! │        POST /compose (multipart)   GET /static/...       │
//! └───────┬──────────────────────────────────────────────────┘
//!         ↕ HTTP JSON ({final_url, qr_url} | {detail})
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↕            后端 (Rust)                           │
//! │                                                          │
//! │  ┌─ server ───── axum 路由 + 静态目录                     │
//! │  │                                                       │
//! │  ├─ compose ──── ComposeHandler 流程编排                  │
//! │  │   ├─ loader        上传解码 / 素材缓存                 │
//! │  │   ├─ pipeline      长边限制 / 比例适配 / 场景归一化     │
//! │  │   ├─ segmentation  背景移除（可选）                    │
//! │  │   ├─ generative    OpenAI / Gemini 生成式合成          │
//! │  │   ├─ frame         边框叠加                            │
//! │  │   └─ qr            二维码渲染                          │
//! │  │                                                       │
//! │  ├─ storage ──── 目录布局 / 产物落盘 / 保留策略           │
//! │  ├─ settings ─── 环境变量配置                             │
//! │  └─ error ────── AppError (统一错误类型)                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `AppError`，决定 400 / 500 与 `{detail}` 响应体 |
//! | [`compose`] | 解码、主体准备、场景加载、生成式调用、边框叠加、二维码 |
//! | [`storage`] | 固定目录布局、照片与二维码落盘、公开地址、保留策略 |
//! | [`settings`] | 从环境变量与 `.env` 构建启动配置 |
//! | [`server`] | axum 路由、multipart 解析、对外地址推导 |

pub mod error;
pub mod compose;
pub mod server;
pub mod settings;
pub mod storage;
