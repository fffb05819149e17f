//! 通过 axum 路由驱动完整合成流程（生成式服务用桩实现替代）。

use async_trait::async_trait;
use axum::body::Body;
use futures::future::join_all;
use axum::http::{Request, StatusCode, header};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use totem_compose::compose::{
    ComposeConfig, ComposeError, ComposeHandler, CompositionRequest, GenerativeCompositor,
};
use totem_compose::server::{AppState, router};
use totem_compose::storage::{ArtifactStore, StorageLayout};

const BOUNDARY: &str = "totem-test-boundary";

enum Outcome {
    Solid { width: u32, height: u32 },
    Fail,
}

struct StubCompositor {
    outcome: Outcome,
    calls: AtomicUsize,
    seen: Mutex<Vec<((u32, u32), (u32, u32))>>,
}

impl StubCompositor {
    fn new(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeCompositor for StubCompositor {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn compose(&self, request: &CompositionRequest) -> Result<DynamicImage, ComposeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("lock poisoned")
            .push((request.subject.dimensions(), request.scene.dimensions()));

        match self.outcome {
            Outcome::Solid { width, height } => Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                width,
                height,
                Rgb([0, 0, 255]),
            ))),
            Outcome::Fail => Err(ComposeError::GenerativeCallFailed("quota exceeded".to_string())),
        }
    }
}

struct TestApp {
    _dir: tempfile::TempDir,
    layout: StorageLayout,
    app: axum::Router,
}

impl TestApp {
    fn new(compositor: Arc<StubCompositor>, config: ComposeConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let layout = StorageLayout::new(dir.path());
        layout.ensure().expect("ensure failed");

        let handler = ComposeHandler::new(
            config,
            compositor,
            ArtifactStore::new(&layout),
            layout.assets.join("scene.png"),
            layout.assets.join("frame.png"),
        );
        let state = AppState {
            handler: Arc::new(handler),
            public_base_url: None,
        };
        let app = router(state, &layout.static_root);

        Self { _dir: dir, layout, app }
    }

    fn write_scene(&self, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, Rgb([0, 120, 0]))
            .save_with_format(self.layout.assets.join("scene.png"), ImageFormat::Png)
            .expect("write scene failed");
    }

    fn write_frame(&self, frame: &RgbaImage) {
        frame
            .save_with_format(self.layout.assets.join("frame.png"), ImageFormat::Png)
            .expect("write frame failed");
    }

    fn files_in(&self, dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    fn artifact_count(&self) -> usize {
        self.files_in(&self.layout.photos) + self.files_in(&self.layout.qr)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.app.clone().oneshot(request).await.expect("request failed");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body failed");
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}

fn jpeg_upload(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 80]));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut cursor, ImageFormat::Jpeg)
        .expect("encode jpeg failed");
    cursor.into_inner()
}

fn compose_request(field: &str, file_name: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/compose")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .header(header::HOST, "kiosk.test:8000")
        .body(Body::from(body))
        .expect("build request failed")
}

fn id_from_url(url: &str, prefix: &str, extension: &str) -> String {
    url.strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(extension))
        .unwrap_or_else(|| panic!("unexpected url: {url}"))
        .to_string()
}

fn assert_close(actual: &Rgb<u8>, expected: [u8; 3], tolerance: u8) {
    for (a, e) in actual.0.iter().zip(expected) {
        assert!(a.abs_diff(e) <= tolerance, "pixel {:?} not close to {:?}", actual.0, expected);
    }
}

#[tokio::test]
async fn scenario_a_large_jpeg_is_bounded_and_persisted() {
    let compositor = StubCompositor::new(Outcome::Solid { width: 1024, height: 1024 });
    let app = TestApp::new(compositor.clone(), ComposeConfig::default());
    app.write_scene(300, 200);

    let (status, json) = app.send(compose_request("file", "person.jpg", &jpeg_upload(2000, 1000))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(compositor.seen.lock().expect("lock").as_slice(), &[((1024, 512), (1024, 1024))]);

    let final_url = json["final_url"].as_str().expect("final_url missing");
    let qr_url = json["qr_url"].as_str().expect("qr_url missing");
    let id = id_from_url(final_url, "http://kiosk.test:8000/static/fotos/", ".jpg");
    assert_eq!(id_from_url(qr_url, "http://kiosk.test:8000/static/qr/", ".png"), id);
    assert!(json.get("detail").is_none());

    let photo_bytes = std::fs::read(app.layout.photos.join(format!("{id}.jpg"))).expect("photo missing");
    assert_eq!(image::guess_format(&photo_bytes).expect("unknown format"), ImageFormat::Jpeg);
    let photo = image::load_from_memory(&photo_bytes).expect("decode failed").to_rgb8();
    assert_eq!(photo.dimensions(), (1024, 1024));
    // 无边框时成品即生成图本身（JPEG 有损，留容差）
    for (x, y, pixel) in photo.enumerate_pixels() {
        if x % 37 == 0 && y % 41 == 0 {
            assert_close(pixel, [0, 0, 255], 12);
        }
    }
    assert!(app.layout.qr.join(format!("{id}.png")).is_file());

    let static_request = Request::builder()
        .uri(format!("/static/fotos/{id}.jpg"))
        .body(Body::empty())
        .expect("build request failed");
    let response = app.app.clone().oneshot(static_request).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn scenario_b_non_image_upload_is_rejected() {
    let compositor = StubCompositor::new(Outcome::Solid { width: 64, height: 64 });
    let app = TestApp::new(compositor.clone(), ComposeConfig::default());
    app.write_scene(64, 64);

    let (status, json) = app
        .send(compose_request("file", "notes.txt", b"this is plain text, not a photo"))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["detail"].as_str().expect("detail missing").contains("不是有效的图片"));
    assert_eq!(compositor.calls(), 0);
    assert_eq!(app.artifact_count(), 0);
}

#[tokio::test]
async fn scenario_c_missing_scene_fails_before_generation() {
    let compositor = StubCompositor::new(Outcome::Solid { width: 64, height: 64 });
    let app = TestApp::new(compositor.clone(), ComposeConfig::default());

    let (status, json) = app.send(compose_request("file", "person.jpg", &jpeg_upload(64, 64))).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["detail"].as_str().expect("detail missing").contains("场景素材不存在"));
    assert_eq!(compositor.calls(), 0);
    assert_eq!(app.artifact_count(), 0);
}

#[tokio::test]
async fn scenario_d_frame_defines_canvas_and_keeps_opaque_pixels() {
    let compositor = StubCompositor::new(Outcome::Solid { width: 200, height: 200 });
    let app = TestApp::new(compositor, ComposeConfig::default());
    app.write_scene(64, 64);

    let (frame_width, frame_height, border) = (400u32, 600u32, 40u32);
    let frame = RgbaImage::from_fn(frame_width, frame_height, |x, y| {
        let in_border = x < border || y < border || x >= frame_width - border || y >= frame_height - border;
        if in_border { Rgba([220, 30, 30, 255]) } else { Rgba([0, 0, 0, 0]) }
    });
    app.write_frame(&frame);

    let (status, json) = app.send(compose_request("file", "person.jpg", &jpeg_upload(64, 64))).await;
    assert_eq!(status, StatusCode::OK);

    let id = id_from_url(
        json["final_url"].as_str().expect("final_url missing"),
        "http://kiosk.test:8000/static/fotos/",
        ".jpg",
    );
    let artifact = image::open(app.layout.photos.join(format!("{id}.jpg")))
        .expect("artifact unreadable")
        .to_rgb8();

    assert_eq!(artifact.dimensions(), (frame_width, frame_height));

    // 默认偏移 (20, 270)，生成图中心区域应为纯蓝
    assert_close(artifact.get_pixel(20 + 100, 270 + 100), [0, 0, 255], 12);

    // 远离边缘过渡区的不透明边框像素保持边框自身颜色（JPEG 有损，留容差）
    let margin = border - 16;
    for (x, y, pixel) in frame.enumerate_pixels() {
        let deep_in_border =
            x < margin || y < margin || x >= frame_width - margin || y >= frame_height - margin;
        if pixel.0[3] == 255 && deep_in_border && (x + y) % 5 == 0 {
            assert_close(artifact.get_pixel(x, y), [220, 30, 30], 12);
        }
    }
}

#[tokio::test]
async fn scenario_e_generative_failure_reports_stage_without_artifacts() {
    let compositor = StubCompositor::new(Outcome::Fail);
    let app = TestApp::new(compositor.clone(), ComposeConfig::default());
    app.write_scene(64, 64);

    let (status, json) = app.send(compose_request("file", "person.jpg", &jpeg_upload(64, 64))).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let detail = json["detail"].as_str().expect("detail missing");
    assert!(detail.contains("生成式图片服务"));
    assert!(detail.contains("quota exceeded"));
    assert_eq!(compositor.calls(), 1);
    assert_eq!(app.artifact_count(), 0);
}

#[tokio::test]
async fn each_compose_gets_a_fresh_identifier() {
    let compositor = StubCompositor::new(Outcome::Solid { width: 32, height: 32 });
    let app = TestApp::new(compositor, ComposeConfig::default());
    app.write_scene(32, 32);

    let mut ids = std::collections::HashSet::new();
    for _ in 0..3 {
        let (status, json) = app.send(compose_request("file", "person.jpg", &jpeg_upload(32, 32))).await;
        assert_eq!(status, StatusCode::OK);
        ids.insert(json["final_url"].as_str().expect("final_url missing").to_string());
    }

    assert_eq!(ids.len(), 3);
    assert_eq!(app.artifact_count(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_composes_never_share_an_identifier() {
    let compositor = StubCompositor::new(Outcome::Solid { width: 32, height: 32 });
    let app = TestApp::new(compositor.clone(), ComposeConfig::default());
    app.write_scene(32, 32);

    let upload = jpeg_upload(32, 32);
    let responses = join_all((0..12).map(|_| app.send(compose_request("file", "person.jpg", &upload)))).await;

    let mut ids = std::collections::HashSet::new();
    for (status, json) in responses {
        assert_eq!(status, StatusCode::OK);
        let final_url = json["final_url"].as_str().expect("final_url missing");
        ids.insert(id_from_url(final_url, "http://kiosk.test:8000/static/fotos/", ".jpg"));
    }

    assert_eq!(ids.len(), 12);
    assert_eq!(compositor.calls(), 12);
    assert_eq!(app.artifact_count(), 24);
}

#[tokio::test]
async fn any_file_field_is_accepted_and_missing_file_is_bad_request() {
    let compositor = StubCompositor::new(Outcome::Solid { width: 32, height: 32 });
    let app = TestApp::new(compositor, ComposeConfig::default());
    app.write_scene(32, 32);

    let (status, _) = app.send(compose_request("photo", "person.jpg", &jpeg_upload(32, 32))).await;
    assert_eq!(status, StatusCode::OK);

    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{BOUNDARY}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/compose")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .expect("build request failed");
    let (status, json) = app.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["detail"].as_str().is_some());
}

#[tokio::test]
async fn health_routes_respond() {
    let app = TestApp::new(StubCompositor::new(Outcome::Fail), ComposeConfig::default());

    let (status, json) = app
        .send(Request::builder().uri("/").body(Body::empty()).expect("build request failed"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");

    let (status, json) = app
        .send(Request::builder().uri("/ping").body(Body::empty()).expect("build request failed"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["msg"], "pong");
}
