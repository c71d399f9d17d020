use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use hires_core::backend::{EngineFactory, EnhanceEngine, EnhanceResult, InferenceFault};
use hires_core::error::{HiresError, Result};
use hires_core::types::{
    DeviceKind, EngineConfig, EnhanceParams, ModelVariant, PixelBuffer, Scale, SessionId,
};
use hires_pipeline::config::Limits;
use hires_pipeline::{ServiceConfig, UploadedFile, UpscaleService};

// ─── Fake engine ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    /// Untiled calls that report resource exhaustion before succeeding.
    oom_budget: AtomicUsize,
    /// 1-based call number that fails outright.
    fail_on_call: Option<usize>,
    calls: Mutex<Vec<EnhanceParams>>,
    builds: AtomicUsize,
}

struct NearestEngine {
    script: Arc<Script>,
}

impl EnhanceEngine for NearestEngine {
    fn enhance(&mut self, input: &PixelBuffer, params: &EnhanceParams) -> EnhanceResult {
        let call = {
            let mut calls = self.script.calls.lock().unwrap();
            calls.push(*params);
            calls.len()
        };
        if self.script.fail_on_call == Some(call) {
            return Err(InferenceFault::Failed("graph execution failed".into()));
        }
        if params.tile == 0
            && self
                .script
                .oom_budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(InferenceFault::ResourceExhausted("CUDA out of memory".into()));
        }
        Ok(input.resize_exact(
            input.width() * params.outscale,
            input.height() * params.outscale,
            FilterType::Nearest,
        ))
    }

    fn provider(&self) -> &str {
        "nearest"
    }
}

struct ScriptedFactory(Arc<Script>);

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn build(&self, _config: &EngineConfig) -> Result<Box<dyn EnhanceEngine>> {
        self.0.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NearestEngine {
            script: Arc::clone(&self.0),
        }))
    }
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn config(root: &Path) -> ServiceConfig {
    let weights = root.join("weights");
    fs::create_dir_all(&weights).unwrap();
    for variant in ModelVariant::ALL {
        fs::write(weights.join(variant.weights_file()), b"onnx").unwrap();
    }
    ServiceConfig {
        weights_dir: weights,
        device: Some(DeviceKind::Cpu),
        ..ServiceConfig::with_root(root)
    }
}

fn service(root: &Path, script: Script) -> (UpscaleService, Arc<Script>) {
    service_with(config(root), script)
}

fn service_with(config: ServiceConfig, script: Script) -> (UpscaleService, Arc<Script>) {
    let script = Arc::new(script);
    let factory = Arc::new(ScriptedFactory(Arc::clone(&script)));
    (UpscaleService::new(config, factory).unwrap(), script)
}

fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 31) as u8, (y * 17) as u8, 128])
    }));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn scale(n: u32) -> Scale {
    Scale::new(n).unwrap()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn decodable_files_succeed_in_order_and_corrupt_ones_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, _) = service(tmp.path(), Script::default());

    let files = vec![
        UploadedFile::new("a.png", encoded(4, 3, ImageFormat::Png)),
        UploadedFile::new("b.jpg", encoded(5, 2, ImageFormat::Jpeg)),
        UploadedFile::new("c.png", b"definitely not a png".to_vec()),
    ];
    let batch = svc.upscale(files, scale(2), ModelVariant::X4Plus).await.unwrap();

    let names: Vec<_> = batch.results.iter().map(|r| r.output_name.as_str()).collect();
    assert_eq!(names, vec!["a.png", "b.jpg"]);
    assert_eq!((batch.results[0].width, batch.results[0].height), (8, 6));
    assert_eq!((batch.results[1].width, batch.results[1].height), (10, 4));
    assert_eq!(batch.skipped.len(), 1);
    assert_eq!(batch.skipped[0].name, "c.png");

    let id = batch.session_id;
    assert_eq!(batch.results[0].preview_url, format!("/api/preview/{id}/a.png"));
    assert_eq!(batch.results[1].download_url, format!("/api/download/{id}/b.jpg"));

    assert_eq!(svc.results(&id).unwrap(), vec!["a.png", "b.jpg"]);
    assert!(dir_entries(&svc.config().upload_root).is_empty());

    let json = serde_json::to_value(&batch).unwrap();
    assert_eq!(json["scale"], 2);
    assert_eq!(json["model"], "RealESRGAN_x4plus");
    assert_eq!(json["session_id"], id.to_string());
}

#[tokio::test]
async fn all_undecodable_is_empty_batch_without_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, script) = service(tmp.path(), Script::default());

    let files = vec![
        UploadedFile::new("x.png", b"garbage".to_vec()),
        UploadedFile::new("y.webp", Vec::new()),
    ];
    let err = svc
        .upscale(files, scale(4), ModelVariant::X4Plus)
        .await
        .expect_err("nothing decodes");
    assert!(matches!(err, HiresError::EmptyBatch { skipped: 2 }));
    assert_eq!(err.status(), 422);

    assert!(dir_entries(&svc.config().result_root).is_empty());
    assert!(dir_entries(&svc.config().upload_root).is_empty());
    assert_eq!(script.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resource_exhaustion_retries_tiled_and_resets_before_next_image() {
    let tmp = tempfile::tempdir().unwrap();
    let script = Script {
        oom_budget: AtomicUsize::new(1),
        ..Script::default()
    };
    let (svc, script) = service(tmp.path(), script);

    let files = vec![
        UploadedFile::new("first.png", encoded(3, 3, ImageFormat::Png)),
        UploadedFile::new("second.png", encoded(2, 2, ImageFormat::Png)),
    ];
    let batch = svc.upscale(files, scale(4), ModelVariant::X4Plus).await.unwrap();
    assert_eq!(batch.results.len(), 2);

    let tiles: Vec<u32> = script.calls.lock().unwrap().iter().map(|p| p.tile).collect();
    assert_eq!(tiles, vec![0, 256, 0]);
}

#[tokio::test]
async fn tile_window_follows_configuration() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        tile_window: 64,
        ..config(tmp.path())
    };
    let script = Script {
        oom_budget: AtomicUsize::new(1),
        ..Script::default()
    };
    let (svc, script) = service_with(config, script);

    let files = vec![UploadedFile::new("a.png", encoded(3, 3, ImageFormat::Png))];
    svc.upscale(files, scale(3), ModelVariant::X4PlusAnime6B).await.unwrap();

    let calls = script.calls.lock().unwrap();
    assert_eq!(calls.iter().map(|p| p.tile).collect::<Vec<_>>(), vec![0, 64]);
    assert!(calls.iter().all(|p| p.outscale == 3 && p.tile_pad == 10 && p.pre_pad == 0));
}

#[tokio::test]
async fn fatal_inference_keeps_earlier_results_and_cleans_uploads() {
    let tmp = tempfile::tempdir().unwrap();
    let script = Script {
        fail_on_call: Some(2),
        ..Script::default()
    };
    let (svc, _) = service(tmp.path(), script);

    let files = vec![
        UploadedFile::new("ok.png", encoded(2, 2, ImageFormat::Png)),
        UploadedFile::new("boom.png", encoded(2, 2, ImageFormat::Png)),
        UploadedFile::new("never.png", encoded(2, 2, ImageFormat::Png)),
    ];
    let err = svc
        .upscale(files, scale(2), ModelVariant::X4Plus)
        .await
        .expect_err("second image fails");
    assert!(matches!(err.cause(), HiresError::Inference { file, .. } if file == "boom.png"));
    assert_eq!(err.error_code(), 121);

    let id = SessionId::parse(err.session().expect("failed batch names its session")).unwrap();
    assert_eq!(dir_entries(&svc.config().result_root), vec![id.to_string()]);
    assert_eq!(svc.results(&id).unwrap(), vec!["ok.png"]);
    assert!(dir_entries(&svc.config().upload_root).is_empty());

    svc.purge(&id).unwrap();
    assert!(dir_entries(&svc.config().result_root).is_empty());
}

#[tokio::test]
async fn admission_policy_sanitizes_and_filters() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        limits: Limits {
            max_files: 10,
            max_file_bytes: 4096,
        },
        ..config(tmp.path())
    };
    let (svc, _) = service_with(config, Script::default());

    let files = vec![
        UploadedFile::new("../../etc/scan one.bmp", encoded(2, 2, ImageFormat::Bmp)),
        UploadedFile::new("anim.gif", encoded(2, 2, ImageFormat::Png)),
        UploadedFile::new("huge.png", vec![0u8; 5000]),
        UploadedFile::new("???.png", encoded(2, 2, ImageFormat::Png)),
    ];
    let batch = svc.upscale(files, scale(2), ModelVariant::X4Plus).await.unwrap();

    assert_eq!(batch.results.len(), 2);
    assert_eq!(batch.results[0].original_name, "scan_one.bmp");
    assert_eq!(batch.results[0].output_name, "scan_one.png");
    assert_eq!(batch.results[1].original_name, "png");
    assert_eq!(batch.results[1].output_name, "png.png");

    let skipped: Vec<_> = batch.skipped.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(skipped, vec!["anim.gif", "huge.png"]);
}

#[tokio::test]
async fn rejected_requests_create_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        limits: Limits {
            max_files: 2,
            ..Limits::default()
        },
        ..config(tmp.path())
    };
    let (svc, _) = service_with(config, Script::default());

    let err = svc
        .upscale(Vec::new(), scale(4), ModelVariant::X4Plus)
        .await
        .unwrap_err();
    assert!(matches!(err, HiresError::NoImages));

    let three = (0..3)
        .map(|i| UploadedFile::new(format!("{i}.png"), encoded(1, 1, ImageFormat::Png)))
        .collect();
    let err = svc.upscale(three, scale(4), ModelVariant::X4Plus).await.unwrap_err();
    assert!(matches!(err, HiresError::BatchTooLarge { limit: 2, actual: 3 }));
    assert_eq!(err.status(), 413);

    assert!(dir_entries(&svc.config().result_root).is_empty());
}

#[tokio::test]
async fn package_then_purge_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, _) = service(tmp.path(), Script::default());

    let files = vec![
        UploadedFile::new("b.png", encoded(2, 2, ImageFormat::Png)),
        UploadedFile::new("a.jpeg", encoded(2, 2, ImageFormat::Jpeg)),
    ];
    let batch = svc.upscale(files, scale(2), ModelVariant::X4Plus).await.unwrap();
    let id = batch.session_id;

    let archive = svc.package(&id).await.unwrap();
    assert_eq!(archive.entries, vec!["a.jpeg", "b.png"]);
    assert!(archive.bytes > 0);
    assert_eq!(svc.package(&id).await.unwrap().entries, archive.entries);

    let file = svc.result_file(&id, "b.png").unwrap();
    assert!(file.is_file());

    svc.purge(&id).unwrap();
    assert!(!archive.path.exists());
    assert!(matches!(svc.purge(&id), Err(HiresError::SessionNotFound(_))));
    assert!(matches!(svc.package(&id).await, Err(HiresError::SessionNotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_share_one_engine() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, script) = service(tmp.path(), Script::default());
    let svc = Arc::new(svc);

    let tasks: Vec<_> = (0..4u32)
        .map(|i| {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move {
                let files = vec![UploadedFile::new("img.png", encoded(2 + i, 2, ImageFormat::Png))];
                svc.upscale(files, scale(2 + i % 3), ModelVariant::X4Plus).await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let batch = task.await.unwrap().unwrap();
        let factor = 2 + (i as u32) % 3;
        assert_eq!(batch.results[0].width, (2 + i as u32) * factor);
    }
    assert_eq!(script.builds.load(Ordering::SeqCst), 1);
    assert_eq!(dir_entries(&svc.config().result_root).len(), 4);
}
