use crate::core::config::Config;
use crate::core::errors::{UpscaleError, UpscaleResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Which Real-ESRGAN weights to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleModel {
    /// General-purpose photographic model, used for the full frame.
    General,
    /// Specialized subject weights, used for the subject crop.
    Subject,
}

/// Wrapper around the external Real-ESRGAN inference script.
///
/// Every invocation runs under the configured timeout; a timed-out child is
/// killed and any partially written output file is removed so callers never
/// see a truncated image at the expected path.
pub struct UpscaleService {
    config: Arc<Config>,
}

impl UpscaleService {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Upscale `input` into `output_dir`, returning the path of the file the
    /// script produced (`<stem>_<suffix>.<ext>` inside `output_dir`).
    pub async fn upscale(
        &self,
        input: &Path,
        output_dir: &Path,
        model: UpscaleModel,
    ) -> UpscaleResult<PathBuf> {
        let cfg = &self.config.upscale;
        let (model_name, weights) = match model {
            UpscaleModel::General => (cfg.general_model.as_str(), None),
            UpscaleModel::Subject => (
                cfg.subject_model.as_str(),
                Some(cfg.subject_model_weights.as_str()),
            ),
        };

        let args = build_args(
            &cfg.script_path,
            input,
            output_dir,
            model_name,
            cfg.scale,
            cfg.tile,
            cfg.tile_pad,
            &cfg.suffix,
            weights,
        );
        let expected = expected_output_path(input, output_dir, &cfg.suffix);

        debug!("Spawning upscaler: {} {}", cfg.python_bin, args.join(" "));
        let start = std::time::Instant::now();

        let child = Command::new(&cfg.python_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| UpscaleError::SpawnFailed {
                program: cfg.python_bin.clone(),
                source,
            })?;

        let timeout = Duration::from_secs(cfg.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| UpscaleError::SpawnFailed {
                program: cfg.python_bin.clone(),
                source,
            })?,
            Err(_) => {
                // Dropping the wait future drops the child handle, and
                // kill_on_drop terminates the process. The partial output
                // must not survive to be mistaken for a finished upscale.
                warn!(
                    "⚠️  Upscaler exceeded {}s timeout on {}, killing process",
                    cfg.timeout_secs,
                    input.display()
                );
                let _ = tokio::fs::remove_file(&expected).await;
                return Err(UpscaleError::TimedOut {
                    seconds: cfg.timeout_secs,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(UpscaleError::NonZeroExit {
                status: output.status.to_string(),
                stderr,
            });
        }

        if !expected.exists() {
            return Err(UpscaleError::OutputMissing {
                path: expected.display().to_string(),
            });
        }

        info!(
            "✓ Upscaled {} with {} in {:.1}s",
            input.display(),
            model_name,
            start.elapsed().as_secs_f64()
        );
        Ok(expected)
    }
}

#[allow(clippy::too_many_arguments)]
fn build_args(
    script: &str,
    input: &Path,
    output_dir: &Path,
    model_name: &str,
    scale: u32,
    tile: u32,
    tile_pad: u32,
    suffix: &str,
    model_weights: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        script.to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-o".to_string(),
        output_dir.display().to_string(),
        "-n".to_string(),
        model_name.to_string(),
        "-s".to_string(),
        scale.to_string(),
        "--tile".to_string(),
        tile.to_string(),
        "--tile_pad".to_string(),
        tile_pad.to_string(),
        "--suffix".to_string(),
        suffix.to_string(),
    ];

    if let Some(weights) = model_weights {
        args.push("--model_path".to_string());
        args.push(weights.to_string());
    }

    args
}

/// The inference script writes `<stem>_<suffix>.<ext>` into the output
/// directory, keeping the input's extension.
fn expected_output_path(input: &Path, output_dir: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "png".to_string());
    output_dir.join(format!("{}_{}.{}", stem, suffix, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        ClassificationConfig, DetectionConfig, PipelineConfig, ServerConfig, UpscaleConfig,
    };
    use tracing::Level;

    #[test]
    fn test_build_args_general_model() {
        let args = build_args(
            "realesrgan/inference_realesrgan.py",
            Path::new("uploads/abc.jpg"),
            Path::new("out"),
            "RealESRGAN_x4plus",
            4,
            768,
            10,
            "sr",
            None,
        );

        assert_eq!(
            args,
            vec![
                "realesrgan/inference_realesrgan.py",
                "-i",
                "uploads/abc.jpg",
                "-o",
                "out",
                "-n",
                "RealESRGAN_x4plus",
                "-s",
                "4",
                "--tile",
                "768",
                "--tile_pad",
                "10",
                "--suffix",
                "sr",
            ]
        );
    }

    #[test]
    fn test_build_args_with_subject_weights() {
        let args = build_args(
            "realesrgan/inference_realesrgan.py",
            Path::new("uploads/abc_laptop.jpg"),
            Path::new("out"),
            "30kR",
            4,
            768,
            10,
            "sr",
            Some("weights/30kR.pth"),
        );

        assert_eq!(&args[args.len() - 2..], &["--model_path", "weights/30kR.pth"]);
        assert!(args.contains(&"30kR".to_string()));
    }

    #[test]
    fn test_expected_output_path_keeps_extension() {
        let path = expected_output_path(Path::new("uploads/abc.jpg"), Path::new("out"), "sr");
        assert_eq!(path, PathBuf::from("out/abc_sr.jpg"));

        let path = expected_output_path(Path::new("uploads/x_laptop.png"), Path::new("out"), "sr");
        assert_eq!(path, PathBuf::from("out/x_laptop_sr.png"));
    }

    fn stub_config(python_bin: &str, script_path: &str, timeout_secs: u64) -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                port: 8600,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
                public_base_url: None,
            },
            detection: DetectionConfig {
                confidence_threshold: 0.10,
                iou_threshold: 0.45,
                target_size: 640,
                inference_backend: None,
                model_path: "models/yolov8n.onnx".to_string(),
                pool_size: 1,
            },
            classification: ClassificationConfig {
                vision_model_path: "models/clip_vision.onnx".to_string(),
                text_model_path: "models/clip_text.onnx".to_string(),
                tokenizer_path: "models/clip_tokenizer.json".to_string(),
                image_size: 224,
                temperature: 0.07,
            },
            upscale: UpscaleConfig {
                python_bin: python_bin.to_string(),
                script_path: script_path.to_string(),
                general_model: "RealESRGAN_x4plus".to_string(),
                subject_model: "30kR".to_string(),
                subject_model_weights: "weights/30kR.pth".to_string(),
                scale: 4,
                tile: 768,
                tile_pad: 10,
                suffix: "sr".to_string(),
                timeout_secs,
            },
            pipeline: PipelineConfig {
                upload_dir: "uploads".to_string(),
                output_dir: "out".to_string(),
                subject_class: "laptop".to_string(),
                feather_margin: 30,
                cleanup_intermediates: false,
            },
        })
    }

    // The contract tests below drive the service against small /bin/sh stub
    // scripts instead of the real Real-ESRGAN installation.
    #[cfg(unix)]
    mod stub_script {
        use super::*;

        // Shared argv parsing prologue for the stubs: pulls out -i, -o and
        // --suffix the same way the real script consumes them.
        const PARSE_ARGS: &str = r#"
input=""
outdir=""
suffix="sr"
while [ $# -gt 0 ]; do
  case "$1" in
    -i) input="$2"; shift 2 ;;
    -o) outdir="$2"; shift 2 ;;
    --suffix) suffix="$2"; shift 2 ;;
    *) shift ;;
  esac
done
stem=$(basename "$input")
stem="${stem%.*}"
ext="${input##*.}"
"#;

        fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
            let script = dir.join(name);
            std::fs::write(&script, format!("#!/bin/sh{}{}\n", PARSE_ARGS, body)).unwrap();
            script
        }

        fn write_input(dir: &Path) -> PathBuf {
            let input = dir.join("photo.jpg");
            std::fs::write(&input, b"not really a jpeg").unwrap();
            input
        }

        #[tokio::test]
        async fn produces_expected_output_file() {
            let tmp = tempfile::tempdir().unwrap();
            let script = write_stub(
                tmp.path(),
                "ok.sh",
                "mkdir -p \"$outdir\"\ncp \"$input\" \"$outdir/${stem}_${suffix}.${ext}\"",
            );
            let input = write_input(tmp.path());
            let out_dir = tmp.path().join("out");

            let service = UpscaleService::new(stub_config(
                "/bin/sh",
                &script.display().to_string(),
                30,
            ));
            let result = service
                .upscale(&input, &out_dir, UpscaleModel::General)
                .await
                .unwrap();

            assert_eq!(result, out_dir.join("photo_sr.jpg"));
            assert!(result.exists());
        }

        #[tokio::test]
        async fn surfaces_stderr_on_nonzero_exit() {
            let tmp = tempfile::tempdir().unwrap();
            let script = write_stub(
                tmp.path(),
                "fail.sh",
                "echo 'CUDA out of memory' >&2\nexit 3",
            );
            let input = write_input(tmp.path());

            let service = UpscaleService::new(stub_config(
                "/bin/sh",
                &script.display().to_string(),
                30,
            ));
            let err = service
                .upscale(&input, tmp.path(), UpscaleModel::General)
                .await
                .unwrap_err();

            match err {
                UpscaleError::NonZeroExit { stderr, .. } => {
                    assert!(stderr.contains("CUDA out of memory"));
                }
                other => panic!("expected NonZeroExit, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn reports_missing_output() {
            let tmp = tempfile::tempdir().unwrap();
            let script = write_stub(tmp.path(), "silent.sh", "exit 0");
            let input = write_input(tmp.path());

            let service = UpscaleService::new(stub_config(
                "/bin/sh",
                &script.display().to_string(),
                30,
            ));
            let err = service
                .upscale(&input, tmp.path(), UpscaleModel::General)
                .await
                .unwrap_err();

            assert!(matches!(err, UpscaleError::OutputMissing { .. }));
        }

        #[tokio::test]
        async fn kills_on_timeout_and_removes_partial_output() {
            let tmp = tempfile::tempdir().unwrap();
            // Writes the output early, then hangs past the timeout
            let script = write_stub(
                tmp.path(),
                "hang.sh",
                "mkdir -p \"$outdir\"\ncp \"$input\" \"$outdir/${stem}_${suffix}.${ext}\"\nsleep 30",
            );
            let input = write_input(tmp.path());
            let out_dir = tmp.path().join("out");

            let service = UpscaleService::new(stub_config(
                "/bin/sh",
                &script.display().to_string(),
                1,
            ));
            let err = service
                .upscale(&input, &out_dir, UpscaleModel::General)
                .await
                .unwrap_err();

            assert!(matches!(err, UpscaleError::TimedOut { seconds: 1 }));
            assert!(!out_dir.join("photo_sr.jpg").exists());
        }

        #[tokio::test]
        async fn spawn_failure_for_missing_interpreter() {
            let tmp = tempfile::tempdir().unwrap();
            let input = write_input(tmp.path());

            let service = UpscaleService::new(stub_config(
                "/nonexistent/python3",
                "script.py",
                30,
            ));
            let err = service
                .upscale(&input, tmp.path(), UpscaleModel::General)
                .await
                .unwrap_err();

            assert!(matches!(err, UpscaleError::SpawnFailed { .. }));
        }
    }
}
