use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use restora_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use restora_core::fetch::HttpModelFetcher;
use restora_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use restora_core::model_cache::{CachedBlobInfo, SqliteModelCache};
use restora_core::model_registry::{ModelCatalog, ModelDescriptor};
use restora_core::runtime;
use restora_core::session::OrtSessionFactory;
use restora_core::tiler::{self, TileGrid};
use restora_core::{InferenceBackend, Orchestrator, PipelineEvent, PixelBuffer};

#[derive(Parser)]
#[command(name = "restora", about = "Tiled face restoration and super-resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore faces and upscale an image.
    Upscale(UpscaleArgs),
    /// Download every model into the local cache.
    Fetch,
    /// List known models and cached blobs.
    Models,
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image (PNG or JPEG)")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output path (default: <input>_restored.png)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Inference backend: cpu, cuda or tensorrt")]
    backend: Option<String>,
    #[arg(long)]
    no_face_restore: bool,
    #[arg(long)]
    no_super_res: bool,
    #[arg(long, help = "Tile edge length for super-resolution")]
    tile_size: Option<u32>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let resolution = runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime::log_runtime_lib_status(&resolution);
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, &resolved_data_dir).await,
        Commands::Fetch => run_fetch(config, &resolved_data_dir).await,
        Commands::Models => list_models(&config, &resolved_data_dir),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filters.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn catalog(config: &AppConfig) -> ModelCatalog {
    ModelCatalog::with_builtin_models().with_url_overrides(&config.model_urls)
}

fn build_orchestrator(config: &AppConfig, data_dir: &Path) -> Orchestrator {
    let cache = SqliteModelCache::open(config.cache_db_path(data_dir));
    let fetcher = HttpModelFetcher::new(
        config.network.connect_timeout(),
        config.network.request_timeout(),
    );
    let factory = OrtSessionFactory::new(Some(config.trt_cache_dir(data_dir)));
    Orchestrator::new(
        Arc::new(cache),
        Arc::new(fetcher),
        Arc::new(factory),
        config.pipeline_options(),
    )
}

async fn run_fetch(config: AppConfig, data_dir: &Path) -> Result<()> {
    let catalog = catalog(&config);
    let mut pipeline = build_orchestrator(&config, data_dir);
    pipeline.initialize(catalog.list().to_vec()).await?;
    for model in catalog.list() {
        println!("{} ({}) ready", model.key, model.display_name);
    }
    pipeline.terminate().await;
    Ok(())
}

fn list_models(config: &AppConfig, data_dir: &Path) -> Result<()> {
    let cache = SqliteModelCache::open(config.cache_db_path(data_dir));
    let cached = cache.entries().unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "Model cache unavailable");
        Vec::new()
    });
    let listing = models_listing(catalog(config).list(), &cached)?;
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

/// Catalog entries as JSON, each with `cached_bytes` (null when not cached)
/// and `cached_at`.
fn models_listing(
    models: &[ModelDescriptor],
    cached: &[CachedBlobInfo],
) -> Result<serde_json::Value> {
    let mut entries = Vec::with_capacity(models.len());
    for model in models {
        let mut value = serde_json::to_value(model)?;
        let hit = cached.iter().find(|entry| entry.key == model.key);
        if let Some(object) = value.as_object_mut() {
            object.insert("cached_bytes".into(), json!(hit.map(|e| e.byte_len)));
            object.insert(
                "cached_at".into(),
                json!(hit.map(|e| e.stored_at.to_rfc3339())),
            );
        }
        entries.push(value);
    }
    Ok(serde_json::Value::Array(entries))
}

async fn run_upscale(args: UpscaleArgs, mut config: AppConfig, data_dir: &Path) -> Result<()> {
    if let Some(tile_size) = args.tile_size {
        config.pipeline.tile_size = tile_size;
    }
    let backend = args
        .backend
        .as_deref()
        .map(InferenceBackend::from_str_lossy)
        .unwrap_or(config.pipeline.backend);
    let use_face_restore = !args.no_face_restore;
    let use_super_res = !args.no_super_res;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input));

    let image = load_image(&args.input)?;
    info!(
        input = %args.input.display(),
        width = image.width(),
        height = image.height(),
        %backend,
        use_face_restore,
        use_super_res,
        "Starting upscale"
    );

    let total_tiles = if use_super_res {
        TileGrid::new(image.width(), image.height(), config.pipeline_options().tile_size)?.len()
    } else {
        0
    };

    let catalog = catalog(&config);
    let mut pipeline = build_orchestrator(&config, data_dir);
    pipeline.initialize(catalog.list().to_vec()).await?;

    let started = Instant::now();
    let mut events = pipeline.upscale(image, backend, use_face_restore, use_super_res)?;
    let mut assembler = OutputAssembler::new(total_tiles);

    while let Some(event) = events.next().await {
        match &event {
            PipelineEvent::Status(message) => info!("{message}"),
            PipelineEvent::Tile { .. } => {
                print_progress(assembler.tiles_done + 1, total_tiles, started.elapsed().as_secs_f64())
            }
            _ => {}
        }
        assembler.apply(event)?;
    }
    if total_tiles > 0 {
        eprintln!();
    }

    pipeline.terminate().await;

    let Some(result) = assembler.finish()? else {
        bail!("pipeline ended without a result");
    };
    save_image(&result, &output)?;
    info!(
        output = %output.display(),
        width = result.width(),
        height = result.height(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Wrote output"
    );
    Ok(())
}

/// Folds a request's events into the final image.
struct OutputAssembler {
    canvas: Option<PixelBuffer>,
    intermediate: Option<PixelBuffer>,
    tiles_done: usize,
    tiles_expected: usize,
    completed: bool,
}

impl OutputAssembler {
    fn new(tiles_expected: usize) -> Self {
        Self {
            canvas: None,
            intermediate: None,
            tiles_done: 0,
            tiles_expected,
            completed: false,
        }
    }

    fn apply(&mut self, event: PipelineEvent) -> Result<()> {
        match event {
            PipelineEvent::Status(_) => {}
            PipelineEvent::Initialize { width, height } => {
                self.canvas = Some(PixelBuffer::zeroed(width, height));
            }
            PipelineEvent::Tile { tile, out_x, out_y } => {
                let canvas = self
                    .canvas
                    .as_mut()
                    .context("tile received before output dimensions")?;
                tiler::paste(canvas, &tile.buffer, out_x, out_y)?;
                self.tiles_done += 1;
            }
            PipelineEvent::IntermediateResult(image) => self.intermediate = Some(image),
            PipelineEvent::Complete { elapsed_ms } => {
                info!(elapsed_ms = format!("{elapsed_ms:.0}"), "Inference finished");
                self.completed = true;
            }
            PipelineEvent::Error(detail) => bail!("pipeline failed: {detail}"),
        }
        Ok(())
    }

    fn finish(self) -> Result<Option<PixelBuffer>> {
        if !self.completed {
            bail!("pipeline stopped before completing");
        }
        if self.canvas.is_some() && self.tiles_done != self.tiles_expected {
            bail!(
                "received {} of {} tiles",
                self.tiles_done,
                self.tiles_expected
            );
        }
        Ok(self.canvas.or(self.intermediate))
    }
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}_restored.png"))
}

fn load_image(path: &Path) -> Result<PixelBuffer> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to read image: {}", path.display()))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();
    PixelBuffer::new(width, height, decoded.into_raw())
}

fn save_image(buffer: &PixelBuffer, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    let encoded = image::RgbaImage::from_raw(buffer.width(), buffer.height(), buffer.data().to_vec())
        .context("pixel buffer does not match its dimensions")?;
    encoded
        .save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_line(done: usize, total: usize, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    format!(
        "[{}] {:5.1}% | Tile {}/{} | Elapsed: {}",
        bar,
        fraction * 100.0,
        done,
        total,
        format_duration(elapsed)
    )
}

fn print_progress(done: usize, total: usize, elapsed: f64) {
    eprint!("\r{}    ", progress_line(done, total, elapsed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use restora_core::Tile;

    fn tile_event(x: u32, y: u32, buffer: PixelBuffer) -> PipelineEvent {
        PipelineEvent::Tile {
            tile: Tile {
                x,
                y,
                width: buffer.width() / 2,
                height: buffer.height() / 2,
                buffer,
            },
            out_x: x * 2,
            out_y: y * 2,
        }
    }

    #[test]
    fn parses_upscale_flags() {
        let cli = Cli::try_parse_from([
            "restora",
            "-vv",
            "upscale",
            "in.png",
            "-o",
            "out.png",
            "--backend",
            "trt",
            "--no-face-restore",
            "--tile-size",
            "128",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        let Commands::Upscale(args) = cli.command else {
            panic!("expected upscale");
        };
        assert_eq!(args.input, PathBuf::from("in.png"));
        assert_eq!(args.output, Some(PathBuf::from("out.png")));
        assert_eq!(
            args.backend.as_deref().map(InferenceBackend::from_str_lossy),
            Some(InferenceBackend::Tensorrt)
        );
        assert!(args.no_face_restore);
        assert!(!args.no_super_res);
        assert_eq!(args.tile_size, Some(128));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["restora", "models", "--data-dir", "/tmp/r", "--log-filter", "debug"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Models));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/r")));
        assert_eq!(cli.log_filter.as_deref(), Some("debug"));
    }

    #[test]
    fn default_output_sits_next_to_input() {
        assert_eq!(
            default_output_path(Path::new("/photos/cat.jpg")),
            PathBuf::from("/photos/cat_restored.png")
        );
        assert_eq!(
            default_output_path(Path::new("scan.png")),
            PathBuf::from("scan_restored.png")
        );
    }

    #[test]
    fn image_roundtrip_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("out.png");
        let buffer = PixelBuffer::new(2, 1, vec![10, 20, 30, 255, 40, 50, 60, 255]).unwrap();

        save_image(&buffer, &path).expect("save");
        assert_eq!(load_image(&path).expect("load"), buffer);
    }

    #[test]
    fn load_image_reports_path() {
        let err = load_image(Path::new("/nonexistent/in.png")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/in.png"));
    }

    #[test]
    fn assembler_pastes_tiles_into_canvas() {
        let mut assembler = OutputAssembler::new(2);
        assembler
            .apply(PipelineEvent::Status("Upscaling 2 tiles".into()))
            .unwrap();
        assembler
            .apply(PipelineEvent::Initialize { width: 4, height: 2 })
            .unwrap();
        assembler
            .apply(tile_event(0, 0, PixelBuffer::filled(2, 2, [1, 1, 1, 255])))
            .unwrap();
        assembler
            .apply(tile_event(1, 0, PixelBuffer::filled(2, 2, [2, 2, 2, 255])))
            .unwrap();
        assembler
            .apply(PipelineEvent::Complete { elapsed_ms: 3.0 })
            .unwrap();

        let image = assembler.finish().unwrap().expect("image");
        assert_eq!(image.pixel(1, 1), Some([1, 1, 1, 255]));
        assert_eq!(image.pixel(2, 0), Some([2, 2, 2, 255]));
    }

    #[test]
    fn assembler_uses_intermediate_without_tiles() {
        let restored = PixelBuffer::filled(3, 3, [7, 7, 7, 255]);
        let mut assembler = OutputAssembler::new(0);
        assembler
            .apply(PipelineEvent::IntermediateResult(restored.clone()))
            .unwrap();
        assembler
            .apply(PipelineEvent::Complete { elapsed_ms: 1.0 })
            .unwrap();
        assert_eq!(assembler.finish().unwrap(), Some(restored));
    }

    #[test]
    fn assembler_rejects_errors_and_incomplete_runs() {
        let mut assembler = OutputAssembler::new(1);
        let err = assembler
            .apply(PipelineEvent::Error("inference failed: boom".into()))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let mut early = OutputAssembler::new(1);
        assert!(early
            .apply(tile_event(0, 0, PixelBuffer::zeroed(2, 2)))
            .is_err());

        let mut short = OutputAssembler::new(2);
        short
            .apply(PipelineEvent::Initialize { width: 4, height: 2 })
            .unwrap();
        short
            .apply(tile_event(0, 0, PixelBuffer::zeroed(2, 2)))
            .unwrap();
        short
            .apply(PipelineEvent::Complete { elapsed_ms: 0.0 })
            .unwrap();
        assert!(short.finish().is_err());

        assert!(OutputAssembler::new(0).finish().is_err());
    }

    #[test]
    fn models_listing_marks_cached_entries() {
        let catalog = ModelCatalog::with_builtin_models();
        let stored_at = "2026-01-02T03:04:05Z".parse().unwrap();
        let cached = vec![CachedBlobInfo {
            key: "esrgan-v1".into(),
            byte_len: 1234,
            stored_at,
        }];

        let listing = models_listing(catalog.list(), &cached).unwrap();
        let entries = listing.as_array().expect("array");
        assert_eq!(entries.len(), catalog.list().len());

        let esrgan = entries.iter().find(|e| e["key"] == "esrgan-v1").unwrap();
        assert_eq!(esrgan["cached_bytes"], 1234);
        assert!(esrgan["cached_at"].as_str().unwrap().starts_with("2026-01-02T03:04:05"));

        let gfpgan = entries.iter().find(|e| e["key"] == "gfpgan-v1.4").unwrap();
        assert!(gfpgan["cached_bytes"].is_null());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(61.4), "00:01:01");
        assert_eq!(format_duration(3725.0), "01:02:05");
    }

    #[test]
    fn progress_line_shows_fraction() {
        let line = progress_line(2, 4, 5.0);
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("Tile 2/4"));
        assert!(line.contains("00:00:05"));
        assert!(progress_line(0, 0, 0.0).contains("  0.0%"));
    }
}
