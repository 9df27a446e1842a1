use clap::Parser;
use splatmesh_lib::ply::{export, read_point_set};
use splatmesh_lib::{
    paths, ConversionPipeline, ConversionRequest, JobStatus, Settings, TextureSize,
};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "Splat to Mesh Converter",
    version = "1.0",
    author = "Denis Avvakumov",
    about = "Exports a Gaussian splat PLY and converts it to a mesh through a conversion service"
)]
struct Cli {
    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path to the input splat PLY file."
    )]
    input: String,

    #[arg(
        short = 'o',
        long = "output-dir",
        value_name = "DIR",
        help = "Directory that receives the model folder. Defaults to the settings value."
    )]
    output_dir: Option<String>,

    #[arg(
        short = 'n',
        long = "name",
        value_name = "NAME",
        help = "Model name. Defaults to the input file stem."
    )]
    name: Option<String>,

    #[arg(
        short = 's',
        long = "settings",
        value_name = "FILE",
        help = "JSON settings file."
    )]
    settings: Option<PathBuf>,

    #[arg(short = 'u', long = "service-url", value_name = "URL")]
    service_url: Option<String>,

    #[arg(long = "min-detail", value_name = "SIZE")]
    min_detail: Option<f32>,

    #[arg(long = "simplify", value_name = "RATIO", help = "Simplification ratio in [0, 1].")]
    simplify: Option<f32>,

    #[arg(long = "angle-limit", value_name = "DEGREES")]
    angle_limit: Option<u32>,

    #[arg(
        short = 't',
        long = "texture-size",
        value_name = "PIXELS",
        value_parser = parse_texture_size,
        help = "Texture size: 512, 1024, 2048, 4096 or 8192."
    )]
    texture_size: Option<TextureSize>,

    #[arg(
        short = 'e',
        long = "export-only",
        default_value = "false",
        help = "Only write the filtered PLY, skip the conversion request."
    )]
    export_only: bool,

    #[arg(
        long = "timeout",
        value_name = "SECONDS",
        help = "Cancel the conversion if it takes longer than this."
    )]
    timeout: Option<u64>,

    #[arg(short = 'v', long = "verbose", default_value = "false")]
    verbose: bool,
}

fn parse_texture_size(value: &str) -> Result<TextureSize, String> {
    let pixels: u32 = value.parse().map_err(|e| format!("{}", e))?;
    TextureSize::try_from(pixels)
}

fn model_name(cli: &Cli) -> String {
    cli.name.clone().unwrap_or_else(|| {
        Path::new(&cli.input)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string())
    })
}

/// An explicit `--output-dir` must already exist; only the configured default is created.
fn ensure_output_dir(path: &str, explicit: bool) -> Result<(), String> {
    if Path::new(path).is_dir() {
        return Ok(());
    }
    if explicit {
        return Err(format!("output directory '{}' does not exist", path));
    }
    fs::create_dir_all(path).map_err(|e| format!("cannot create '{}': {}", path, e))
}

fn load_settings(cli: &Cli) -> Result<Settings, Box<dyn Error + Send + Sync>> {
    let mut settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(url) = &cli.service_url {
        settings.conversion_service_url = url.clone();
    }
    if let Some(dir) = &cli.output_dir {
        settings.converted_models_path = dir.clone();
    }
    if let Some(v) = cli.min_detail {
        settings.min_detail_size = v;
    }
    if let Some(v) = cli.simplify {
        settings.simplify = v;
    }
    if let Some(v) = cli.angle_limit {
        settings.angle_limit_degrees = v;
    }
    if let Some(v) = cli.texture_size {
        settings.texture_size = v;
    }
    if cli.verbose {
        settings.log_to_console = true;
    }
    settings.validate()?;
    Ok(settings)
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let settings = load_settings(&cli).unwrap_or_else(|e| {
        eprintln!("Error loading settings: {}", e);
        process::exit(1);
    });

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    let name = model_name(&cli);
    let point_set = read_point_set(&raw_data)?;
    println!(
        "Input: {} | Model: {} | Output: {} | Points: {} | Texture: {}",
        cli.input,
        name,
        settings.converted_models_path,
        point_set.len(),
        settings.texture_size.label()
    );

    if let Err(e) = ensure_output_dir(&settings.converted_models_path, cli.output_dir.is_some()) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let start = Instant::now();

    if cli.export_only {
        let artifacts = paths::plan(&settings.converted_models_path, &name)?;
        let count = export(&point_set, Path::new(&artifacts.point_cloud_path))?;
        println!("Export Time: {} ms", start.elapsed().as_millis());
        println!(
            "Successfully wrote {} splats to '{}'.",
            count, artifacts.point_cloud_path
        );
        return Ok(());
    }

    let pipeline = ConversionPipeline::from_settings(&settings)?;
    let request = ConversionRequest::from_settings(point_set, &name, &settings);
    let mut job = pipeline.prepare(request)?;
    info!("Converting {} via {}", name, settings.conversion_service_url);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = rt.block_on(async {
        let mut status_rx = job.subscribe();
        let progress = tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = status_rx.borrow_and_update().clone();
                if !status.is_terminal() {
                    println!("{}", status);
                }
            }
        });

        let cancel = job.cancel_handle();
        let result = match cli.timeout {
            Some(secs) => {
                let run = job.run();
                tokio::pin!(run);
                match tokio::time::timeout(Duration::from_secs(secs), &mut run).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Conversion exceeded {} s, cancelling", secs);
                        cancel.cancel();
                        run.await
                    }
                }
            }
            None => job.run().await,
        };
        drop(job);
        let _ = progress.await;
        result
    });

    let elapsed = start.elapsed().as_millis();
    match result {
        Ok(outcome) => {
            println!("{}", JobStatus::Completed);
            println!("Conversion Time: {} ms", elapsed);
            println!(
                "Successfully wrote '{}' ({} splats exported, {} mesh bytes).",
                outcome.artifacts.mesh_path,
                outcome.exported_points,
                outcome.mesh.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Conversion failed after {} ms: {}", elapsed, e);
            process::exit(1);
        }
    }
}
