//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use spindrift_core::config::SpindriftConfig;
use spindrift_core::media::{ContainerFormat, MediaSource, SourceId};
use spindrift_core::probe::{FfprobeProber, MediaProber, SimulationProber};
use spindrift_core::{
    EncoderBackend, FfmpegBackend, InMemoryMediaLibrary, SessionRegistry, SimulationBackend,
};
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Serve {
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory scanned for media files to register
        #[arg(short, long)]
        media_dir: Option<PathBuf>,
        /// Working area for session segments
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        /// Use the simulation encoder instead of a real binary
        #[arg(long)]
        simulate: bool,
    },
    /// Scan a media file's keyframes and print the index
    Probe {
        /// Path to the media file
        file: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            port,
            media_dir,
            workdir,
            simulate,
        } => serve(port, media_dir, workdir, simulate).await,
        Commands::Probe { file } => probe_file(file).await,
    }
}

/// Start the streaming server with the configured backends.
async fn serve(
    port: Option<u16>,
    media_dir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    simulate: bool,
) -> anyhow::Result<()> {
    let mut config = SpindriftConfig::from_env();
    if let Some(port) = port {
        config.http.port = port;
    }
    if let Some(workdir) = workdir {
        config.session.workdir = workdir;
    }

    let (backend, prober): (Arc<dyn EncoderBackend>, Arc<dyn MediaProber>) = if simulate {
        info!("Running with simulated encoder and prober");
        (
            Arc::new(SimulationBackend::new()),
            Arc::new(SimulationProber::new(Duration::from_secs(2))),
        )
    } else {
        (
            Arc::new(FfmpegBackend::new(&config.encoder).context("encoder binary unavailable")?),
            Arc::new(FfprobeProber::new(&config.probe).context("prober binary unavailable")?),
        )
    };

    let library = Arc::new(InMemoryMediaLibrary::new());
    if let Some(dir) = media_dir {
        register_media_dir(&library, &dir, simulate).await?;
    }
    if library.is_empty() {
        warn!("Media library is empty; pass --media-dir to register sources");
    }

    let http = config.http.clone();
    let registry = SessionRegistry::new(config, backend, prober);

    spindrift_web::run_server(registry, library, http)
        .await
        .map_err(|e| anyhow::anyhow!("server failed: {e}"))
}

/// Register media files from a directory into the library.
async fn register_media_dir(
    library: &InMemoryMediaLibrary,
    dir: &Path,
    simulate: bool,
) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot read media dir {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(container) = container_from_extension(&path) else {
            continue;
        };

        let duration = if simulate {
            // Synthetic sources get a nominal length.
            Duration::from_secs(600)
        } else {
            match probe_duration(&path).await {
                Some(duration) => duration,
                None => {
                    warn!("Skipping {}: could not determine duration", path.display());
                    continue;
                }
            }
        };

        let source = MediaSource {
            id: SourceId::new(),
            path: path.clone(),
            duration,
            container,
            video: None,
            audio: None,
        };
        let id = library.insert(source);
        info!("Registered {} as {}", path.display(), id);
    }

    Ok(())
}

/// Map a file extension to its container format.
fn container_from_extension(path: &Path) -> Option<ContainerFormat> {
    match path.extension()?.to_str()?.to_lowercase().as_str() {
        "mp4" => Some(ContainerFormat::Mp4),
        "mkv" => Some(ContainerFormat::Mkv),
        "avi" => Some(ContainerFormat::Avi),
        "mov" => Some(ContainerFormat::Mov),
        "webm" => Some(ContainerFormat::WebM),
        "ts" => Some(ContainerFormat::MpegTs),
        _ => None,
    }
}

/// Ask ffprobe for a file's duration.
async fn probe_duration(path: &Path) -> Option<Duration> {
    let output = tokio::process::Command::new("ffprobe")
        .arg("-loglevel")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("csv=print_section=0")
        .arg(path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    (seconds.is_finite() && seconds > 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Scan a file's keyframes and print the resulting index.
async fn probe_file(file: PathBuf) -> anyhow::Result<()> {
    let config = SpindriftConfig::from_env();
    let prober = FfprobeProber::new(&config.probe).context("prober binary unavailable")?;

    let source = MediaSource {
        id: SourceId::new(),
        path: file.clone(),
        duration: probe_duration(&file).await.unwrap_or(Duration::ZERO),
        container: container_from_extension(&file).unwrap_or(ContainerFormat::Unknown),
        video: None,
        audio: None,
    };

    let index = spindrift_core::KeyframeIndex::build(&prober, &source)
        .await
        .context("keyframe scan failed")?;

    println!("{}: {} keyframes", file.display(), index.len());
    if let (Some(first), Some(last)) = (
        index.timestamps().first(),
        index.timestamps().last(),
    ) {
        println!("  first: {:.3}s", first.as_secs_f64());
        println!("  last:  {:.3}s", last.as_secs_f64());
    }

    Ok(())
}
