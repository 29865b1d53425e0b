use clap::{Parser, Subcommand};
use imagemill::imaging::{Constraint, Rgb};
use imagemill::{
    BlobStore, Engine, ImageFormat, JobRequest, JobStatus, MemoryBlobStore, Operation, Priority,
    config, output,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How long the CLI waits for its single job before giving up.
const JOB_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "imagemill")]
#[command(about = "Convert, crop, compress, analyse and upscale images")]
#[command(long_about = "\
Convert, crop, compress, analyse and upscale images

Each command reads one image, runs it through the engine and writes the
result next to the input (or to --out). Formats are detected from content:
JPEG, PNG, WebP, AVIF and SVG sources are accepted.

Examples:

  imagemill convert logo.svg --to png --width 512
  imagemill crop scan.jpg
  imagemill compress photo.jpg --max-bytes 200000
  imagemill palette poster.png -k 6
  imagemill upscale thumb.png --factor 2

Logging goes to stderr; set RUST_LOG=debug for detail.
Run 'imagemill gen-config' to generate a documented imagemill.toml.")]
#[command(version)]
struct Cli {
    /// Engine config file (imagemill.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the job record as JSON instead of a report
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

/// Shared flags for commands that produce an image.
#[derive(clap::Args, Clone)]
struct OutArgs {
    /// Source image
    input: PathBuf,

    /// Output file (default: <input stem>.<command>.<ext> beside the input)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Convert between formats (SVG sources are rasterized)
    Convert {
        #[command(flatten)]
        io: OutArgs,
        /// Target format: jpeg, png, webp, avif
        #[arg(long, value_parser = parse_format)]
        to: ImageFormat,
        /// Raster width for SVG sources
        #[arg(long)]
        width: Option<u32>,
        /// Background for flattening transparency, as #rrggbb
        #[arg(long, value_parser = parse_color)]
        background: Option<Rgb>,
        /// Encoder quality, 1-100
        #[arg(long)]
        quality: Option<u32>,
    },
    /// Trim uniform borders
    Crop {
        #[command(flatten)]
        io: OutArgs,
    },
    /// Re-encode at a fixed quality or under a byte ceiling
    Compress {
        #[command(flatten)]
        io: OutArgs,
        /// Output format (default: same as the source)
        #[arg(long, value_parser = parse_format)]
        format: Option<ImageFormat>,
        /// Fixed encoder quality, 1-100
        #[arg(long, conflicts_with = "max_bytes", required_unless_present = "max_bytes")]
        quality: Option<u32>,
        /// Largest acceptable output size in bytes
        #[arg(long)]
        max_bytes: Option<u64>,
    },
    /// Extract the dominant colors
    Palette {
        /// Source image
        input: PathBuf,
        /// Number of colors
        #[arg(short, default_value_t = 5)]
        k: u32,
    },
    /// Enlarge by 2x or 4x
    Upscale {
        #[command(flatten)]
        io: OutArgs,
        /// Scale factor
        #[arg(long, default_value_t = 2)]
        factor: u32,
    },
    /// Print a stock imagemill.toml with all options documented
    GenConfig,
}

fn parse_format(s: &str) -> Result<ImageFormat, String> {
    ImageFormat::from_extension(s).ok_or_else(|| format!("unknown format '{s}'"))
}

fn parse_color(s: &str) -> Result<Rgb, String> {
    Rgb::parse(s).ok_or_else(|| format!("expected #rrggbb, got '{s}'"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging();

    let (input, out, operation) = match cli.command {
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
            return Ok(());
        }
        Command::Convert {
            io,
            to,
            width,
            background,
            quality,
        } => (
            io.input,
            io.out,
            Operation::Convert {
                target: to,
                raster_width: width,
                background,
                quality,
            },
        ),
        Command::Crop { io } => (io.input, io.out, Operation::Crop),
        Command::Compress {
            io,
            format,
            quality,
            max_bytes,
        } => {
            let constraint = match (quality, max_bytes) {
                (_, Some(bytes)) => Constraint::MaxBytes(bytes),
                (Some(q), None) => Constraint::Quality(q),
                (None, None) => return Err("compress needs --quality or --max-bytes".into()),
            };
            (io.input, io.out, Operation::Compress { format, constraint })
        }
        Command::Palette { input, k } => (input, None, Operation::Palette { k }),
        Command::Upscale { io, factor } => (
            io.input,
            io.out,
            Operation::Upscale {
                scale_factor: factor,
            },
        ),
    };

    let engine_config = config::load_config(cli.config.as_deref())?;
    init_thread_pool(&engine_config.workers);

    let blobs = Arc::new(MemoryBlobStore::new());
    let source_checksum = blobs.put(&std::fs::read(&input)?)?;
    let kind = operation.kind();

    let mut engine = Engine::start(&engine_config, blobs.clone(), None)?;
    let id = engine.submit(JobRequest {
        submitter: "cli".into(),
        source_checksum,
        operation,
        priority: Priority::Interactive,
    })?;
    let snapshot = engine
        .wait(id, JOB_TIMEOUT)
        .ok_or("job disappeared from the engine")?;
    let stats = engine.cache_stats();
    engine.shutdown();

    if let Some((result, checksum)) = snapshot
        .result
        .as_ref()
        .and_then(|r| r.checksum.as_ref().map(|c| (r, c)))
    {
        let format = result.metadata.format.unwrap_or(ImageFormat::Png);
        let path = out.unwrap_or_else(|| default_output(&input, kind.discriminant(), format));
        std::fs::write(&path, blobs.get(checksum)?)?;
        tracing::info!(path = %path.display(), "wrote result");
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        output::print_job_report(&snapshot);
        println!("{}", output::format_cache_summary(&stats));
    }

    match snapshot.status {
        JobStatus::Succeeded => Ok(()),
        status => Err(format!("{id} {status}").into()),
    }
}

/// Log to stderr so `--json` output on stdout stays parseable.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Size the rayon pool used by palette extraction.
///
/// Capped at the number of available CPU cores.
fn init_thread_pool(workers: &config::WorkersConfig) {
    let threads = config::effective_workers(workers);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

/// `photos/cat.jpg` + `crop` + PNG → `photos/cat.crop.png`
fn default_output(input: &Path, command: &str, format: ImageFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    input.with_file_name(format!("{stem}.{command}.{}", format.extension()))
}
