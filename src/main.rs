use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger};

use pageflow::pipeline::{Listener, MupdfEngine};
use pageflow::{
    DocumentSource, FailureKind, LoadOutcome, LoadPipeline, PipelineConfig, StagingMode,
};

#[derive(Parser, Debug)]
#[command(name = "pageflow")]
#[command(about = "Render every page of a document into PNG files", long_about = None)]
struct Cli {
    /// Document to render, or `-` to read it from stdin
    input: String,

    /// Directory the page images are written to
    #[arg(long, short)]
    out: PathBuf,

    /// YAML pipeline configuration
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Canvas width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Canvas height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Pages rendered in parallel
    #[arg(long, short)]
    jobs: Option<usize>,

    /// Write the log to this file instead of the terminal
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, short, action)]
    verbose: bool,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    match &cli.log_file {
        Some(path) => WriteLogger::init(
            level,
            Config::default(),
            File::create(path).with_context(|| format!("cannot create log file {path:?}"))?,
        )?,
        None => TermLogger::init(
            level,
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        )?,
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    if cli.width.is_some() || cli.height.is_some() {
        config = config.with_target_size(
            cli.width.unwrap_or(config.target_page_width),
            cli.height.unwrap_or(config.target_page_height),
        );
    }
    if let Some(jobs) = cli.jobs {
        config = config.with_max_concurrent_renders(jobs);
    }
    if config.staging == StagingMode::Memory {
        warn!("MuPDF reads from disk, switching staging to temp_file");
        config = config.with_staging(StagingMode::TempFile);
    }

    config.validate()?;
    Ok(config)
}

fn open_source(input: &str) -> Result<DocumentSource> {
    if input == "-" {
        return Ok(DocumentSource::from_reader("<stdin>", io::stdin()));
    }
    DocumentSource::open(Path::new(input)).with_context(|| format!("cannot open {input}"))
}

fn write_pages(pipeline: &LoadPipeline, total: usize, out: &Path) -> Result<usize> {
    fs::create_dir_all(out).with_context(|| format!("cannot create {out:?}"))?;

    let mut written = 0;
    for index in 0..total {
        let Some(page) = pipeline.get(index).ready() else {
            continue;
        };
        let path = out.join(format!("page-{:04}.png", index + 1));
        image::save_buffer(
            &path,
            &page.pixels,
            page.width,
            page.height,
            image::ExtendedColorType::Rgba8,
        )
        .with_context(|| format!("cannot write {path:?}"))?;
        written += 1;
    }
    Ok(written)
}

fn main() -> Result<ExitCode> {
    better_panic::install();

    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = build_config(&cli)?;
    let source = open_source(&cli.input)?;
    let pipeline = LoadPipeline::new(Arc::new(MupdfEngine::new()), config);

    let sink = Listener::new(|loading, current, total| match (loading, current, total) {
        (true, Some(page), Some(total)) => eprintln!("Rendering page {}/{total}", page + 1),
        (true, _, _) => eprintln!("Loading..."),
        (false, _, _) => {}
    });
    let outcome = pipeline.start(source, Arc::new(sink))?.wait();

    let summary = match outcome {
        LoadOutcome::Completed(summary) | LoadOutcome::Cancelled(summary) => summary,
        LoadOutcome::Failed(error) if error.kind() == FailureKind::MalformedDocument => {
            eprintln!("Unable to display {}: {error}", cli.input);
            return Ok(ExitCode::from(2));
        }
        LoadOutcome::Failed(error) => {
            return Err(anyhow::anyhow!("rendering {} failed: {error}", cli.input));
        }
    };

    let total = summary.total_pages.unwrap_or(0);
    let written = write_pages(&pipeline, total, &cli.out)?;
    info!("Wrote {written} pages to {:?}", cli.out);

    println!("{} pages loaded/{total} total pages", summary.rendered);
    if summary.failed_pages.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Pages that failed to render: {:?}", summary.failed_pages);
        Ok(ExitCode::FAILURE)
    }
}
