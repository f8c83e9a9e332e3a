use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info};
use simplelog::{Config, LevelFilter, WriteLogger};

use ghostview::render::GhostscriptEngine;
use ghostview::{Document, EngineHandle, Outcome, RenderSettings, WaitPolicy};

const LOG_FILE: &str = "ghostview.log";

#[derive(Parser, Debug)]
#[command(name = "ghostview", version)]
struct Cli {
    /// Settings file; defaults to the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level written to ghostview.log.
    #[arg(long, global = true, default_value = "info", value_parser = parse_level)]
    log_level: LevelFilter,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print page count and thumbnail sizes.
    Info { file: PathBuf },
    /// Render one page at high resolution as a PNG.
    Render(RenderArgs),
    /// Convert PostScript/XPS to PDF.
    Distill {
        file: PathBuf,
        /// Output PDF; a temporary file is created when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
struct RenderArgs {
    file: PathBuf,

    /// Page number (1-based).
    #[arg(long, default_value_t = 1)]
    page: usize,

    /// Magnification relative to the high resolution.
    #[arg(long)]
    zoom: Option<f64>,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    value
        .parse()
        .map_err(|_| format!("unknown log level '{value}'"))
}

fn main() -> Result<()> {
    better_panic::install();
    let cli = Cli::parse();

    WriteLogger::init(cli.log_level, Config::default(), File::create(LOG_FILE)?)?;
    info!("Starting ghostview");

    let settings = match &cli.config {
        Some(path) => RenderSettings::load_from(path)
            .with_context(|| format!("load settings '{}'", path.display()))?,
        None => RenderSettings::load_or_default(),
    };
    let engine = GhostscriptEngine::new()
        .map_err(|code| anyhow::anyhow!("failed to create Ghostscript instance (code {code})"))?;
    let engine = EngineHandle::new(Box::new(engine), settings)?;

    let result = match cli.cmd {
        Command::Info { file } => cmd_info(&engine, &file),
        Command::Render(args) => cmd_render(&engine, &args),
        Command::Distill { file, out } => cmd_distill(&engine, &file, out.as_deref()),
    };
    if let Err(e) = &result {
        error!("Command failed: {e:?}");
    }

    info!("Shutting down ghostview");
    result
}

fn open(engine: &EngineHandle, file: &Path) -> Result<Document> {
    let progress = |percent: u8| eprint!("\rLoading {percent:>3}%");
    let outcome = Document::open(engine, file, Some(&progress), WaitPolicy::Wait);
    eprintln!();
    match outcome.with_context(|| format!("open '{}'", file.display()))? {
        Outcome::Completed(document) => Ok(document),
        Outcome::InProgress => bail!("engine busy"),
    }
}

fn cmd_info(engine: &EngineHandle, file: &Path) -> Result<()> {
    let document = open(engine, file)?;
    println!("{}: {} pages", document.name(), document.size());
    for number in 1..=document.size() {
        if let Some(image) = document.displayable_image(number) {
            println!(
                "  page {number}: {}x{} @ {} dpi",
                image.width(),
                image.height(),
                image.dpi()
            );
        }
    }
    document.unload();
    Ok(())
}

fn cmd_render(engine: &EngineHandle, args: &RenderArgs) -> Result<()> {
    let document = open(engine, &args.file)?;
    let loaded = match args.zoom {
        Some(zoom) => document.zoom_page(WaitPolicy::Wait, args.page, zoom)?,
        None => document.load_high_res_page(WaitPolicy::Wait, args.page)?,
    };
    if loaded.is_in_progress() {
        bail!("engine busy");
    }

    let snapshot = document
        .page(args.page)
        .with_context(|| format!("page {} missing", args.page))?;
    let image = snapshot
        .displayable
        .with_context(|| format!("page {} has no image", args.page))?;
    info!("Page {} tiers: {:?}", args.page, snapshot.tiers);

    image
        .to_rgb_image()?
        .save(&args.out)
        .with_context(|| format!("write png '{}'", args.out.display()))?;
    eprintln!("wrote {}", args.out.display());
    document.unload();
    Ok(())
}

fn cmd_distill(engine: &EngineHandle, file: &Path, out: Option<&Path>) -> Result<()> {
    if !Document::should_distill(file)? {
        eprintln!("{} is already a PDF", file.display());
        return Ok(());
    }
    match engine.distill(WaitPolicy::Wait, file, out)? {
        Outcome::Completed(path) => {
            eprintln!("wrote {}", path.display());
            Ok(())
        }
        Outcome::InProgress => bail!("engine busy"),
    }
}
