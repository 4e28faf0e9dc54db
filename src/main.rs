use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use image::{Rgba, RgbaImage};
use log::{LevelFilter, debug, info, warn};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode, WriteLogger};

use pageview::render::SvgBackend;
use pageview::{
    DocumentView, LayoutMode, PageTiles, Rect, RenderEvent, Rotation, Size, TileContent, VectorFormat, ViewSettings,
    ZoomMode,
};

const BACKGROUND: Rgba<u8> = Rgba([128, 128, 128, 255]);

#[derive(Parser)]
#[command(name = "pageview")]
#[command(about = "Lay out SVG pages and render them through the tile cache")]
#[command(version)]
struct Cli {
    /// SVG files, one page each
    #[arg(required = true)]
    pages: Vec<PathBuf>,

    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// single, double-left, double-right or raster
    #[arg(long)]
    layout: Option<String>,

    /// Fixed zoom factor
    #[arg(short, long)]
    zoom: Option<f64>,

    /// Rotation in degrees
    #[arg(short, long)]
    rotation: Option<i64>,

    /// Fit the first spread: fit-width, fit-height or fit-both
    #[arg(long, requires = "viewport")]
    fit: Option<String>,

    /// Viewport used for fitting, as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    viewport: Option<Size>,

    /// Canvas region to render, as X,Y,WIDTH,HEIGHT (whole canvas if omitted)
    #[arg(long, value_parser = parse_rect)]
    region: Option<Rect>,

    /// Write the rendered region to this PNG file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print every link URL with the areas pointing to it as JSON
    #[arg(long)]
    urls: bool,

    /// Export this page (zero-based) as SVG to --export-output
    #[arg(long, requires = "export_output")]
    export: Option<usize>,

    #[arg(long)]
    export_output: Option<PathBuf>,

    /// Render threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds to wait for rendering
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// More log output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    human_panic::setup_panic!();
    let cli = Cli::parse();
    init_logging(&cli)?;

    let settings = load_settings(&cli)?;
    let mut backend = SvgBackend::new();
    let mut pages = Vec::with_capacity(cli.pages.len());
    for path in &cli.pages {
        let page = backend
            .open(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        pages.push(page);
    }
    info!("Loaded {} pages", pages.len());

    let mut view = DocumentView::from_settings(Arc::new(backend), &settings)?;
    view.set_pages(pages);

    if let (Some(mode), Some(viewport)) = (&cli.fit, cli.viewport) {
        let mode = ZoomMode::parse(mode)?;
        let factor = view.fit(mode, viewport);
        info!(
            "Fitted {} to {}x{}: zoom {factor:.3}",
            mode.as_str(),
            viewport.width,
            viewport.height
        );
    }

    if cli.urls {
        print_urls(&view)?;
    }

    if let Some(output) = &cli.output {
        let region = cli.region.unwrap_or_else(|| view.geometry());
        let image = render_region(&mut view, region, Duration::from_secs(cli.timeout))?;
        image
            .save(output)
            .with_context(|| format!("failed to write {}", output.display()))?;
        info!("Wrote {}x{} region to {}", region.width, region.height, output.display());
    }

    if let (Some(page), Some(output)) = (cli.export, &cli.export_output) {
        let bytes = export_page(&mut view, page, Duration::from_secs(cli.timeout))?;
        fs::write(output, bytes).with_context(|| format!("failed to write {}", output.display()))?;
        info!("Exported page {page} to {}", output.display());
    }

    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    match &cli.log_file {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
            WriteLogger::init(level.max(LevelFilter::Debug), Config::default(), file)?;
        }
        None => TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto)?,
    }
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<ViewSettings> {
    let mut settings = match &cli.config {
        Some(path) => ViewSettings::load(path)?,
        None => ViewSettings::load_default()?,
    };
    if let Some(layout) = &cli.layout {
        settings.layout_mode = LayoutMode::parse(layout)?;
    }
    if let Some(zoom) = cli.zoom {
        settings.zoom_mode = ZoomMode::Fixed;
        settings.zoom_factor = zoom;
    }
    if let Some(degrees) = cli.rotation {
        settings.rotation = Rotation::from_degrees(degrees)?;
    }
    if cli.workers.is_some() {
        settings.workers = cli.workers;
    }
    settings.validate()?;
    debug!("Settings: {settings:?}");
    Ok(settings)
}

fn print_urls(view: &DocumentView) -> Result<()> {
    let urls: BTreeMap<String, BTreeMap<usize, Vec<[f64; 4]>>> = view
        .urls()
        .into_iter()
        .map(|(url, pages)| {
            let pages = pages
                .into_iter()
                .map(|(page, rects)| (page, rects.iter().map(|r| [r.x, r.y, r.width, r.height]).collect()))
                .collect();
            (url, pages)
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&urls)?);
    Ok(())
}

fn settled(shown: &[PageTiles]) -> bool {
    shown.iter().all(|page| {
        page.response
            .tiles
            .iter()
            .all(|t| matches!(t.content, TileContent::Ready(_) | TileContent::Unavailable))
    })
}

/// Request `region` and wait until every tile is ready or has failed
fn render_region(view: &mut DocumentView, region: Rect, timeout: Duration) -> Result<RgbaImage> {
    if region.is_empty() {
        bail!("nothing to render in region {region:?}");
    }
    let deadline = Instant::now() + timeout;
    let mut shown = view.set_visible_region(region);
    while !settled(&shown) {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            warn!("Timed out waiting for tiles");
            break;
        };
        match view.tiles().response_receiver().recv_timeout(remaining) {
            Ok(RenderEvent::RegionUnavailable { page, error, .. }) => warn!("Tile of {page} failed: {error}"),
            Ok(_) => {}
            Err(_) => {
                warn!("Timed out waiting for tiles");
                break;
            }
        }
        shown = view.refresh();
    }

    let mut canvas = RgbaImage::from_pixel(region.width, region.height, BACKGROUND);
    for page in &shown {
        for tile in &page.response.tiles {
            let image = match &tile.content {
                TileContent::Ready(tile) | TileContent::Placeholder(tile) => &tile.image,
                TileContent::Pending | TileContent::Unavailable => continue,
            };
            let at = page.to_canvas(tile.rect);
            image::imageops::replace(
                &mut canvas,
                image,
                i64::from(at.x - region.x),
                i64::from(at.y - region.y),
            );
        }
    }
    Ok(canvas)
}

fn export_page(view: &mut DocumentView, page: usize, timeout: Duration) -> Result<Vec<u8>> {
    let size = view
        .layout()
        .page(page)
        .map(|p| p.display_size())
        .with_context(|| format!("no page {page}"))?;
    let id = view.export(page, VectorFormat::Svg, Rect::new(0, 0, size.width, size.height))?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .context("timed out waiting for export")?;
        let event = view
            .tiles()
            .response_receiver()
            .recv_timeout(remaining)
            .context("timed out waiting for export")?;
        match event {
            RenderEvent::VectorOutput { id: done, result, .. } if done == id => return Ok(result?),
            _ => {}
        }
    }
}

fn parse_numbers(value: &str, separator: char, count: usize) -> Result<Vec<i64>, String> {
    let numbers: Vec<i64> = value
        .split(separator)
        .map(|n| n.trim().parse().map_err(|e| format!("'{n}': {e}")))
        .collect::<Result<_, _>>()?;
    if numbers.len() != count {
        return Err(format!("expected {count} numbers separated by '{separator}'"));
    }
    Ok(numbers)
}

fn parse_size(value: &str) -> Result<Size, String> {
    let n = parse_numbers(value, 'x', 2)?;
    let dim = |v: i64| u32::try_from(v).map_err(|_| format!("invalid size {v}"));
    Ok(Size::new(dim(n[0])?, dim(n[1])?))
}

fn parse_rect(value: &str) -> Result<Rect, String> {
    let n = parse_numbers(value, ',', 4)?;
    let pos = |v: i64| i32::try_from(v).map_err(|_| format!("invalid offset {v}"));
    let dim = |v: i64| u32::try_from(v).map_err(|_| format!("invalid size {v}"));
    Ok(Rect::new(pos(n[0])?, pos(n[1])?, dim(n[2])?, dim(n[3])?))
}
