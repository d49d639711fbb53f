//! helio-stream - headless driver: plays a series through the streaming
//! pipeline and logs what the display sink receives.

use anyhow::{bail, Context, Result};
use helio_stream::{
    AnimationMode, ImageSource, LocalImageSource, LoggingSink, RemoteImageSource, StreamConfig, StreamEvent,
    StreamState, StreamView, Viewport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Options {
    source: String,
    config: Option<PathBuf>,
    steps: usize,
    viewport: Viewport,
    mode: AnimationMode,
    interval: Duration,
}

fn usage() -> &'static str {
    "usage: helio-stream <series-dir | http(s)://base-url> [--config FILE] [--steps N] \
     [--viewport WxH] [--mode loop|stop|swing] [--interval-ms N]"
}

fn parse_args() -> Result<Options> {
    let mut args = std::env::args().skip(1);
    let mut options = Options {
        source: String::new(),
        config: None,
        steps: 20,
        viewport: Viewport::new(1024, 1024),
        mode: AnimationMode::Loop,
        interval: Duration::from_millis(100),
    };

    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--config" => options.config = Some(PathBuf::from(value("--config")?)),
            "--steps" => options.steps = value("--steps")?.parse().context("invalid --steps")?,
            "--interval-ms" => {
                options.interval = Duration::from_millis(value("--interval-ms")?.parse().context("invalid --interval-ms")?)
            }
            "--viewport" => {
                let raw = value("--viewport")?;
                let (w, h) = raw.split_once('x').with_context(|| format!("invalid viewport '{}'", raw))?;
                options.viewport = Viewport::new(w.parse()?, h.parse()?);
            }
            "--mode" => {
                options.mode = match value("--mode")?.as_str() {
                    "loop" => AnimationMode::Loop,
                    "stop" => AnimationMode::Stop,
                    "swing" => AnimationMode::Swing,
                    other => bail!("unknown mode '{}'", other),
                }
            }
            "-h" | "--help" => bail!(usage()),
            other if other.starts_with("--") => bail!("unknown option '{}'\n{}", other, usage()),
            other => options.source = other.to_string(),
        }
    }

    if options.source.is_empty() {
        bail!(usage());
    }
    Ok(options)
}

fn open_source(location: &str, config: &StreamConfig) -> Result<Arc<dyn ImageSource>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let source = RemoteImageSource::open(location, &config.http, config.resolution_levels)
            .with_context(|| format!("Failed to open remote series {}", location))?;
        Ok(Arc::new(source))
    } else {
        let source = LocalImageSource::open(location, config.resolution_levels)
            .with_context(|| format!("Failed to open local series {}", location))?;
        Ok(Arc::new(source))
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let options = parse_args()?;
    let config = match &options.config {
        Some(path) => StreamConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => StreamConfig::default(),
    };

    let source = open_source(&options.source, &config)?;
    let frames = source.frame_metadata();

    let mut view = StreamView::new(source.name().to_string(), config, Arc::new(LoggingSink));
    view.attach(source.clone())?;
    let subscription = view.subscribe()?;

    if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
        view.preload(first.timestamp, last.timestamp + chrono::Duration::seconds(1))?;
    }
    view.set_viewport(options.viewport)?;

    let start = Instant::now();
    for _ in 0..options.steps {
        thread::sleep(options.interval);

        while let Ok(event) = subscription.events.try_recv() {
            match event {
                StreamEvent::FrameUnavailable { frame, reason } => log::warn!("Frame {} unavailable: {}", frame, reason),
                StreamEvent::DecodeFailed { frame, reason } => log::error!("Frame {} failed to decode: {}", frame, reason),
                other => log::debug!("{:?}", other),
            }
        }
        if let Some(image) = view.current_image() {
            log::info!(
                "Showing frame {} ({}) level {} at {:.0}%",
                image.placement.frame,
                frames[image.placement.frame].timestamp,
                image.placement.level,
                image.tile.coverage * 100.0
            );
        }

        if view.step(options.mode)?.is_none() {
            log::info!("Playback reached the end");
            break;
        }
    }

    let status = view.status();
    log::info!(
        "Played {} steps in {:?}: {:.1} fps, {} of {} frames cached, {:?}",
        options.steps,
        start.elapsed(),
        status.frame_rate,
        status.partially_cached_until,
        status.frame_count,
        status.layer
    );

    view.abolish();
    let deadline = Instant::now() + Duration::from_secs(10);
    while view.state() != StreamState::Abolished && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if view.state() != StreamState::Abolished {
        log::warn!("Teardown still running after 10s, exiting anyway");
    }
    Ok(())
}
