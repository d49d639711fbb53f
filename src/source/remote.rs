use super::{frames_in_interval, DecodeCallback, ImageSource};
use crate::cache::Interval;
use crate::config::HttpConfig;
use crate::decoder::DecodedTile;
use crate::metadata::{normalize_frames, FrameMetadata};
use crate::resolution::{ResolutionSet, SubImageRequest};
use crate::{Result, StreamError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Series served over HTTP.
///
/// The server exposes `GET {base}/frames.json` (a JSON array of frame metadata)
/// and `GET {base}/tile?frame=&level=&x=&y=&w=&h=&layers=` returning a PNG of
/// the sub-image rendered with the first `layers` quality layers. A decode
/// fetches the layers one after another and reports each as a progressive pass.
pub struct RemoteImageSource {
    name: String,
    base_url: String,
    client: Client,
    quality_layers: u32,
    frames: Arc<[FrameMetadata]>,
    levels: Vec<Arc<ResolutionSet>>,
    // Responses fetched ahead of time, consumed by the first decode that needs them.
    prefetched: Mutex<PrefetchBuffer>,
    closed: AtomicBool,
}

/// Prefetched response bodies under a byte budget. The oldest entry goes first
/// when a new one does not fit.
#[derive(Debug, Default)]
struct PrefetchBuffer {
    entries: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
    bytes: usize,
    budget: usize,
}

impl PrefetchBuffer {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            ..Default::default()
        }
    }

    fn insert(&mut self, url: String, body: Vec<u8>) -> bool {
        if body.len() > self.budget {
            log::debug!("Prefetched response for {} ({} bytes) exceeds the buffer", url, body.len());
            return false;
        }
        self.take(&url);
        while self.bytes + body.len() > self.budget {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.bytes -= evicted.len();
                log::debug!("Evicted prefetched response for {}", oldest);
            }
        }
        self.bytes += body.len();
        self.order.push_back(url.clone());
        self.entries.insert(url, body);
        true
    }

    fn take(&mut self, url: &str) -> Option<Vec<u8>> {
        let body = self.entries.remove(url)?;
        self.bytes -= body.len();
        self.order.retain(|u| u != url);
        Some(body)
    }

    fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.bytes = 0;
    }
}

impl RemoteImageSource {
    pub fn open(base_url: &str, http: &HttpConfig, level_count: usize) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        log::info!("Opening remote series: {}", base_url);

        let client = Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent(concat!("helio-stream/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let url = format!("{}/frames.json", base_url);
        let response = client.get(&url).send()?.error_for_status()?;
        let frames: Vec<FrameMetadata> = serde_json::from_slice(&response.bytes()?)?;
        let frames = normalize_frames(frames)?;

        let levels = frames
            .iter()
            .map(|f| ResolutionSet::dyadic(f.pixel_width, f.pixel_height, level_count).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let name = base_url
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("remote series")
            .to_string();

        log::info!("Remote series '{}': {} frames", name, frames.len());

        Ok(Self {
            name,
            base_url,
            client,
            quality_layers: http.quality_layers.max(1),
            frames: frames.into(),
            levels,
            prefetched: Mutex::new(PrefetchBuffer::new(http.prefetch_bytes)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn tile_url(&self, request: &SubImageRequest, layers: u32) -> String {
        tile_url(&self.base_url, request, layers)
    }

    fn fetch(&self, url: &str, frame: usize) -> Result<Vec<u8>> {
        if let Some(bytes) = self.prefetched.lock().take(url) {
            log::debug!("Using prefetched response for {}", url);
            return Ok(bytes);
        }

        let response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| for_frame(e.into(), frame))?;
        let bytes = response.bytes().map_err(|e| for_frame(e.into(), frame))?;
        Ok(bytes.to_vec())
    }

    fn decode_layer(&self, request: &SubImageRequest, layer: u32, start: Instant) -> Result<DecodedTile> {
        let frame = request.frame;
        let bytes = self.fetch(&self.tile_url(request, layer), frame)?;
        let image = image::load_from_memory(&bytes).map_err(|e| StreamError::Decode {
            frame,
            reason: e.to_string(),
        })?;

        let sub = request.sub_image;
        if image.width() != sub.width || image.height() != sub.height {
            return Err(StreamError::Decode {
                frame,
                reason: format!(
                    "server sent {}x{}, requested {}x{}",
                    image.width(),
                    image.height(),
                    sub.width,
                    sub.height
                ),
            });
        }

        let response = self.frames[frame].response;
        let coverage = layer as f32 / self.quality_layers as f32;
        Ok(DecodedTile::from_image(*request, image, response, coverage, start.elapsed()))
    }
}

/// Attaches frame context to a refused HTTP request.
fn for_frame(err: StreamError, frame: usize) -> StreamError {
    match err {
        StreamError::Rejected { status, url } => StreamError::Unavailable {
            frame,
            reason: format!("HTTP {} for {}", status, url),
        },
        other => other,
    }
}

fn tile_url(base_url: &str, request: &SubImageRequest, layers: u32) -> String {
    let s = request.sub_image;
    format!(
        "{}/tile?frame={}&level={}&x={}&y={}&w={}&h={}&layers={}",
        base_url, request.frame, request.level, s.x, s.y, s.width, s.height, layers
    )
}

impl ImageSource for RemoteImageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn frame_metadata(&self) -> Arc<[FrameMetadata]> {
        self.frames.clone()
    }

    fn resolution_levels(&self, frame: usize) -> Result<Arc<ResolutionSet>> {
        self.levels.get(frame).cloned().ok_or(StreamError::InvalidFrame {
            frame,
            count: self.frames.len(),
        })
    }

    fn request_decode(&self, request: &SubImageRequest, mut on_result: DecodeCallback) {
        if request.frame >= self.frames.len() {
            on_result(Err(StreamError::InvalidFrame {
                frame: request.frame,
                count: self.frames.len(),
            }));
            return;
        }

        let start = Instant::now();
        for layer in 1..=self.quality_layers {
            if self.closed.load(Ordering::SeqCst) {
                log::debug!("{} closed, decode of frame {} stopped at layer {}", self.name, request.frame, layer);
                return;
            }
            match self.decode_layer(request, layer, start) {
                Ok(tile) => on_result(Ok(tile)),
                Err(e) => {
                    on_result(Err(e));
                    return;
                }
            }
        }
    }

    fn prefetch(&self, interval: &Interval<DateTime<Utc>>) -> Result<usize> {
        let range = frames_in_interval(&self.frames, interval);
        log::info!("Prefetching {} frames of {}", range.len(), self.name);

        let mut fetched = 0;
        let mut last_error = None;
        for frame in range {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let coarsest = *self.levels[frame].coarsest();
            let request = SubImageRequest {
                frame,
                level: coarsest.index,
                sub_image: coarsest.full_image(),
            };
            let url = self.tile_url(&request, self.quality_layers);
            if self.prefetched.lock().contains(&url) {
                fetched += 1;
                continue;
            }
            match self.fetch(&url, frame) {
                Ok(bytes) => {
                    self.prefetched.lock().insert(url, bytes);
                    fetched += 1;
                }
                Err(e) => {
                    log::warn!("Prefetch of frame {} of {} failed: {}", frame, self.name, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if fetched == 0 => Err(e),
            _ => Ok(fetched),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut prefetched = self.prefetched.lock();
            let n = prefetched.len();
            prefetched.clear();
            n
        };
        log::debug!("Closed remote series {} ({} prefetched responses dropped)", self.name, dropped);
    }
}
