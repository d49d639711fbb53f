use super::{DecodeCallback, ImageSource};
use crate::decoder::DecodedTile;
use crate::metadata::{normalize_frames, FrameMetadata};
use crate::resolution::{ResolutionSet, SubImageRequest};
use crate::{Result, StreamError};
use image::imageops::FilterType;
use image::{DynamicImage, ImageError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// File name of the metadata list inside a series directory.
pub const SERIES_MANIFEST: &str = "series.json";

/// On-disk description of a local series: one entry per frame, naming the
/// image file next to the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesManifest {
    #[serde(default)]
    pub name: Option<String>,
    pub frames: Vec<ManifestFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFrame {
    pub file: String,
    #[serde(flatten)]
    pub metadata: FrameMetadata,
}

impl SeriesManifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let file = File::open(dir.join(SERIES_MANIFEST))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let file = File::create(dir.join(SERIES_MANIFEST))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Series stored as a directory of image files plus a [`SeriesManifest`].
///
/// Resolution levels are synthesized as a dyadic pyramid over each frame's full
/// size; a decode reads the file, crops the requested region and scales it to
/// the level. Decodes run synchronously on the calling (reader) thread.
pub struct LocalImageSource {
    name: String,
    dir: PathBuf,
    files: Vec<String>,
    frames: Arc<[FrameMetadata]>,
    levels: Vec<Arc<ResolutionSet>>,
}

impl LocalImageSource {
    pub fn open(dir: impl AsRef<Path>, level_count: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        log::info!("Opening local series: {:?}", dir);

        let manifest = SeriesManifest::load(&dir)?;
        let name = manifest.name.clone().unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "local series".to_string())
        });

        let (files, frames): (Vec<String>, Vec<FrameMetadata>) =
            manifest.frames.into_iter().map(|f| (f.file, f.metadata)).unzip();
        let frames = normalize_frames(frames)?;

        let levels = frames
            .iter()
            .map(|f| ResolutionSet::dyadic(f.pixel_width, f.pixel_height, level_count).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Local series '{}': {} frames, {} levels per frame",
            name,
            frames.len(),
            levels.first().map(|l| l.len()).unwrap_or(0)
        );

        Ok(Self {
            name,
            dir,
            files,
            frames: frames.into(),
            levels,
        })
    }

    fn decode(&self, request: &SubImageRequest) -> Result<DecodedTile> {
        let start = Instant::now();
        let frame = request.frame;
        let meta = self.frames.get(frame).ok_or(StreamError::InvalidFrame {
            frame,
            count: self.frames.len(),
        })?;
        let level = self.levels[frame]
            .level(request.level)
            .copied()
            .ok_or(StreamError::InvalidLevel {
                frame,
                level: request.level,
            })?;

        let path = self.dir.join(&self.files[frame]);
        let image = image::open(&path).map_err(|e| map_image_error(frame, e))?;
        if image.width() != meta.pixel_width || image.height() != meta.pixel_height {
            return Err(StreamError::Decode {
                frame,
                reason: format!(
                    "{:?} is {}x{}, metadata says {}x{}",
                    path,
                    image.width(),
                    image.height(),
                    meta.pixel_width,
                    meta.pixel_height
                ),
            });
        }

        let sub = request.sub_image;
        let scale_x = meta.pixel_width as f64 / level.width as f64;
        let scale_y = meta.pixel_height as f64 / level.height as f64;
        let x0 = ((sub.x as f64 * scale_x).floor() as u32).min(meta.pixel_width - 1);
        let y0 = ((sub.y as f64 * scale_y).floor() as u32).min(meta.pixel_height - 1);
        let w0 = ((sub.width as f64 * scale_x).ceil() as u32).clamp(1, meta.pixel_width - x0);
        let h0 = ((sub.height as f64 * scale_y).ceil() as u32).clamp(1, meta.pixel_height - y0);

        let cropped = image.crop_imm(x0, y0, w0, h0);
        let scaled: DynamicImage = if (w0, h0) == (sub.width, sub.height) {
            cropped
        } else {
            cropped.resize_exact(sub.width, sub.height, FilterType::Triangle)
        };

        Ok(DecodedTile::from_image(
            *request,
            scaled,
            meta.response,
            1.0,
            start.elapsed(),
        ))
    }
}

fn map_image_error(frame: usize, err: ImageError) -> StreamError {
    match err {
        ImageError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => StreamError::Unavailable {
            frame,
            reason: io.to_string(),
        },
        ImageError::IoError(io) => StreamError::Io(io),
        other => StreamError::Decode {
            frame,
            reason: other.to_string(),
        },
    }
}

impl ImageSource for LocalImageSource {
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
        let result = self.decode(request);
        if let Ok(tile) = &result {
            log::debug!(
                "Decoded frame {} level {} ({}x{}) in {:?}",
                request.frame,
                request.level,
                tile.width,
                tile.height,
                tile.decode_time
            );
        }
        on_result(result);
    }
}
