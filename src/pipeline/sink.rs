use crate::decoder::DecodedTile;
use crate::metadata::Region;

/// Where an uploaded tile goes in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub frame: usize,
    pub level: usize,
    /// Physical region the tile's pixels cover.
    pub region: Region,
}

/// Consumer of decoded tiles: a texture uploader in a GUI, or anything else
/// that wants pixels. Called from the render thread only.
pub trait DisplaySink: Send + Sync {
    fn upload(&self, tile: &DecodedTile, placement: &Placement);

    /// Asks the UI to draw again. Not repeated until the UI has fetched the
    /// current image.
    fn request_redraw(&self);
}

/// Sink that only logs what it receives.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl DisplaySink for LoggingSink {
    fn upload(&self, tile: &DecodedTile, placement: &Placement) {
        log::info!(
            "Upload frame {} level {}: {}x{} {:?}, coverage {:.0}%, region {:.3}x{:.3}",
            placement.frame,
            placement.level,
            tile.width,
            tile.height,
            tile.format,
            tile.coverage * 100.0,
            placement.region.width(),
            placement.region.height()
        );
    }

    fn request_redraw(&self) {
        log::debug!("Redraw requested");
    }
}
