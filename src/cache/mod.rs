//! Bookkeeping for what has been decoded, what has been requested, and the
//! decoded tiles themselves.

mod requests;
mod status;
mod tiles;

pub use requests::{Interval, IntervalList, RequestCache};
pub use status::{CacheSnapshot, CacheStatus, CacheStatusTable};
pub use tiles::TileCache;
