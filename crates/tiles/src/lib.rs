//! A tiled, paged raster storage engine: fixed-size tiles grouped into
//! per-layer managers, backed by a shared bounded memory cache and an
//! overflow swap file, with mip-level pyramids and a parallel
//! pixel-region processor built on top. Grounded throughout on
//! `examples/original_source/app/base/*` (`tile.c`, `tile-manager.c`,
//! `tile-cache.c`, `tile-swap.c`, `tile-pyramid.c`, `pixel-region.c`,
//! `pixel-processor.c`); see `DESIGN.md` for the module-by-module ledger.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod iterator;
pub mod manager;
pub mod parallel;
pub mod pyramid;
pub mod region;
pub mod swap;
pub mod tile;

pub use bootstrap::Core;
pub use cache::TileCache;
pub use config::{ConfigChange, CoreConfig, SwapNotification};
pub use error::{InvalidRegion, OutOfMemory, SwapIoError, SwapOpenError, TileAccessError};
pub use format::{PixelFormat, RowHint};
pub use iterator::{PixelRegionIterator, register as register_regions};
pub use manager::TileManager;
pub use parallel::{Processor, RegionView};
pub use pyramid::TilePyramid;
pub use region::PixelRegion;
pub use swap::TileSwap;
pub use tile::TileHandle;

pub use model::{ImageLayout, TILE_HEIGHT, TILE_WIDTH};

// A full RGBA tile's byte size must fit in a u32: `TileState::size` and the
// swap file's gap-list offsets are computed from `u32` tile dimensions, and
// a silent overflow there would corrupt allocator bookkeeping rather than
// panic.
static_assertions::const_assert!(TILE_WIDTH as u64 * TILE_HEIGHT as u64 * 4 <= u32::MAX as u64);
static_assertions::const_assert!(TILE_WIDTH > 0 && TILE_HEIGHT > 0);
