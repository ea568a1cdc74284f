//! A typed cursor over a sub-rectangle of either a [`TileManager`] or a
//! caller-owned buffer. See `crate::iterator` for how several regions are
//! swept in lockstep. Grounded on `examples/original_source/app/base/
//! tile-manager.c`'s `PixelRegion` struct and `pixel_region_init`.

use crate::error::TileAccessError;
use crate::manager::TileManager;
use crate::tile::TileHandle;

enum Backing<'buf> {
    Manager(TileManager),
    Buffer { data: &'buf mut [u8], stride: usize },
}

/// A cursor describing one `w x h` sub-rectangle, plus enough state for
/// [`crate::iterator::PixelRegionIterator`] to sweep it tile-aligned
/// portion by portion.
pub struct PixelRegion<'buf> {
    origin_x: u32,
    origin_y: u32,
    width: u32,
    height: u32,
    bpp: u32,
    writable: bool,
    process_count: u32,
    backing: Backing<'buf>,
    current_tile: Option<(u32, u32, TileHandle)>,
    portion: (u32, u32, u32, u32),
}

impl<'buf> PixelRegion<'buf> {
    pub fn over_manager(manager: TileManager, x: u32, y: u32, w: u32, h: u32, writable: bool) -> Self {
        assert!(
            x + w <= manager.width() && y + h <= manager.height(),
            "pixel region extends past its manager's bounds"
        );
        let bpp = manager.bpp();
        Self {
            origin_x: x,
            origin_y: y,
            width: w,
            height: h,
            bpp,
            writable,
            process_count: 0,
            backing: Backing::Manager(manager),
            current_tile: None,
            portion: (x, y, 0, 0),
        }
    }

    pub fn over_buffer(data: &'buf mut [u8], bpp: u32, rowstride: usize, x: u32, y: u32, w: u32, h: u32) -> Self {
        assert!(rowstride >= (w as usize) * bpp as usize, "rowstride too small for region width");
        Self {
            origin_x: x,
            origin_y: y,
            width: w,
            height: h,
            bpp,
            writable: true,
            process_count: 0,
            backing: Backing::Buffer { data, stride: rowstride },
            current_tile: None,
            portion: (x, y, 0, 0),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn bpp(&self) -> u32 {
        self.bpp
    }
    pub fn writable(&self) -> bool {
        self.writable
    }
    pub fn process_count(&self) -> u32 {
        self.process_count
    }
    pub fn origin(&self) -> (u32, u32) {
        (self.origin_x, self.origin_y)
    }

    /// The sub-rectangle (within this region's own coordinate frame) that
    /// the most recent [`crate::iterator::PixelRegionIterator`] advance
    /// left us positioned over.
    pub fn portion_rect(&self) -> (u32, u32, u32, u32) {
        self.portion
    }

    /// Tile-edge distance, in pixels, from absolute pixel `(abs_x, abs_y)`
    /// to the right/bottom edge of its tile. `None` for buffer-backed
    /// regions, which have no tile grid at all.
    pub(crate) fn distance_to_tile_edge(&self, abs_x: u32, abs_y: u32) -> Option<(u32, u32)> {
        match &self.backing {
            Backing::Buffer { .. } => None,
            Backing::Manager(_) => {
                let dx = model::TILE_WIDTH - (abs_x % model::TILE_WIDTH);
                let dy = model::TILE_HEIGHT - (abs_y % model::TILE_HEIGHT);
                Some((dx, dy))
            }
        }
    }

    /// Moves this region's cursor to describe the portion
    /// `[rel_x, rel_x+w) x [rel_y, rel_y+h)` of its own coordinate frame,
    /// locking/releasing tiles as needed. For manager-backed regions, the
    /// portion must lie within a single tile (the iterator guarantees
    /// this by construction).
    pub(crate) fn enter_portion(
        &mut self,
        rel_x: u32,
        rel_y: u32,
        w: u32,
        h: u32,
    ) -> Result<(), TileAccessError> {
        self.portion = (rel_x, rel_y, w, h);
        self.process_count += 1;
        let manager = match &self.backing {
            Backing::Manager(m) => m.clone(),
            Backing::Buffer { .. } => return Ok(()),
        };
        let abs_x = self.origin_x + rel_x;
        let abs_y = self.origin_y + rel_y;
        let col = abs_x / model::TILE_WIDTH;
        let row = abs_y / model::TILE_HEIGHT;
        let needs_new = match &self.current_tile {
            Some((c, r, _)) => *c != col || *r != row,
            None => true,
        };
        if needs_new {
            self.release_current();
            let tile = manager
                .get_at(col, row, true, self.writable)?
                .expect("wantread always materialises a tile");
            self.current_tile = Some((col, row, tile));
        }
        Ok(())
    }

    /// A snapshot of where the current portion's bytes live, for handing
    /// off to [`crate::parallel::RegionView`] without holding a borrow of
    /// this region across the operator call.
    pub(crate) fn backing_snapshot(&mut self) -> BackingSnapshot {
        let (rx, ry, _w, _h) = self.portion;
        let bpp = self.bpp as usize;
        match &mut self.backing {
            Backing::Buffer { data, stride } => {
                let off = ry as usize * *stride + rx as usize * bpp;
                // SAFETY: offset is within `data` because `enter_portion`
                // only ever sets `portion` to sub-rectangles of this
                // region's own `[width, height)`, which `over_buffer`
                // asserted fits the caller's slice.
                let ptr = unsafe { data.as_mut_ptr().add(off) };
                BackingSnapshot::Buffer { ptr, stride: *stride }
            }
            Backing::Manager(_) => {
                let (col, row, tile) = self
                    .current_tile
                    .as_ref()
                    .expect("backing_snapshot called before enter_portion");
                let abs_x = self.origin_x + rx;
                let abs_y = self.origin_y + ry;
                let tile_x = abs_x - col * model::TILE_WIDTH;
                let tile_y = abs_y - row * model::TILE_HEIGHT;
                BackingSnapshot::Manager {
                    tile: tile.clone(),
                    tile_x,
                    tile_y,
                }
            }
        }
    }

    fn release_current(&mut self) {
        if let Some((_, _, tile)) = self.current_tile.take()
            && let Backing::Manager(m) = &self.backing
        {
            m.release(&tile, self.writable);
        }
    }

    /// Copies row `local_row` of the current portion into `dest`
    /// (`w*bpp` bytes). Works uniformly for both backings.
    pub fn copy_row_into(&self, local_row: u32, dest: &mut [u8]) {
        let (rx, ry, w, _h) = self.portion;
        let bpp = self.bpp as usize;
        let len = w as usize * bpp;
        match &self.backing {
            Backing::Buffer { data, stride } => {
                let off = (ry + local_row) as usize * stride + rx as usize * bpp;
                dest[..len].copy_from_slice(&data[off..off + len]);
            }
            Backing::Manager(_) => {
                let (col, row, tile) = self.current_tile.as_ref().expect("portion entered before row access");
                let abs_x = self.origin_x + rx;
                let abs_y = self.origin_y + ry + local_row;
                let tx = abs_x - col * model::TILE_WIDTH;
                let ty = abs_y - row * model::TILE_HEIGHT;
                let state = tile.state();
                let off = state.pixel_offset(tx, ty);
                let data = state.data.as_deref().expect("locked tile has data");
                dest[..len].copy_from_slice(&data[off..off + len]);
            }
        }
    }

    /// Writes `src` (`w*bpp` bytes) into row `local_row` of the current
    /// portion. Panics if the region is not writable.
    pub fn copy_row_from(&mut self, local_row: u32, src: &[u8]) {
        assert!(self.writable, "write into a read-only pixel region");
        let (rx, ry, w, _h) = self.portion;
        let bpp = self.bpp as usize;
        let len = w as usize * bpp;
        match &mut self.backing {
            Backing::Buffer { data, stride } => {
                let off = (ry + local_row) as usize * *stride + rx as usize * bpp;
                data[off..off + len].copy_from_slice(&src[..len]);
            }
            Backing::Manager(_) => {
                let (col, row, tile) = self.current_tile.as_ref().expect("portion entered before row access");
                let abs_x = self.origin_x + rx;
                let abs_y = self.origin_y + ry + local_row;
                let tx = abs_x - col * model::TILE_WIDTH;
                let ty = abs_y - row * model::TILE_HEIGHT;
                let mut state = tile.state();
                let off = state.pixel_offset(tx, ty);
                let data = state.data.as_deref_mut().expect("locked tile has data");
                data[off..off + len].copy_from_slice(&src[..len]);
            }
        }
    }
}

pub(crate) enum BackingSnapshot {
    Buffer { ptr: *mut u8, stride: usize },
    Manager { tile: TileHandle, tile_x: u32, tile_y: u32 },
}

impl Drop for PixelRegion<'_> {
    fn drop(&mut self) {
        self.release_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TileCache;
    use crate::format::PixelFormat;
    use crate::swap::TileSwap;
    use std::sync::Arc;

    fn fresh_manager(w: u32, h: u32, tag: &str) -> TileManager {
        let cache = Arc::new(TileCache::new(u64::MAX));
        let dir = std::env::temp_dir().join(format!("tiles-region-test-{}-{tag}", std::process::id()));
        let swap = Arc::new(TileSwap::init(&dir).unwrap());
        TileManager::new(w, h, PixelFormat::Gray, cache, swap)
    }

    #[test]
    fn buffer_region_round_trips() {
        let mut buf = vec![0u8; 16 * 16];
        {
            let mut region = PixelRegion::over_buffer(&mut buf, 1, 16, 0, 0, 16, 16);
            region.enter_portion(0, 0, 16, 16).unwrap();
            let row = vec![9u8; 16];
            for r in 0..16 {
                region.copy_row_from(r, &row);
            }
        }
        assert!(buf.iter().all(|&b| b == 9));
    }

    #[test]
    fn manager_region_reads_written_tile() {
        let manager = fresh_manager(64, 64, "a");
        manager.write_pixel_data(0, 0, 64, 64, &vec![5u8; 64 * 64], 64).unwrap();
        let mut region = PixelRegion::over_manager(manager, 0, 0, 64, 64, false);
        region.enter_portion(0, 0, 64, 64).unwrap();
        let mut out = vec![0u8; 64];
        region.copy_row_into(0, &mut out);
        assert!(out.iter().all(|&b| b == 5));
    }
}
