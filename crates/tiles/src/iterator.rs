//! Simultaneous traversal of 1-4 [`PixelRegion`]s in tile-aligned
//! portions. Grounded on `examples/original_source/app/base/
//! tile-manager.c`'s `pixel_regions_register`/`pixel_regions_process`.

use crate::error::{InvalidRegion, TileAccessError};
use crate::region::PixelRegion;

/// Walks 1-4 regions of identical width/height in lockstep, one
/// tile-aligned portion at a time. Construct via [`register`]; drive with
/// repeated calls to [`PixelRegionIterator::advance`].
pub struct PixelRegionIterator<'buf> {
    regions: Vec<PixelRegion<'buf>>,
    width: u32,
    height: u32,
    cur_x: u32,
    cur_y: u32,
    last_step: (u32, u32),
    started: bool,
    done: bool,
}

/// Registers `regions` for traversal. All regions must share width and
/// height; returns `None` if that invariant is violated or the shared
/// area is empty (spec.md §4.6, §7 `InvalidRegion`).
pub fn register(regions: Vec<PixelRegion<'_>>) -> Result<PixelRegionIterator<'_>, InvalidRegion> {
    if regions.is_empty() {
        return Err(InvalidRegion::NoRegions);
    }
    if regions.len() > 4 {
        return Err(InvalidRegion::TooManyRegions);
    }
    let (width, height) = (regions[0].width(), regions[0].height());
    if regions.iter().any(|r| r.width() != width || r.height() != height) {
        return Err(InvalidRegion::DimensionMismatch);
    }
    if width == 0 || height == 0 {
        return Err(InvalidRegion::EmptyIntersection);
    }
    Ok(PixelRegionIterator {
        regions,
        width,
        height,
        cur_x: 0,
        cur_y: 0,
        last_step: (0, 0),
        started: false,
        done: false,
    })
}

impl<'buf> PixelRegionIterator<'buf> {
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Advances to the next portion. Returns `Ok(true)` if a new portion
    /// is ready (access it via [`Self::regions_mut`]), `Ok(false)` once
    /// every portion has been visited, or `Err` if locking a newly
    /// entered tile failed (the iteration aborts at that point, per
    /// spec.md §4.3 "the calling pixel region's iteration is aborted").
    pub fn advance(&mut self) -> Result<bool, TileAccessError> {
        if self.done {
            return Ok(false);
        }
        if !self.started {
            self.started = true;
        } else {
            self.cur_x += self.last_step.0;
            if self.cur_x >= self.width {
                self.cur_x = 0;
                self.cur_y += self.last_step.1;
            }
        }
        if self.cur_y >= self.height {
            self.done = true;
            return Ok(false);
        }

        let mut step_w = self.width - self.cur_x;
        let mut step_h = self.height - self.cur_y;
        for region in &self.regions {
            let (ox, oy) = region.origin();
            if let Some((dx, dy)) = region.distance_to_tile_edge(ox + self.cur_x, oy + self.cur_y) {
                step_w = step_w.min(dx);
                step_h = step_h.min(dy);
            }
        }
        self.last_step = (step_w, step_h);

        for region in &mut self.regions {
            region.enter_portion(self.cur_x, self.cur_y, step_w, step_h)?;
        }
        Ok(true)
    }

    pub fn regions_mut(&mut self) -> &mut [PixelRegion<'buf>] {
        &mut self.regions
    }

    pub fn regions(&self) -> &[PixelRegion<'buf>] {
        &self.regions
    }

    /// `(x, y, w, h)` of the portion currently positioned over, in the
    /// shared relative coordinate frame common to every region.
    pub fn current_portion(&self) -> (u32, u32, u32, u32) {
        (self.cur_x, self.cur_y, self.last_step.0, self.last_step.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TileCache;
    use crate::format::PixelFormat;
    use crate::manager::TileManager;
    use crate::swap::TileSwap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn fresh_manager(w: u32, h: u32, tag: &str) -> TileManager {
        let cache = Arc::new(TileCache::new(u64::MAX));
        let dir = std::env::temp_dir().join(format!("tiles-iter-test-{}-{tag}", std::process::id()));
        let swap = Arc::new(TileSwap::init(&dir).unwrap());
        TileManager::new(w, h, PixelFormat::Gray, cache, swap)
    }

    #[test]
    fn terminates_after_expected_portion_count() {
        let a = fresh_manager(100, 50, "a");
        let b = fresh_manager(100, 50, "b");
        let region_a = PixelRegion::over_manager(a, 0, 0, 100, 50, false);
        let region_b = PixelRegion::over_manager(b, 0, 0, 100, 50, false);
        let mut iter = register(vec![region_a, region_b]).unwrap();

        let pixels = AtomicU64::new(0);
        let mut portions = 0u32;
        while iter.advance().unwrap() {
            portions += 1;
            let (_, _, w, h) = iter.current_portion();
            pixels.fetch_add((w * h) as u64, Ordering::SeqCst);
        }
        assert_eq!(pixels.load(Ordering::SeqCst), 100 * 50);
        assert_eq!(portions, 2);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let a = fresh_manager(64, 64, "c");
        let b = fresh_manager(64, 64, "d");
        let region_a = PixelRegion::over_manager(a, 0, 0, 64, 64, false);
        let region_b = PixelRegion::over_manager(b, 0, 0, 32, 64, false);
        let err = match register(vec![region_a, region_b]) {
            Err(err) => err,
            Ok(_) => panic!("expected DimensionMismatch"),
        };
        assert_eq!(err, InvalidRegion::DimensionMismatch);
    }
}
