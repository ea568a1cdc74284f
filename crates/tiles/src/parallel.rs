//! Fans a [`PixelRegionIterator`] out to a bounded worker pool, invoking
//! an operator once per portion tuple. Grounded on `examples/
//! original_source/app/base/pixel-processor.c`
//! (`pixel_regions_process_parallel`, the `PixelProcessor` worker loop).
//!
//! Each call to [`process_parallel`]/[`process_parallel_progress`] spans
//! its workers with [`std::thread::scope`] rather than keeping a
//! long-lived OS thread pool: the iterator and any buffer-backed region
//! borrow caller data for the duration of the call, and a scope is the
//! only way to hand borrowed, non-`'static` data to worker threads
//! safely. `set_num_threads` still governs how many scoped threads are
//! spawned per call, matching the spec's "grows/shrinks the pool"
//! contract without requiring `'static` regions.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::InvalidRegion;
use crate::region::PixelRegion;
use crate::tile::TileHandle;

const INLINE_THRESHOLD_TILES: usize = 8;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(64);

/// One portion's worth of pixel bytes, handed to the operator. Reading
/// and writing go through [`RegionView::copy_row_into`]/
/// [`RegionView::copy_row_from`] so the same type serves both backings.
///
/// Carries no lifetime: a buffer-backed view is a raw pointer into the
/// caller's slice rather than a borrow, because it is built and consumed
/// entirely inside one `std::thread::scope` worker closure in
/// [`Processor::process_parallel_progress`] and never escapes it. The
/// iterator sweep guarantees distinct `RegionView`s never alias.
pub struct RegionView {
    kind: ViewKind,
    bpp: u32,
    width: u32,
    height: u32,
    writable: bool,
}

enum ViewKind {
    Manager { tile: TileHandle, tile_x: u32, tile_y: u32 },
    Buffer { ptr: *mut u8, stride: usize },
}

// SAFETY: each `RegionView` handed to an operator addresses a disjoint
// portion of its backing (manager tile or buffer range); the iterator
// sweep guarantees no two outstanding views alias, and views never
// outlive the worker closure that created them.
unsafe impl Send for RegionView {}

impl RegionView {
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

    pub fn copy_row_into(&self, row: u32, dest: &mut [u8]) {
        let len = self.width as usize * self.bpp as usize;
        match &self.kind {
            ViewKind::Manager { tile, tile_x, tile_y } => {
                let state = tile.state();
                let off = state.pixel_offset(*tile_x, *tile_y + row);
                let data = state.data.as_deref().expect("locked tile has data");
                dest[..len].copy_from_slice(&data[off..off + len]);
            }
            ViewKind::Buffer { ptr, stride } => unsafe {
                let off = row as usize * stride;
                let src = std::slice::from_raw_parts(ptr.add(off), len);
                dest[..len].copy_from_slice(src);
            },
        }
    }

    pub fn copy_row_from(&mut self, row: u32, src: &[u8]) {
        assert!(self.writable, "write into a read-only region view");
        let len = self.width as usize * self.bpp as usize;
        match &mut self.kind {
            ViewKind::Manager { tile, tile_x, tile_y } => {
                let mut state = tile.state();
                let off = state.pixel_offset(*tile_x, *tile_y + row);
                let data = state.data.as_deref_mut().expect("locked tile has data");
                data[off..off + len].copy_from_slice(&src[..len]);
            }
            ViewKind::Buffer { ptr, stride } => unsafe {
                let off = row as usize * *stride;
                let dst = std::slice::from_raw_parts_mut(ptr.add(off), len);
                dst.copy_from_slice(&src[..len]);
            },
        }
    }
}

/// Number of scoped worker threads [`process_parallel`] will spawn.
/// `1` runs every portion inline on the caller.
pub struct Processor {
    num_threads: AtomicUsize,
}

impl Processor {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: AtomicUsize::new(num_threads.max(1)),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Relaxed)
    }

    pub fn set_num_threads(&self, n: usize) {
        self.num_threads.store(n.max(1), Ordering::Relaxed);
    }

    pub fn process_parallel<'buf>(
        &self,
        regions: Vec<PixelRegion<'buf>>,
        operator: impl Fn(&mut [RegionView]) + Sync,
    ) -> Result<(), InvalidRegion> {
        self.process_parallel_progress(regions, operator, |_| {})
    }

    pub fn process_parallel_progress<'buf>(
        &self,
        regions: Vec<PixelRegion<'buf>>,
        operator: impl Fn(&mut [RegionView]) + Sync,
        progress: impl Fn(f64) + Sync,
    ) -> Result<(), InvalidRegion> {
        let mut iter = crate::iterator::register(regions)?;
        let estimated_tiles = (iter.width().div_ceil(model::TILE_WIDTH) as usize)
            * (iter.height().div_ceil(model::TILE_HEIGHT) as usize);
        let num_threads = self.num_threads();

        let shared = Mutex::new(&mut iter);
        let done = AtomicBool::new(false);
        let completed = AtomicUsize::new(0);
        let start = Instant::now();
        let last_report_millis = AtomicU64::new(0);

        let run_worker = |report: &dyn Fn(f64)| loop {
            let mut guard = shared.lock().expect("pixel processor iterator mutex poisoned");
            let advanced = match guard.advance() {
                Ok(true) => true,
                Ok(false) => false,
                Err(_) => {
                    done.store(true, Ordering::SeqCst);
                    false
                }
            };
            if !advanced {
                drop(guard);
                break;
            }
            let mut views: Vec<RegionView> = guard
                .regions_mut()
                .iter_mut()
                .map(region_to_view)
                .collect();
            drop(guard);

            operator(&mut views);
            drop(views);
            completed.fetch_add(1, Ordering::Relaxed);
            report(completed.load(Ordering::Relaxed) as f64 / estimated_tiles.max(1) as f64);
        };

        // Reports at most once per `PROGRESS_INTERVAL`, from whichever
        // worker happens to cross the boundary first (spec.md §4.7,
        // "invoked approximately every 64 milliseconds").
        let report_throttled = |frac: f64| {
            let now_millis = start.elapsed().as_millis() as u64;
            let prev = last_report_millis.load(Ordering::Relaxed);
            if now_millis.saturating_sub(prev) >= PROGRESS_INTERVAL.as_millis() as u64
                && last_report_millis
                    .compare_exchange(prev, now_millis, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                progress(frac.min(1.0));
            }
        };

        if estimated_tiles < INLINE_THRESHOLD_TILES || num_threads <= 1 {
            run_worker(&report_throttled);
        } else {
            std::thread::scope(|scope| {
                for _ in 0..num_threads {
                    scope.spawn(|| run_worker(&report_throttled));
                }
            });
        }
        progress(1.0);
        Ok(())
    }
}

fn region_to_view(region: &mut PixelRegion<'_>) -> RegionView {
    let (_, _, w, h) = region.portion_rect();
    let bpp = region.bpp();
    let writable = region.writable();
    let kind = match region.backing_snapshot() {
        crate::region::BackingSnapshot::Buffer { ptr, stride } => ViewKind::Buffer { ptr, stride },
        crate::region::BackingSnapshot::Manager { tile, tile_x, tile_y } => {
            ViewKind::Manager { tile, tile_x, tile_y }
        }
    };
    RegionView {
        kind,
        bpp,
        width: w,
        height: h,
        writable,
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

    fn fresh_manager(w: u32, h: u32, tag: &str) -> TileManager {
        let cache = Arc::new(TileCache::new(u64::MAX));
        let dir = std::env::temp_dir().join(format!("tiles-parallel-test-{}-{tag}", std::process::id()));
        let swap = Arc::new(TileSwap::init(&dir).unwrap());
        TileManager::new(w, h, PixelFormat::Rgb, cache, swap)
    }

    #[test]
    fn parallel_add_one_matches_serial_reference() {
        let input_mgr = fresh_manager(512, 512, "in");
        let output_mgr = fresh_manager(512, 512, "out");
        let pattern: Vec<u8> = (0..512 * 512 * 3).map(|i| (i % 200) as u8).collect();
        input_mgr.write_pixel_data(0, 0, 512, 512, &pattern, 512 * 3).unwrap();

        let input = PixelRegion::over_manager(input_mgr, 0, 0, 512, 512, false);
        let output = PixelRegion::over_manager(output_mgr.clone(), 0, 0, 512, 512, true);

        let processor = Processor::new(4);
        processor
            .process_parallel(vec![input, output], |views| {
                let (a, b) = views.split_at_mut(1);
                let src = &a[0];
                let dst = &mut b[0];
                let mut row = vec![0u8; src.width() as usize * src.bpp() as usize];
                for r in 0..src.height() {
                    src.copy_row_into(r, &mut row);
                    for byte in row.iter_mut() {
                        *byte = byte.wrapping_add(1);
                    }
                    dst.copy_row_from(r, &row);
                }
            })
            .unwrap();

        let mut out = vec![0u8; pattern.len()];
        output_mgr.read_pixel_data(0, 0, 512, 512, &mut out, 512 * 3).unwrap();
        let expected: Vec<u8> = pattern.iter().map(|b| b.wrapping_add(1)).collect();
        assert_eq!(out, expected);
    }
}
