//! A stack of at most 10 tile managers holding successively halved mip
//! levels of one layer. Grounded on `examples/original_source/app/base/
//! tile-pyramid.c` (`tile_pyramid_get_tile_manager`,
//! `tile_pyramid_validate_tile`, `tile_pyramid_invalidate_area`).

use std::sync::Arc;

use model::ImageLayout;

use crate::cache::TileCache;
use crate::format::PixelFormat;
use crate::manager::TileManager;
use crate::swap::TileSwap;

const MAX_LEVELS: usize = 10;

/// A pyramid refuses to allocate a level whose dimensions would be at or
/// below half a tile in either axis — storing it would buy nothing.
fn level_too_small(width: u32, height: u32) -> bool {
    width <= model::TILE_WIDTH / 2 || height <= model::TILE_HEIGHT / 2
}

pub struct TilePyramid {
    format: PixelFormat,
    cache: Arc<TileCache>,
    swap: Arc<TileSwap>,
    levels: Vec<Option<TileManager>>,
    layouts: Vec<ImageLayout>,
    top_level: usize,
}

impl TilePyramid {
    /// Builds level 0 only. Rejects indexed formats (spec.md §4.5).
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        cache: Arc<TileCache>,
        swap: Arc<TileSwap>,
    ) -> Option<Self> {
        if format.is_indexed() {
            return None;
        }
        let mut layouts = Vec::with_capacity(MAX_LEVELS);
        let mut layout = ImageLayout::new(width, height);
        layouts.push(layout);
        for _ in 1..MAX_LEVELS {
            layout = layout.halved();
            layouts.push(layout);
        }

        let level0 = TileManager::new(width, height, format, cache.clone(), swap.clone());
        let mut levels = vec![None; MAX_LEVELS];
        levels[0] = Some(level0);

        Some(Self {
            format,
            cache,
            swap,
            levels,
            layouts,
            top_level: 0,
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn top_level(&self) -> usize {
        self.top_level
    }

    /// Returns the manager for `level`, allocating every intermediate
    /// level on demand. If `level`'s dimensions would be too small to
    /// store, returns the highest allocatable level instead (which is
    /// `< level`).
    pub fn tiles_at(&mut self, level: usize) -> TileManager {
        let clamped = level.min(MAX_LEVELS - 1);
        for lvl in 1..=clamped {
            if self.levels[lvl].is_some() {
                continue;
            }
            let layout = self.layouts[lvl];
            if level_too_small(layout.width(), layout.height()) {
                break;
            }
            let manager = TileManager::new(
                layout.width(),
                layout.height(),
                self.format,
                self.cache.clone(),
                self.swap.clone(),
            );
            let below = self.levels[lvl - 1]
                .clone()
                .expect("lower levels always allocated first");
            manager.set_level_below(below.clone());
            let has_alpha = self.format.has_alpha();
            manager.set_validate_proc(move |_mgr, tile, col, row| {
                downsample_tile(&below, tile, col, row, has_alpha);
            });
            self.levels[lvl] = Some(manager);
            self.top_level = self.top_level.max(lvl);
        }
        // Return the highest level we actually have at or below `level`.
        let mut lvl = clamped;
        while self.levels[lvl].is_none() {
            lvl -= 1;
        }
        self.levels[lvl].clone().expect("level 0 always present")
    }

    /// Coarsest level whose dimensions still meet or exceed what `scale`
    /// requires, i.e. the level that renders nearest to 1:1 for a view at
    /// `scale` of the bottom-level size `(w, h)` without ever upscaling.
    pub fn level_for_scale(&self, w: u32, h: u32, scale: f64) -> usize {
        let target_w = (w as f64 * scale).ceil().max(1.0) as u32;
        let target_h = (h as f64 * scale).ceil().max(1.0) as u32;
        let mut chosen = 0;
        for level in 0..MAX_LEVELS {
            let layout = self.layouts[level];
            if level_too_small(layout.width(), layout.height()) {
                break;
            }
            if layout.width() < target_w || layout.height() < target_h {
                break;
            }
            chosen = level;
        }
        chosen
    }

    /// Invalidates `(x, y, w, h)` on level 0, then transitively halves
    /// the rectangle for each higher allocated level. A rectangle whose
    /// halved width or height would be 0 is clamped to 1 so invalidation
    /// keeps propagating upward.
    pub fn invalidate_area(&self, x: u32, y: u32, w: u32, h: u32) {
        let mut rect = (x, y, w.max(1), h.max(1));
        for level in self.levels.iter().flatten() {
            level.invalidate_area(rect.0, rect.1, rect.2, rect.3);
            rect = (rect.0 / 2, rect.1 / 2, (rect.2 / 2).max(1), (rect.3 / 2).max(1));
        }
    }
}

/// Downsamples the four lower-level tiles covering the destination
/// tile's 2x area into its quadrants. Pre-multiplied average for alpha
/// formats; straight arithmetic mean otherwise (spec.md §4.5).
fn downsample_tile(below: &TileManager, dest: &crate::tile::TileHandle, col: u32, row: u32, has_alpha: bool) {
    let bpp = dest.state().bpp;
    let (dw, dh) = {
        let state = dest.state();
        (state.eff_width, state.eff_height)
    };
    let src_x0 = col * model::TILE_WIDTH * 2;
    let src_y0 = row * model::TILE_HEIGHT * 2;

    let src_w = (dw * 2).min(below.width().saturating_sub(src_x0));
    let src_h = (dh * 2).min(below.height().saturating_sub(src_y0));
    if src_w == 0 || src_h == 0 {
        return;
    }
    let mut src = vec![0u8; src_w as usize * src_h as usize * bpp as usize];
    below
        .read_pixel_data(
            src_x0,
            src_y0,
            src_x0 + src_w,
            src_y0 + src_h,
            &mut src,
            src_w as usize * bpp as usize,
        )
        .ok();

    let mut state = dest.state();
    let data = state.data.as_deref_mut().expect("locked tile has data");
    let color_channels = if has_alpha { bpp as usize - 1 } else { bpp as usize };

    for dy in 0..dh {
        for dx in 0..dw {
            let sx = dx * 2;
            let sy = dy * 2;
            let mut acc = [0u32; 4];
            let mut alpha_sum = 0u32;
            let mut samples = 0u32;
            for (ox, oy) in [(0u32, 0u32), (1, 0), (0, 1), (1, 1)] {
                let px = sx + ox;
                let py = sy + oy;
                if px >= src_w || py >= src_h {
                    continue;
                }
                let off = (py as usize * src_w as usize + px as usize) * bpp as usize;
                let pixel = &src[off..off + bpp as usize];
                samples += 1;
                if has_alpha {
                    let a = pixel[color_channels] as u32;
                    alpha_sum += a;
                    for c in 0..color_channels {
                        acc[c] += pixel[c] as u32 * a;
                    }
                } else {
                    for c in 0..color_channels {
                        acc[c] += pixel[c] as u32;
                    }
                }
            }
            let dst_off = (dy as usize * dw as usize + dx as usize) * bpp as usize;
            if has_alpha {
                if alpha_sum == 0 {
                    data[dst_off..dst_off + bpp as usize].fill(0);
                } else {
                    for c in 0..color_channels {
                        data[dst_off + c] = (acc[c] / alpha_sum) as u8;
                    }
                    data[dst_off + color_channels] = (alpha_sum / samples.max(1)) as u8;
                }
            } else {
                for c in 0..color_channels {
                    data[dst_off + c] = (acc[c] / samples.max(1)) as u8;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(w: u32, h: u32, format: PixelFormat) -> TilePyramid {
        let cache = Arc::new(TileCache::new(u64::MAX));
        let dir = std::env::temp_dir().join(format!(
            "tiles-pyramid-test-{}-{}",
            std::process::id(),
            w * 10000 + h
        ));
        let swap = Arc::new(TileSwap::init(&dir).unwrap());
        TilePyramid::new(format, w, h, cache, swap).unwrap()
    }

    #[test]
    fn indexed_formats_are_rejected() {
        let cache = Arc::new(TileCache::new(u64::MAX));
        let dir = std::env::temp_dir().join(format!("tiles-pyramid-indexed-{}", std::process::id()));
        let swap = Arc::new(TileSwap::init(&dir).unwrap());
        assert!(TilePyramid::new(PixelFormat::Indexed, 64, 64, cache, swap).is_none());
    }

    #[test]
    fn level_for_scale_picks_nearest_fit() {
        let pyramid = fresh(1024, 1024, PixelFormat::Rgb);
        assert_eq!(pyramid.level_for_scale(1024, 1024, 0.25), 2);
        assert_eq!(pyramid.level_for_scale(1024, 1024, 0.9), 0);
    }

    #[test]
    fn downsample_of_uniform_tile_yields_same_value() {
        let mut pyramid = fresh(128, 128, PixelFormat::Rgb);
        let level0 = pyramid.tiles_at(0);
        let pattern = vec![100u8; 128 * 128 * 3];
        level0.write_pixel_data(0, 0, 128, 128, &pattern, 128 * 3).unwrap();

        let level1 = pyramid.tiles_at(1);
        let tile = level1.get_at(0, 0, true, false).unwrap().unwrap();
        let data = tile.state().data.clone().unwrap();
        level1.release(&tile, false);
        assert!(data.iter().all(|&b| (b as i32 - 100).abs() <= 1));
    }
}
