//! The per-image-layer address space: a 2-D grid of tile slots, with
//! copy-on-write sharing, validation callbacks, and sub-area invalidation.
//! Grounded on `examples/original_source/app/base/tile-manager.c`
//! (`tile_manager_get_tile`, `tile_manager_validate_tile`,
//! `tile_manager_invalidate_area`).

use std::sync::{Arc, Mutex};

use model::ImageLayout;

use crate::cache::TileCache;
use crate::error::TileAccessError;
use crate::format::PixelFormat;
use crate::swap::TileSwap;
use crate::tile::{ManagerId, TileHandle};

/// Installed once per manager; invoked the first time a tile is locked
/// after creation or invalidation. Takes `(manager, tile, col, row)` so a
/// pyramid's upper levels can find their level-below companion through
/// `manager.level_below()`.
pub type ValidateProc = dyn Fn(&TileManager, &TileHandle, u32, u32) + Send + Sync;

struct Inner {
    id: ManagerId,
    width: u32,
    height: u32,
    bpp: u32,
    layout: ImageLayout,
    slots: Mutex<Vec<Option<TileHandle>>>,
    level_below: Mutex<Option<TileManager>>,
    validate: Mutex<Option<Arc<ValidateProc>>>,
    cache: Arc<TileCache>,
    swap: Arc<TileSwap>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().expect("tile manager slots poisoned");
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(tile) = slot.take() {
                detach_and_maybe_destroy(&self.cache, &self.swap, &tile, self.id, index as u32);
            }
        }
    }
}

/// A reference-counted handle to one tile manager. Cloning is the Rust
/// analogue of the original's manual `tile_manager_ref`: the manager is
/// torn down (every slot detached) when the last clone drops, so there is
/// no explicit `unref` call in this port.
#[derive(Clone)]
pub struct TileManager(Arc<Inner>);

impl PartialEq for TileManager {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for TileManager {}

impl TileManager {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        cache: Arc<TileCache>,
        swap: Arc<TileSwap>,
    ) -> Self {
        let layout = ImageLayout::new(width, height);
        let slot_count = layout.max_tiles() as usize;
        Self(Arc::new(Inner {
            id: ManagerId::next(),
            width,
            height,
            bpp: format.bytes_per_pixel(),
            layout,
            slots: Mutex::new(vec![None; slot_count]),
            level_below: Mutex::new(None),
            validate: Mutex::new(None),
            cache,
            swap,
        }))
    }

    pub fn id(&self) -> ManagerId {
        self.0.id
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn bpp(&self) -> u32 {
        self.0.bpp
    }

    pub fn layout(&self) -> ImageLayout {
        self.0.layout
    }

    pub fn set_validate_proc<F>(&self, proc: F)
    where
        F: Fn(&TileManager, &TileHandle, u32, u32) + Send + Sync + 'static,
    {
        *self.0.validate.lock().expect("validate proc poisoned") = Some(Arc::new(proc));
    }

    pub fn set_level_below(&self, other: TileManager) {
        *self.0.level_below.lock().expect("level-below poisoned") = Some(other);
    }

    pub fn level_below(&self) -> Option<TileManager> {
        self.0.level_below.lock().expect("level-below poisoned").clone()
    }

    /// Marks every tile covering pixel rect `(x, y, w, h)` invalid, so the
    /// validation callback reruns the next time each is locked.
    pub fn invalidate_area(&self, x: u32, y: u32, w: u32, h: u32) {
        if w == 0 || h == 0 {
            return;
        }
        let layout = self.0.layout;
        let col0 = x / model::TILE_WIDTH;
        let row0 = y / model::TILE_HEIGHT;
        let col1 = (x + w - 1) / model::TILE_WIDTH;
        let row1 = (y + h - 1) / model::TILE_HEIGHT;
        let slots = self.0.slots.lock().expect("tile manager slots poisoned");
        for row in row0..=row1.min(layout.tiles_per_column().saturating_sub(1)) {
            for col in col0..=col1.min(layout.tiles_per_row().saturating_sub(1)) {
                if let Ok(index) = layout.slot_index(col, row)
                    && let Some(tile) = &slots[index]
                {
                    tile.invalidate();
                }
            }
        }
    }

    fn run_validate(&self, tile: &TileHandle, col: u32, row: u32) {
        let callback = self
            .0
            .validate
            .lock()
            .expect("validate proc poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(self, tile, col, row);
        }
        tile.mark_valid();
    }

    /// Increments the tile's ref count; on the 0->1 transition, removes it
    /// from the cache, pulls its bytes from swap if absent, and validates
    /// it if invalid.
    fn lock_tile(&self, tile: &TileHandle, col: u32, row: u32) {
        let first_ref = tile.begin_lock();
        if first_ref {
            self.0.cache.flush(tile);
            let needs_swap_in = tile.state().data.is_none();
            if needs_swap_in {
                let _ = self.0.swap.swap_in(tile);
            }
            if !tile.is_valid() {
                self.run_validate(tile, col, row);
            }
        }
    }

    /// Decrements the tile's ref count; on reaching zero, either destroys
    /// the tile (if unshared) or hands it to the cache.
    pub fn release(&self, tile: &TileHandle, dirty: bool) {
        let unlocked = tile.release(dirty);
        if !unlocked {
            return;
        }
        if tile.share_count() == 0 {
            self.0.swap.swap_delete(tile);
        } else {
            let swap = self.0.swap.clone();
            self.0
                .cache
                .insert(tile.clone(), move |victim| match swap.swap_out(victim) {
                    Ok(()) => {
                        victim.state().data = None;
                        true
                    }
                    Err(_) => false,
                });
        }
    }

    /// Returns the tile at `(col, row)`, allocating and/or copy-on-write
    /// cloning it as needed, and locking it before returning. `None` if
    /// the slot is empty and neither `wantread` nor `wantwrite` was set.
    pub fn get_at(
        &self,
        col: u32,
        row: u32,
        wantread: bool,
        wantwrite: bool,
    ) -> Result<Option<TileHandle>, TileAccessError> {
        let index = self
            .0
            .layout
            .slot_index(col, row)
            .map_err(|_| TileAccessError::OutOfBounds)?;

        let mut current = {
            let slots = self.0.slots.lock().expect("tile manager slots poisoned");
            slots[index].clone()
        };

        if current.is_none() {
            if !wantread && !wantwrite {
                return Ok(None);
            }
            let (eff_w, eff_h) = self
                .0
                .layout
                .effective_tile_size(col, row)
                .map_err(|_| TileAccessError::OutOfBounds)?;
            let fresh = TileHandle::try_new(eff_w, eff_h, self.0.bpp)?;
            fresh.attach(self.0.id, index as u32);
            let mut slots = self.0.slots.lock().expect("tile manager slots poisoned");
            // Another caller may have raced us; keep whichever won.
            current = slots[index].clone().or(Some(fresh.clone()));
            if slots[index].is_none() {
                slots[index] = Some(fresh);
            }
        }
        let mut tile = current.expect("slot populated above");
        self.lock_tile(&tile, col, row);

        if wantwrite && tile.share_count() > 1 {
            let fresh = tile.try_clone_data_for_cow()?;
            self.release(&tile, false);
            let destroy = tile.detach(self.0.id, index as u32);
            if destroy.0 {
                self.0.swap.swap_delete(&tile);
            }
            fresh.attach(self.0.id, index as u32);
            {
                let mut slots = self.0.slots.lock().expect("tile manager slots poisoned");
                slots[index] = Some(fresh.clone());
            }
            self.lock_tile(&fresh, col, row);
            tile = fresh;
        }

        if wantwrite {
            tile.begin_write();
        }
        Ok(Some(tile))
    }

    /// Installs `src_tile` into slot `(col, row)`, attaching it and
    /// detaching (and possibly destroying) whatever was there before.
    /// Used by the undo layer to splice in a snapshot.
    pub fn map_tile(&self, col: u32, row: u32, src_tile: TileHandle) -> Result<(), TileAccessError> {
        let index = self
            .0
            .layout
            .slot_index(col, row)
            .map_err(|_| TileAccessError::OutOfBounds)?;
        let mut slots = self.0.slots.lock().expect("tile manager slots poisoned");
        if let Some(old) = slots[index].take() {
            detach_and_maybe_destroy(&self.0.cache, &self.0.swap, &old, self.0.id, index as u32);
        }
        src_tile.attach(self.0.id, index as u32);
        slots[index] = Some(src_tile);
        Ok(())
    }

    /// Bulk read of `[x0, x1) x [y0, y1)` into `dest`, tile by tile.
    pub fn read_pixel_data(
        &self,
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
        dest: &mut [u8],
        dest_stride: usize,
    ) -> Result<(), TileAccessError> {
        self.walk_rect(x0, y0, x1, y1, false, |tile, tx, ty, tw, th, ox, oy| {
            let state = tile.state();
            let data = state.data.as_deref().expect("locked tile has data");
            let bpp = state.bpp as usize;
            for row in 0..th {
                let src_off = state.pixel_offset(tx, ty + row as u32);
                let dst_off = (oy + row) * dest_stride + ox * bpp;
                dest[dst_off..dst_off + tw * bpp]
                    .copy_from_slice(&data[src_off..src_off + tw * bpp]);
            }
        })
    }

    /// Bulk write of `src` into `[x0, x1) x [y0, y1)`, tile by tile;
    /// every touched tile is released dirty.
    pub fn write_pixel_data(
        &self,
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
        src: &[u8],
        src_stride: usize,
    ) -> Result<(), TileAccessError> {
        self.walk_rect(x0, y0, x1, y1, true, |tile, tx, ty, tw, th, ox, oy| {
            let mut state = tile.state();
            let bpp = state.bpp as usize;
            for row in 0..th {
                let dst_off = state.pixel_offset(tx, ty + row as u32);
                let src_off = (oy + row) * src_stride + ox * bpp;
                let data = state.data.as_deref_mut().expect("locked tile has data");
                data[dst_off..dst_off + tw * bpp].copy_from_slice(&src[src_off..src_off + tw * bpp]);
            }
        })
    }

    pub fn read_pixel_data_1(&self, x: u32, y: u32, dst: &mut [u8]) -> Result<(), TileAccessError> {
        self.read_pixel_data(x, y, x + 1, y + 1, dst, dst.len())
    }

    pub fn write_pixel_data_1(&self, x: u32, y: u32, src: &[u8]) -> Result<(), TileAccessError> {
        self.write_pixel_data(x, y, x + 1, y + 1, src, src.len())
    }

    /// Shared tile-walking loop for the bulk read/write helpers: visits
    /// every tile overlapping `[x0,x1) x [y0,y1)`, locking (and, if
    /// `write`, write-locking) it, invoking `body`, then releasing.
    fn walk_rect(
        &self,
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
        write: bool,
        mut body: impl FnMut(&TileHandle, u32, u32, usize, usize, usize, usize),
    ) -> Result<(), TileAccessError> {
        if x1 > self.0.width || y1 > self.0.height || x0 >= x1 || y0 >= y1 {
            return Err(TileAccessError::OutOfBounds);
        }
        let tw = model::TILE_WIDTH;
        let th = model::TILE_HEIGHT;
        let mut y = y0;
        while y < y1 {
            let row = y / th;
            let row_bottom = ((row + 1) * th).min(y1);
            let mut x = x0;
            while x < x1 {
                let col = x / tw;
                let col_right = ((col + 1) * tw).min(x1);
                let tile = self
                    .get_at(col, row, true, write)?
                    .expect("wantread/wantwrite always materialises a tile");
                let tx = x - col * tw;
                let ty = y - row * th;
                let span_w = (col_right - x) as usize;
                let span_h = (row_bottom - y) as usize;
                let ox = (x - x0) as usize;
                let oy = (y - y0) as usize;
                body(&tile, tx, ty, span_w, span_h, ox, oy);
                self.release(&tile, write);
                x = col_right;
            }
            y = row_bottom;
        }
        Ok(())
    }
}

fn detach_and_maybe_destroy(
    cache: &Arc<TileCache>,
    swap: &Arc<TileSwap>,
    tile: &TileHandle,
    manager: ManagerId,
    slot: u32,
) {
    let destroy = tile.detach(manager, slot);
    if destroy.0 {
        cache.flush(tile);
        swap.swap_delete(tile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_manager(w: u32, h: u32) -> TileManager {
        let cache = Arc::new(TileCache::new(u64::MAX));
        let dir = std::env::temp_dir().join(format!(
            "tiles-manager-test-{}-{}",
            std::process::id(),
            w * 1000 + h
        ));
        let swap = Arc::new(TileSwap::init(&dir).unwrap());
        TileManager::new(w, h, PixelFormat::Rgba, cache, swap)
    }

    /// Two managers that share a tile (as `copy_on_write_keeps_shared_copy_untouched`
    /// does below) must also share the cache that owns that tile's LRU
    /// membership; a per-manager cache would flush a shared tile against
    /// the wrong instance's byte counters.
    fn sibling_managers(w: u32, h: u32) -> (TileManager, TileManager) {
        let cache = Arc::new(TileCache::new(u64::MAX));
        let dir = std::env::temp_dir().join(format!("tiles-manager-sibling-test-{}", std::process::id()));
        let swap = Arc::new(TileSwap::init(&dir).unwrap());
        (
            TileManager::new(w, h, PixelFormat::Rgba, cache.clone(), swap.clone()),
            TileManager::new(w, h, PixelFormat::Rgba, cache, swap),
        )
    }

    #[test]
    fn write_then_read_round_trips() {
        let manager = fresh_manager(128, 128);
        let pattern: Vec<u8> = (0..128 * 128 * 4).map(|i| (i % 251) as u8).collect();
        manager.write_pixel_data(0, 0, 128, 128, &pattern, 128 * 4).unwrap();
        let mut out = vec![0u8; pattern.len()];
        manager.read_pixel_data(0, 0, 128, 128, &mut out, 128 * 4).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn copy_on_write_keeps_shared_copy_untouched() {
        let (a, b) = sibling_managers(128, 128);
        let original = a.get_at(0, 0, true, true).unwrap().unwrap();
        original.state().data.as_mut().unwrap()[0..4].copy_from_slice(&[10, 20, 30, 40]);
        a.release(&original, true);

        let shared = a.get_at(0, 0, true, false).unwrap().unwrap();
        b.map_tile(0, 0, shared.clone()).unwrap();
        a.release(&shared, false);
        assert_eq!(shared.share_count(), 2);

        let for_write = a.get_at(0, 0, false, true).unwrap().unwrap();
        assert_eq!(for_write.share_count(), 1);
        for_write.state().data.as_mut().unwrap()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        a.release(&for_write, true);

        let b_tile = b.get_at(0, 0, true, false).unwrap().unwrap();
        assert_eq!(&b_tile.state().data.as_ref().unwrap()[0..4], &[10, 20, 30, 40]);
        b.release(&b_tile, false);

        let a_tile = a.get_at(0, 0, true, false).unwrap().unwrap();
        assert_eq!(&a_tile.state().data.as_ref().unwrap()[0..4], &[1, 2, 3, 4]);
        a.release(&a_tile, false);
        assert_ne!(a_tile, b_tile);
    }

    #[test]
    fn invalidate_area_triggers_validation_callback() {
        let manager = fresh_manager(128, 128);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        manager.set_validate_proc(move |_m, _t, _c, _r| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let t = manager.get_at(0, 0, true, false).unwrap().unwrap();
        manager.release(&t, false);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        manager.invalidate_area(0, 0, 128, 128);
        let t = manager.get_at(0, 0, true, false).unwrap().unwrap();
        manager.release(&t, false);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
