//! A single fixed-size page of one layer's raster, plus its lock/share
//! bookkeeping. See `crate::manager` for the grid that owns tiles and
//! `crate::cache` for the LRU lists a released tile lives on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::OutOfMemory;
use crate::format::RowHint;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a `TileManager` without holding a strong reference to it, so
/// a tile's back-link list can name the managers sharing it without
/// creating an ownership cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

impl ManagerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackLink {
    pub manager: ManagerId,
    pub slot: u32,
}

/// Where a tile currently sits relative to the cache's two LRU lists.
/// `None` means the tile is either locked or was never inserted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheList {
    Clean,
    Dirty,
}

#[derive(Debug)]
pub(crate) struct TileState {
    pub eff_width: u32,
    pub eff_height: u32,
    pub bpp: u32,
    pub data: Option<Vec<u8>>,
    pub dirty: bool,
    pub valid: bool,
    pub ref_count: u32,
    pub write_count: u32,
    pub row_hints: Option<Vec<RowHint>>,
    pub swap_offset: i64,
    pub back_links: Vec<BackLink>,
    /// Which of the cache's two lists the tile currently sits on; `None`
    /// while locked or not yet inserted. Doubles as the tile's `cached`
    /// flag.
    pub cache_slot: Option<CacheList>,
}

impl TileState {
    pub fn size(&self) -> usize {
        (self.eff_width as usize) * (self.eff_height as usize) * (self.bpp as usize)
    }

    pub fn share_count(&self) -> usize {
        self.back_links.len()
    }

    pub fn is_cached(&self) -> bool {
        self.cache_slot.is_some()
    }

    pub fn row_hint(&self, y: u32) -> RowHint {
        self.row_hints
            .as_ref()
            .and_then(|hints| hints.get(y as usize).copied())
            .unwrap_or(RowHint::Unknown)
    }

    pub fn set_row_hint(&mut self, y: u32, hint: RowHint) {
        if self.row_hints.is_none() {
            self.row_hints = Some(vec![RowHint::Unknown; self.eff_height as usize]);
        }
        if let Some(hints) = self.row_hints.as_mut()
            && let Some(slot) = hints.get_mut(y as usize)
        {
            *slot = hint;
        }
    }

    fn reset_row_hints(&mut self) {
        if let Some(hints) = self.row_hints.as_mut() {
            hints.fill(RowHint::Unknown);
        }
    }

    /// Offset of pixel `(x, y)` into `self.data`. Caller must hold the
    /// tile's lock (i.e. be inside a `TileHandle::with_state` closure with
    /// `ref_count > 0`) and know `data` is populated.
    pub fn pixel_offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.eff_width as usize + x as usize) * self.bpp as usize
    }
}

/// A reference-counted handle to one tile. Cloning shares the same
/// underlying storage (the Rust analogue of the C original's raw-pointer
/// sharing); `share_count` is tracked explicitly in `TileState` rather than
/// via `Arc::strong_count`, since a lock briefly clones this handle too.
#[derive(Debug, Clone)]
pub struct TileHandle(Arc<Mutex<TileState>>);

impl PartialEq for TileHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for TileHandle {}

/// Outcome of releasing a lock or a share: tells the caller (always a
/// `TileManager`) whether it must now ask the cache to flush the tile and
/// the swap file to free its slot, because both counters hit zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShouldDestroy(pub bool);

impl TileHandle {
    /// A freshly-allocated, zeroed tile. Never yet swapped
    /// (`swap_offset == -1`), so the cache will treat it as dirty until the
    /// first `swap_out` regardless of whether anyone has written to it.
    ///
    /// Panics on allocation failure; callers that must surface
    /// `TileAccessError::OutOfMemory` to a caller instead (spec.md §4.3,
    /// §7.1) should use [`TileHandle::try_new`].
    pub fn new(eff_width: u32, eff_height: u32, bpp: u32) -> Self {
        Self::try_new(eff_width, eff_height, bpp).expect("tile buffer allocation failed")
    }

    /// Fallible counterpart of [`TileHandle::new`]: reports allocation
    /// failure instead of aborting the process, per spec.md §4.3
    /// "allocation failure propagates as an error".
    pub fn try_new(eff_width: u32, eff_height: u32, bpp: u32) -> Result<Self, OutOfMemory> {
        let len = (eff_width as usize)
            .checked_mul(eff_height as usize)
            .and_then(|area| area.checked_mul(bpp as usize))
            .ok_or(OutOfMemory)?;
        let data = try_zeroed(len)?;
        Ok(Self::with_data(eff_width, eff_height, bpp, data))
    }

    pub(crate) fn with_data(eff_width: u32, eff_height: u32, bpp: u32, data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(TileState {
            eff_width,
            eff_height,
            bpp,
            data: Some(data),
            dirty: false,
            valid: false,
            ref_count: 0,
            write_count: 0,
            row_hints: None,
            swap_offset: -1,
            back_links: Vec::new(),
            cache_slot: None,
        })))
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TileState> {
        self.0.lock().expect("tile mutex poisoned")
    }

    pub fn size(&self) -> usize {
        self.state().size()
    }

    pub fn is_valid(&self) -> bool {
        self.state().valid
    }

    pub fn mark_valid(&self) {
        self.state().valid = true;
    }

    pub fn invalidate(&self) {
        self.state().valid = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn ref_count(&self) -> u32 {
        self.state().ref_count
    }

    pub fn share_count(&self) -> usize {
        self.state().share_count()
    }

    /// Whether the tile currently sits on one of the cache's LRU lists,
    /// as opposed to being locked or not yet inserted.
    pub fn is_cached(&self) -> bool {
        self.state().is_cached()
    }

    /// A row's cached opacity classification, used by callers that want
    /// to skip fully-transparent or fully-opaque rows during compositing
    /// without re-scanning pixel data (spec.md §3/§9 "row hints as a
    /// sparse enum"). Resets to `Unknown` whenever the tile is released
    /// dirty.
    pub fn row_hint(&self, y: u32) -> RowHint {
        self.state().row_hint(y)
    }

    pub fn set_row_hint(&self, y: u32, hint: RowHint) {
        self.state().set_row_hint(y, hint);
    }

    /// `lock`: bumps the ref count. The caller (always `TileManager`) is
    /// responsible for removing the tile from the cache and pulling its
    /// bytes from swap the first time the count goes 0 -> 1; that requires
    /// the cache and swap, which this type does not hold, so it is done by
    /// `TileManager::get_at` immediately after calling this.
    pub(crate) fn begin_lock(&self) -> bool {
        let mut state = self.state();
        let first_ref = state.ref_count == 0;
        state.ref_count += 1;
        first_ref
    }

    /// `release`: decrements the ref count; if `dirty`, also decrements
    /// the write count and resets row hints. Returns whether the tile is
    /// now fully unlocked (ref_count reached 0), in which case the caller
    /// must hand it back to the cache (or destroy it, if also unshared).
    pub fn release(&self, dirty: bool) -> bool {
        let mut state = self.state();
        assert!(state.ref_count > 0, "release on a tile with no lock held");
        state.ref_count -= 1;
        if dirty {
            state.dirty = true;
            assert!(state.write_count > 0, "dirty release without a write lock");
            state.write_count -= 1;
            state.reset_row_hints();
        }
        state.ref_count == 0
    }

    pub(crate) fn begin_write(&self) {
        self.state().write_count += 1;
    }

    /// `attach`: adds a back-link, bumping the share count.
    pub(crate) fn attach(&self, manager: ManagerId, slot: u32) {
        let mut state = self.state();
        debug_assert!(
            !state
                .back_links
                .iter()
                .any(|link| link.manager == manager && link.slot == slot),
            "duplicate attach of the same manager slot"
        );
        state.back_links.push(BackLink { manager, slot });
    }

    /// `detach`: removes the matching back-link. Returns `ShouldDestroy` if
    /// both the share count and the ref count are now zero.
    pub(crate) fn detach(&self, manager: ManagerId, slot: u32) -> ShouldDestroy {
        let mut state = self.state();
        let position = state
            .back_links
            .iter()
            .position(|link| link.manager == manager && link.slot == slot)
            .expect("detach of a manager slot the tile has no back-link for");
        state.back_links.remove(position);
        ShouldDestroy(state.back_links.is_empty() && state.ref_count == 0)
    }

    /// A private copy of this tile's current bytes, for copy-on-write.
    /// Panics if the data buffer is absent (the manager must have locked,
    /// hence materialised, the tile before calling this) or on allocation
    /// failure; see [`TileHandle::try_clone_data_for_cow`] for the
    /// fallible form.
    pub fn clone_data_for_cow(&self) -> TileHandle {
        self.try_clone_data_for_cow()
            .expect("tile buffer allocation failed")
    }

    /// Fallible counterpart of [`TileHandle::clone_data_for_cow`].
    pub fn try_clone_data_for_cow(&self) -> Result<TileHandle, OutOfMemory> {
        let state = self.state();
        let src = state
            .data
            .as_deref()
            .expect("copy-on-write clone of a tile with no resident data");
        let mut data = Vec::new();
        data.try_reserve_exact(src.len()).map_err(|_| OutOfMemory)?;
        data.extend_from_slice(src);
        let clone = TileHandle::with_data(state.eff_width, state.eff_height, state.bpp, data);
        clone.state().valid = state.valid;
        Ok(clone)
    }
}

/// Allocates a zeroed buffer without aborting the process on failure.
fn try_zeroed(len: usize) -> Result<Vec<u8>, OutOfMemory> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_new_reports_out_of_memory_instead_of_aborting() {
        // A buffer this large cannot be allocated; `try_new` must return
        // `Err` rather than letting the process abort, per spec.md §4.3.
        assert!(TileHandle::try_new(u32::MAX, u32::MAX, 4).is_err());
    }

    #[test]
    fn lock_then_release_round_trips_ref_count() {
        let tile = TileHandle::new(64, 64, 4);
        assert!(tile.begin_lock());
        assert_eq!(tile.ref_count(), 1);
        assert!(tile.release(false));
        assert_eq!(tile.ref_count(), 0);
    }

    #[test]
    fn attach_detach_tracks_share_count() {
        let tile = TileHandle::new(8, 8, 1);
        let a = ManagerId::next();
        let b = ManagerId::next();
        tile.attach(a, 0);
        tile.attach(b, 3);
        assert_eq!(tile.share_count(), 2);
        assert_eq!(tile.detach(a, 0), ShouldDestroy(false));
        assert_eq!(tile.detach(b, 3), ShouldDestroy(true));
    }

    #[test]
    fn dirty_release_resets_row_hints() {
        let tile = TileHandle::new(4, 4, 1);
        tile.begin_lock();
        tile.begin_write();
        tile.state().set_row_hint(1, RowHint::Opaque);
        assert_eq!(tile.state().row_hint(1), RowHint::Opaque);
        tile.release(true);
        assert_eq!(tile.state().row_hint(1), RowHint::Unknown);
    }
}
