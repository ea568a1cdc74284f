//! Bounded in-memory pool of materialised tile data: two doubly-linked
//! LRU lists (clean, dirty) plus byte counters, and an optional
//! background pre-swap agent. Grounded on `examples/original_source/
//! app/base/tile-cache.c` (`tile_cache_insert`, `tile_cache_flush`,
//! the `cur_cache_dirty` counter and its wakeup threshold).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::tile::{CacheList, TileHandle};

struct CacheLists {
    clean: VecDeque<TileHandle>,
    dirty: VecDeque<TileHandle>,
    current_bytes: usize,
    dirty_bytes: usize,
    max_bytes: usize,
}

impl CacheLists {
    fn list_mut(&mut self, which: CacheList) -> &mut VecDeque<TileHandle> {
        match which {
            CacheList::Clean => &mut self.clean,
            CacheList::Dirty => &mut self.dirty,
        }
    }

    /// Removes `tile` from whichever list it is on, if any, adjusting
    /// counters. No-op if the tile isn't cached.
    fn remove(&mut self, tile: &TileHandle) {
        let slot = tile.state().cache_slot.take();
        let Some(which) = slot else { return };
        let size = tile.size();
        let list = self.list_mut(which);
        if let Some(pos) = list.iter().position(|t| t == tile) {
            list.remove(pos);
        }
        self.current_bytes -= size;
        if which == CacheList::Dirty {
            self.dirty_bytes -= size;
        }
    }

    fn push_tail(&mut self, tile: TileHandle, which: CacheList) {
        let size = tile.size();
        tile.state().cache_slot = Some(which);
        self.current_bytes += size;
        if which == CacheList::Dirty {
            self.dirty_bytes += size;
        }
        self.list_mut(which).push_back(tile);
    }

    fn pop_head(&mut self, which: CacheList) -> Option<TileHandle> {
        let tile = self.list_mut(which).pop_front()?;
        let size = tile.size();
        tile.state().cache_slot = None;
        self.current_bytes -= size;
        if which == CacheList::Dirty {
            self.dirty_bytes -= size;
        }
        Some(tile)
    }
}

/// Two-list LRU cache of tile bytes, bounded by a configurable byte
/// budget. Eviction is driven by the caller of [`TileCache::insert`]
/// (always a [`crate::manager::TileManager`]), since only it can invoke
/// [`crate::swap::TileSwap::swap_out`].
pub struct TileCache {
    lists: Mutex<CacheLists>,
    preswap_wake: Condvar,
}

impl TileCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            lists: Mutex::new(CacheLists {
                clean: VecDeque::new(),
                dirty: VecDeque::new(),
                current_bytes: 0,
                dirty_bytes: 0,
                max_bytes: max_bytes as usize,
            }),
            preswap_wake: Condvar::new(),
        }
    }

    pub fn current_bytes(&self) -> usize {
        self.lists.lock().expect("cache lists poisoned").current_bytes
    }

    pub fn dirty_bytes(&self) -> usize {
        self.lists.lock().expect("cache lists poisoned").dirty_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.lists.lock().expect("cache lists poisoned").max_bytes
    }

    /// Removes a tile from whichever list it's on (used when a cached
    /// tile is re-locked, or destroyed outright).
    pub fn flush(&self, tile: &TileHandle) {
        self.lists.lock().expect("cache lists poisoned").remove(tile);
    }

    /// Inserts a newly-released tile, first evicting clean-list then
    /// dirty-list heads until the tile will fit within budget.
    /// `evict_dirty` is supplied by the caller because eviction of a
    /// dirty tile requires a swap write, which this module doesn't own;
    /// on write failure (it returns `false`) the dirty tile at hand stays
    /// in-core and is pushed back to the tail of the dirty list (spec.md
    /// §4.2 "On write failure the tile remains in-core").
    pub fn insert(&self, tile: TileHandle, mut evict_dirty: impl FnMut(&TileHandle) -> bool) {
        let one_tile_max = tile.size();
        loop {
            let mut lists = self.lists.lock().expect("cache lists poisoned");
            if lists.current_bytes + one_tile_max <= lists.max_bytes {
                break;
            }
            if let Some(head) = lists.pop_head(CacheList::Clean) {
                drop(lists);
                // Already persisted to swap (that's what put it on the
                // clean list); freeing the in-memory buffer is enough.
                head.state().data = None;
            } else if let Some(head) = lists.pop_head(CacheList::Dirty) {
                drop(lists);
                if !evict_dirty(&head) {
                    let mut lists = self.lists.lock().expect("cache lists poisoned");
                    lists.push_tail(head, CacheList::Dirty);
                    break;
                }
            } else {
                break;
            }
        }

        let which = {
            let state = tile.state();
            if state.dirty || state.swap_offset < 0 {
                CacheList::Dirty
            } else {
                CacheList::Clean
            }
        };
        let mut lists = self.lists.lock().expect("cache lists poisoned");
        lists.push_tail(tile, which);
        if lists.dirty_bytes * 2 > lists.max_bytes {
            self.preswap_wake.notify_one();
        }
    }

    pub fn set_size(&self, max_bytes: u64, mut evict_dirty: impl FnMut(&TileHandle) -> bool) {
        {
            let mut lists = self.lists.lock().expect("cache lists poisoned");
            lists.max_bytes = max_bytes as usize;
        }
        loop {
            let over = {
                let lists = self.lists.lock().expect("cache lists poisoned");
                lists.current_bytes > lists.max_bytes
            };
            if !over {
                break;
            }
            let victim = {
                let mut lists = self.lists.lock().expect("cache lists poisoned");
                lists
                    .pop_head(CacheList::Clean)
                    .or_else(|| lists.pop_head(CacheList::Dirty))
            };
            match victim {
                Some(tile) => {
                    let was_dirty = tile.state().dirty || tile.state().swap_offset < 0;
                    if was_dirty {
                        if !evict_dirty(&tile) {
                            let mut lists = self.lists.lock().expect("cache lists poisoned");
                            lists.push_tail(tile, CacheList::Dirty);
                            break;
                        }
                    } else {
                        tile.state().data = None;
                    }
                }
                None => break,
            }
        }
    }

    /// Takes the dirty-list head without freeing its slot in the list
    /// counters until the caller confirms the write succeeded, for use by
    /// the background pre-swap agent (spec.md §4.2).
    pub fn preswap_candidate(&self) -> Option<TileHandle> {
        let mut lists = self.lists.lock().expect("cache lists poisoned");
        if lists.dirty_bytes * 2 <= lists.max_bytes {
            return None;
        }
        lists.pop_head(CacheList::Dirty)
    }

    pub fn preswap_mark_clean(&self, tile: TileHandle) {
        let mut lists = self.lists.lock().expect("cache lists poisoned");
        lists.push_tail(tile, CacheList::Clean);
    }

    pub fn preswap_restore(&self, tile: TileHandle) {
        let mut lists = self.lists.lock().expect("cache lists poisoned");
        lists.push_tail(tile, CacheList::Dirty);
    }

    /// Blocks the pre-swap agent thread until dirty bytes exceed half the
    /// budget or `timeout` elapses, whichever comes first (spec.md §4.2
    /// "Pre-swap agent ... sleeps otherwise").
    pub fn park_preswap_agent(&self, timeout: std::time::Duration) {
        let lists = self.lists.lock().expect("cache lists poisoned");
        let _ = self
            .preswap_wake
            .wait_timeout_while(lists, timeout, |l| l.dirty_bytes * 2 <= l.max_bytes);
    }

    /// Wakes the pre-swap agent thread unconditionally, regardless of the
    /// dirty-byte threshold. Used at shutdown so the agent observes a stop
    /// signal promptly instead of waiting out its poll timeout.
    pub fn wake_preswap_agent(&self) {
        self.preswap_wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirty_tile(bytes: usize) -> TileHandle {
        let side = (bytes as f64).sqrt() as u32;
        let tile = TileHandle::new(side, side, 1);
        tile.state().dirty = false; // never swapped => counts as dirty anyway
        tile
    }

    #[test]
    fn insert_respects_budget_by_evicting_clean_first() {
        let cache = TileCache::new(0);
        // budget 0 forces immediate eviction attempts; with no swap
        // available (`evict_dirty` always fails), tiles accumulate as a
        // single dirty entry.
        let tile = dirty_tile(16);
        cache.insert(tile, |_| false);
        assert_eq!(cache.dirty_bytes(), 16);
    }

    #[test]
    fn clean_tiles_evict_before_dirty_tiles() {
        let cache = TileCache::new(16);
        let clean = TileHandle::new(4, 4, 1);
        clean.state().dirty = false;
        clean.state().swap_offset = 0; // already on swap => eligible for clean list
        cache.insert(clean, |_| true);
        assert_eq!(cache.current_bytes(), 16);

        let mut evicted_clean = false;
        let next = dirty_tile(16);
        cache.insert(next, |_| {
            evicted_clean = true;
            true
        });
        // Clean-list head should have been evicted without calling
        // evict_dirty (which only applies to the dirty list).
        assert!(!evicted_clean);
        assert_eq!(cache.current_bytes(), 16);
    }
}
