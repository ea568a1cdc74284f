//! Disk-backed paging store for tiles evicted from the cache. One append-
//! extend file per `TileSwap`, with a sorted gap list doing first-fit
//! allocation over it. Grounded on `examples/original_source/app/base/
//! tile-swap.c`: `MAX_OPEN_SWAP_FILES 16`, the `gimpswap.<pid>` filename,
//! and a 16 MiB growth increment (`1024 * TILE_WIDTH * TILE_HEIGHT * 4`).

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, Weak};

use crate::error::{SwapIoError, SwapOpenError};
use crate::tile::TileHandle;

const GROW_INCREMENT: u64 = 16 * 1024 * 1024;
const MAX_OPEN_SWAP_FILES: usize = 16;

/// Process-wide registry enforcing the "at most 16 open swap files"
/// limit (spec.md §4.4). The design permits several `TileSwap`s; only one
/// is constructed by the default [`crate::bootstrap::Core`], but the
/// limit is process-wide regardless of how many are live.
struct OpenFileRegistry {
    order: Mutex<VecDeque<Weak<OpenFileSlot>>>,
}

impl OpenFileRegistry {
    fn global() -> &'static OpenFileRegistry {
        static REGISTRY: OnceLock<OpenFileRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| OpenFileRegistry {
            order: Mutex::new(VecDeque::new()),
        })
    }

    fn note_opened(&self, slot: &std::sync::Arc<OpenFileSlot>) {
        let mut order = self.order.lock().expect("swap open-file registry poisoned");
        order.push_back(std::sync::Arc::downgrade(slot));
        while order.len() > MAX_OPEN_SWAP_FILES {
            match order.pop_front() {
                Some(weak) => {
                    if let Some(slot) = weak.upgrade() {
                        *slot.file.lock().expect("swap file handle poisoned") = None;
                    }
                }
                None => break,
            }
        }
    }
}

struct OpenFileSlot {
    file: Mutex<Option<File>>,
}

/// A sorted, non-overlapping free-space list over the swap file.
#[derive(Debug, Default)]
struct GapList {
    gaps: Vec<(u64, u64)>,
}

impl GapList {
    /// First-fit allocation of `size` bytes, splitting the chosen gap.
    /// Returns `None` if no existing gap is large enough.
    fn allocate(&mut self, size: u64) -> Option<u64> {
        let index = self
            .gaps
            .iter()
            .position(|&(start, end)| end - start >= size)?;
        let (start, end) = self.gaps[index];
        if end - start == size {
            self.gaps.remove(index);
        } else {
            self.gaps[index] = (start + size, end);
        }
        Some(start)
    }

    /// Inserts a freed `[start, end)` range, merging with neighbouring
    /// gaps. Returns `true` if the trailing gap now reaches `file_len`
    /// (caller should truncate), along with the new file length.
    fn free(&mut self, start: u64, end: u64, file_len: u64) -> Option<u64> {
        let insert_at = self.gaps.partition_point(|&(s, _)| s < start);
        let mut merged_start = start;
        let mut merged_end = end;

        if insert_at > 0 {
            let (prev_start, prev_end) = self.gaps[insert_at - 1];
            if prev_end == merged_start {
                merged_start = prev_start;
                self.gaps.remove(insert_at - 1);
            }
        }
        let insert_at = self.gaps.partition_point(|&(s, _)| s < merged_start);
        if insert_at < self.gaps.len() {
            let (next_start, next_end) = self.gaps[insert_at];
            if next_start == merged_end {
                merged_end = next_end;
                self.gaps.remove(insert_at);
            }
        }

        let insert_at = self.gaps.partition_point(|&(s, _)| s < merged_start);
        self.gaps.insert(insert_at, (merged_start, merged_end));

        if merged_end == file_len {
            let new_len = merged_start;
            self.gaps.remove(insert_at);
            Some(new_len)
        } else {
            None
        }
    }

    fn grow(&mut self, file_len: u64, amount: u64) {
        let insert_at = self.gaps.partition_point(|&(s, _)| s < file_len);
        if insert_at > 0 && self.gaps[insert_at - 1].1 == file_len {
            self.gaps[insert_at - 1].1 += amount;
        } else {
            self.gaps.insert(insert_at, (file_len, file_len + amount));
        }
    }
}

/// Latches so each I/O failure class logs at most one `warn!` (spec.md
/// §7, `seek_err_msg`/`read_err_msg`/`write_err_msg` in the original).
#[derive(Debug, Default)]
struct ErrorLatches {
    seek: AtomicBool,
    read: AtomicBool,
    write: AtomicBool,
}

impl ErrorLatches {
    fn warn_once(&self, which: SwapIoError, path: &Path) {
        let latch = match which {
            SwapIoError::Seek => &self.seek,
            SwapIoError::Read => &self.read,
            SwapIoError::Write | SwapIoError::Truncate => &self.write,
        };
        if !latch.swap(true, Ordering::Relaxed) {
            log::warn!("swap file {} failed at {}", which, path.display());
        }
    }
}

/// One append-extend backing file plus its gap allocator and lazily
/// opened file handle.
pub struct TileSwap {
    path: PathBuf,
    file: std::sync::Arc<OpenFileSlot>,
    state: Mutex<SwapState>,
    errors: ErrorLatches,
}

struct SwapState {
    gaps: GapList,
    len: u64,
}

impl TileSwap {
    /// Expands `dir`, creates it if missing, unlinks stray `gimpswap.*`
    /// files left by dead processes, and returns a `TileSwap` whose file
    /// is not yet opened (opened lazily on first write).
    pub fn init(dir: &Path) -> Result<Self, SwapOpenError> {
        fs::create_dir_all(dir).map_err(|err| SwapOpenError {
            path: dir.to_path_buf(),
            message: err.to_string(),
        })?;
        set_swap_dir_permissions(dir);
        clean_stale_swap_files(dir);

        let path = dir.join(format!("gimpswap.{}", std::process::id()));
        Ok(Self {
            path,
            file: std::sync::Arc::new(OpenFileSlot {
                file: Mutex::new(None),
            }),
            state: Mutex::new(SwapState {
                gaps: GapList::default(),
                len: 0,
            }),
            errors: ErrorLatches::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens and immediately closes a probe file at the configured path
    /// to confirm it is writable, without touching the real swap file.
    pub fn test(&self) -> bool {
        let probe = self.path.with_extension("probe");
        let ok = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&probe)
            .is_ok();
        let _ = fs::remove_file(&probe);
        ok
    }

    fn with_file<T>(
        &self,
        f: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> Result<T, SwapIoError> {
        let mut guard = self.file.file.lock().expect("swap file handle poisoned");
        if guard.is_none() {
            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .map_err(|_| SwapIoError::Seek)?;
            *guard = Some(opened);
            drop(guard);
            OpenFileRegistry::global().note_opened(&self.file);
            guard = self.file.file.lock().expect("swap file handle poisoned");
        }
        f(guard.as_mut().expect("swap file just opened")).map_err(|_| SwapIoError::Seek)
    }

    /// Reads `tile.size()` bytes from `tile.swap_offset` into the tile's
    /// data buffer. Does not free the occupied extent: the bytes may be
    /// reused immediately if the tile is dirtied again.
    pub fn swap_in(&self, tile: &TileHandle) -> Result<(), SwapIoError> {
        let (offset, size) = {
            let state = tile.state();
            (state.swap_offset, state.size())
        };
        debug_assert!(offset >= 0, "swap_in on a tile with no swap extent");
        let mut buf = vec![0u8; size];
        let result = self.with_file(|file| {
            file.seek(SeekFrom::Start(offset as u64))?;
            file.read_exact(&mut buf)?;
            Ok(())
        });
        match result {
            Ok(()) => {
                tile.state().data = Some(buf);
                Ok(())
            }
            Err(kind) => {
                self.errors.warn_once(SwapIoError::Read, &self.path);
                Err(kind)
            }
        }
    }

    /// Writes the tile's current data to its swap extent, allocating one
    /// via the gap list if it doesn't already have one. Clears `dirty`
    /// and records `swap_offset` on success.
    pub fn swap_out(&self, tile: &TileHandle) -> Result<(), SwapIoError> {
        let (existing_offset, size, data) = {
            let state = tile.state();
            let data = state
                .data
                .clone()
                .expect("swap_out of a tile with no resident data");
            (state.swap_offset, state.size(), data)
        };

        let offset = if existing_offset >= 0 {
            existing_offset as u64
        } else {
            self.allocate(size as u64)
        };

        let result = self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
            Ok(())
        });
        match result {
            Ok(()) => {
                let mut state = tile.state();
                state.dirty = false;
                state.swap_offset = offset as i64;
                Ok(())
            }
            Err(_) => {
                self.errors.warn_once(SwapIoError::Write, &self.path);
                Err(SwapIoError::Write)
            }
        }
    }

    /// Returns the tile's extent to the gap list, if it had one, merging
    /// with neighbours and truncating the file if the freed range now
    /// reaches EOF.
    pub fn swap_delete(&self, tile: &TileHandle) {
        let (offset, size) = {
            let mut state = tile.state();
            let offset = state.swap_offset;
            let size = state.size();
            state.swap_offset = -1;
            (offset, size)
        };
        if offset < 0 {
            return;
        }
        let start = offset as u64;
        let end = start + size as u64;

        let mut state = self.state.lock().expect("swap gap state poisoned");
        let file_len = state.len;
        if let Some(new_len) = state.gaps.free(start, end, file_len) {
            state.len = new_len;
            let path = self.path.clone();
            drop(state);
            let _ = self.with_file(move |file| file.set_len(new_len));
            let _ = path;
        }
    }

    fn allocate(&self, size: u64) -> u64 {
        let mut state = self.state.lock().expect("swap gap state poisoned");
        if let Some(offset) = state.gaps.allocate(size) {
            return offset;
        }
        let grow_amount = size.max(GROW_INCREMENT);
        let file_len = state.len;
        state.gaps.grow(file_len, grow_amount);
        state.len += grow_amount;
        state
            .gaps
            .allocate(size)
            .expect("just-grown gap must satisfy the allocation")
    }

    /// Current file length, used by tests and the gap-merge scenario.
    pub fn file_len(&self) -> u64 {
        self.state.lock().expect("swap gap state poisoned").len
    }
}

impl Drop for TileSwap {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn clean_stale_swap_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(pid_str) = name.strip_prefix("gimpswap.") else {
            continue;
        };
        let Ok(pid) = pid_str.parse::<u32>() else {
            continue;
        };
        if pid == std::process::id() || !process_is_alive(pid) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// Sets the swap directory's permission bits explicitly (`rwxr-xr-x`)
/// instead of relying on the process umask, matching the ground-truth
/// `g_mkdir_with_parents(swapdir, S_IRUSR|S_IXUSR|S_IWUSR|S_IRGRP|S_IXGRP|
/// S_IROTH|S_IXOTH)` call. Best-effort: a failure here does not prevent
/// swap use, it only leaves the directory's mode up to the umask.
#[cfg(unix)]
fn set_swap_dir_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o755));
}

#[cfg(not(unix))]
fn set_swap_dir_permissions(_dir: &Path) {}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // A zero-signal `kill` performs no action besides reporting whether
    // the process exists and is reachable.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_merge_collapses_to_single_trailing_range() {
        let mut gaps = GapList::default();
        let file_len = 5 * 16 * 1024;
        // Five 16 KiB extents back to back, all allocated.
        let extents: Vec<(u64, u64)> = (0..5)
            .map(|i| (i * 16 * 1024, (i + 1) * 16 * 1024))
            .collect();
        let mut len = 0u64;
        let mut truncated = None;
        for &(start, end) in &[
            extents[1], extents[3], extents[0], extents[2], extents[4],
        ] {
            len = len.max(file_len);
            if let Some(new_len) = gaps.free(start, end, file_len) {
                truncated = Some(new_len);
            }
        }
        assert_eq!(truncated, Some(0));
        assert!(gaps.gaps.is_empty());
    }

    #[test]
    fn allocate_splits_first_fitting_gap() {
        let mut gaps = GapList::default();
        gaps.grow(0, 1024);
        let a = gaps.allocate(256).unwrap();
        let b = gaps.allocate(256).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 256);
        assert_eq!(gaps.gaps, vec![(512, 1024)]);
    }

    #[test]
    fn round_trip_through_swap_in_out() {
        let dir = std::env::temp_dir().join(format!("tiles-swap-test-{}", std::process::id()));
        let swap = TileSwap::init(&dir).unwrap();
        let tile = TileHandle::new(4, 4, 1);
        tile.state().data = Some(vec![7u8; 16]);
        swap.swap_out(&tile).unwrap();
        tile.state().data = None;
        swap.swap_in(&tile).unwrap();
        assert_eq!(tile.state().data.as_deref(), Some([7u8; 16].as_slice()));
        swap.swap_delete(&tile);
        assert_eq!(swap.file_len(), 0);
        drop(swap);
        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn init_sets_explicit_directory_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("tiles-swap-perms-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let swap = TileSwap::init(&dir).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        drop(swap);
        let _ = fs::remove_dir_all(&dir);
    }
}
