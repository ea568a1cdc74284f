//! Ordered init/teardown of the swap file, tile cache, and worker pool,
//! plus the glue that forwards host config hot-reloads and swap-open
//! failures to the rest of the crate (spec.md §2 "Subsystem bootstrap",
//! §6 "External interfaces"). Grounded on the channel-based cross-thread
//! notification idiom in `examples/SunastanS-glaphica/crates/engine/src/
//! lib.rs`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};

use crate::cache::TileCache;
use crate::config::{ConfigChange, CoreConfig, SwapNotification};
use crate::error::SwapOpenError;
use crate::parallel::Processor;
use crate::swap::TileSwap;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 16;

/// How often the pre-swap agent re-checks the stop flag even without a
/// wakeup, so shutdown is bounded even if a notification is ever missed.
const PRESWAP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Owns, in construction order, the swap file, the tile cache, the
/// background pre-swap agent thread, and the parallel processor's thread
/// count. Dropping a `Core` tears these down in reverse order via their
/// own `Drop` impls; [`Core::shutdown`] exists only to make that ordering
/// (and the agent thread join, which has no `Drop` equivalent) explicit at
/// call sites.
pub struct Core {
    swap: Arc<TileSwap>,
    cache: Arc<TileCache>,
    processor: Arc<Processor>,
    notifications_rx: Receiver<SwapNotification>,
    preswap_stop: Arc<AtomicBool>,
    preswap_thread: Option<JoinHandle<()>>,
}

impl Core {
    /// Constructs the swap file, probes it writable, builds the cache at
    /// the configured byte budget, starts the background pre-swap agent,
    /// and sizes the processor's thread count to `config.num_processors()`.
    /// Surfaces a writable-probe failure as `SwapOpenError` both through
    /// the `Err` return and the [`SwapNotification`] channel, per spec.md
    /// §7.
    pub fn init(config: &dyn CoreConfig) -> Result<Self, SwapOpenError> {
        let swap = Arc::new(TileSwap::init(&config.swap_path())?);
        let (notifications_tx, notifications_rx) = bounded(NOTIFICATION_CHANNEL_CAPACITY);

        ensure_temp_dir(&config.temp_path());

        if !swap.test() {
            let err = SwapOpenError {
                path: swap.path().to_path_buf(),
                message: "swap directory is not writable".to_string(),
            };
            log::error!("{err}");
            let _ = notifications_tx.send(SwapNotification::OpenFailed(err.path.clone()));
            return Err(err);
        }

        let cache = Arc::new(TileCache::new(config.tile_cache_size()));
        let processor = Arc::new(Processor::new(config.num_processors()));

        let preswap_stop = Arc::new(AtomicBool::new(false));
        let preswap_thread = std::thread::spawn({
            let cache = cache.clone();
            let swap = swap.clone();
            let stop = preswap_stop.clone();
            move || run_preswap_agent(&cache, &swap, &stop)
        });

        Ok(Self {
            swap,
            cache,
            processor,
            notifications_rx,
            preswap_stop,
            preswap_thread: Some(preswap_thread),
        })
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn swap(&self) -> &Arc<TileSwap> {
        &self.swap
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    /// The receiving end of the swap-failure notification channel a host
    /// UI can subscribe to (spec.md §7, "only `SwapOpenError` is surfaced
    /// to the user interface").
    pub fn notifications(&self) -> Receiver<SwapNotification> {
        self.notifications_rx.clone()
    }

    /// Forwards a hot-reloaded property to the subsystem it governs.
    /// `temp_path`/`swap_path` are read once at [`Core::init`] and are not
    /// hot-reloadable (SPEC_FULL.md §4.10).
    pub fn apply_config_change(&self, change: ConfigChange) {
        match change {
            ConfigChange::TileCacheSize(bytes) => {
                let swap = self.swap.clone();
                self.cache.set_size(bytes, move |tile| swap.swap_out(tile).is_ok());
            }
            ConfigChange::NumProcessors(n) => self.processor.set_num_threads(n),
        }
    }

    /// Tears down in reverse construction order. Cancellation of
    /// in-flight operators already happens inside
    /// `Processor::process_parallel*`, which blocks on `thread::scope`
    /// until every worker returns, so by the time a caller holds a
    /// `Core` value to call this on, no processor call can still be
    /// running concurrently with it. The pre-swap agent thread is signalled
    /// to stop and joined before the cache and swap file it uses are torn
    /// down. Shutdown does not flush remaining dirty tiles to swap: swap is
    /// scratch space, not durable storage (spec.md §1 non-goals), so the
    /// swap file is simply unlinked by `TileSwap`'s own `Drop`.
    pub fn shutdown(mut self) {
        self.preswap_stop.store(true, Ordering::Release);
        self.cache.wake_preswap_agent();
        if let Some(handle) = self.preswap_thread.take() {
            let _ = handle.join();
        }
        drop(self.processor);
        drop(self.cache);
        drop(self.swap);
    }
}

/// Body of the background pre-swap agent thread (spec.md §4.2): parks until
/// dirty bytes exceed half the cache's budget (or the stop flag is set),
/// then repeatedly writes the dirty-list head to swap and moves it to the
/// clean-list tail until back under the threshold. Grounded on
/// `examples/original_source/app/base/tile-cache.c`'s pre-swap thread loop.
fn run_preswap_agent(cache: &TileCache, swap: &TileSwap, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        cache.park_preswap_agent(PRESWAP_POLL_INTERVAL);
        if stop.load(Ordering::Acquire) {
            return;
        }
        while let Some(tile) = cache.preswap_candidate() {
            match swap.swap_out(&tile) {
                Ok(()) => {
                    tile.state().data = None;
                    cache.preswap_mark_clean(tile);
                }
                Err(_) => {
                    cache.preswap_restore(tile);
                    break;
                }
            }
            if stop.load(Ordering::Acquire) {
                return;
            }
        }
    }
}

/// Creates the host's scratch temp directory if missing, with the same
/// explicit permission bits as the swap directory (ground truth: `base_init`
/// in `examples/original_source/trunk/app/base/base.c` creates `temp-path`
/// alongside `swap-path`, both `rwxr-xr-x`). This crate never writes into
/// the directory itself; only the swap file lives under `swap_path`. Best
/// effort: a failure here does not fail `Core::init`, matching the original,
/// which only gates its return value on the swap probe.
fn ensure_temp_dir(dir: &Path) {
    if dir.as_os_str().is_empty() || std::fs::metadata(dir).is_ok() {
        return;
    }
    if std::fs::create_dir_all(dir).is_ok() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct TestConfig {
        dir: PathBuf,
        temp_dir: PathBuf,
        tile_cache_size: u64,
    }

    impl CoreConfig for TestConfig {
        fn temp_path(&self) -> PathBuf {
            self.temp_dir.clone()
        }
        fn swap_path(&self) -> PathBuf {
            self.dir.clone()
        }
        fn tile_cache_size(&self) -> u64 {
            self.tile_cache_size
        }
        fn num_processors(&self) -> usize {
            2
        }
    }

    #[test]
    fn init_and_shutdown_round_trip() {
        let dir = std::env::temp_dir().join(format!("tiles-bootstrap-test-{}", std::process::id()));
        let temp_dir = std::env::temp_dir().join(format!("tiles-bootstrap-test-temp-{}", std::process::id()));
        let config = TestConfig {
            dir: dir.clone(),
            temp_dir: temp_dir.clone(),
            tile_cache_size: 1024 * 1024,
        };
        let core = Core::init(&config).unwrap();
        assert_eq!(core.processor().num_threads(), 2);
        assert_eq!(core.cache().max_bytes(), 1024 * 1024);
        assert!(temp_dir.is_dir(), "Core::init must create config.temp_path()");
        core.apply_config_change(ConfigChange::NumProcessors(4));
        assert_eq!(core.processor().num_threads(), 4);
        core.shutdown();
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn preswap_agent_clears_dirty_tiles_above_threshold() {
        let dir = std::env::temp_dir().join(format!("tiles-bootstrap-preswap-test-{}", std::process::id()));
        let temp_dir = std::env::temp_dir().join(format!("tiles-bootstrap-preswap-test-temp-{}", std::process::id()));
        // A budget of exactly one tile's size means inserting it alone
        // already trips the "dirty bytes exceed half budget" wakeup.
        let tile_bytes = 16usize;
        let config = TestConfig {
            dir: dir.clone(),
            temp_dir: temp_dir.clone(),
            tile_cache_size: tile_bytes as u64,
        };
        let core = Core::init(&config).unwrap();

        let tile = crate::tile::TileHandle::new(4, 4, 1);
        core.cache().insert(tile, |_| false);
        assert_eq!(core.cache().dirty_bytes(), tile_bytes);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while core.cache().dirty_bytes() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(
            core.cache().dirty_bytes(),
            0,
            "pre-swap agent should have written the dirty tile to swap"
        );

        core.shutdown();
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_dir_all(&temp_dir);
    }
}
