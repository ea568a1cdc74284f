//! The interface this crate expects from the host's configuration
//! subsystem (spec.md §6), plus the channel the bootstrap object uses to
//! forward hot-reloads and surface user-visible swap failures.

use std::path::PathBuf;

/// Read-only snapshot of the four properties the core cares about.
/// Only `tile_cache_size` and `num_processors` are hot-reloadable; the two
/// paths are read once at [`crate::bootstrap::Core::init`].
pub trait CoreConfig {
    fn temp_path(&self) -> PathBuf;
    fn swap_path(&self) -> PathBuf;
    fn tile_cache_size(&self) -> u64;
    fn num_processors(&self) -> usize;
}

/// A hot-reloadable property changing. Pushed into
/// [`crate::bootstrap::Core::apply_config_change`] by the host whenever its
/// own config subsystem observes one of these two properties change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    TileCacheSize(u64),
    NumProcessors(usize),
}

/// User-facing notifications. Currently only `SwapOpenError` is surfaced
/// to the interface (spec.md §7); modeled as an enum so the channel can
/// grow more notification kinds without changing its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapNotification {
    OpenFailed(PathBuf),
}
