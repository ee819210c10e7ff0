use std::sync::Arc;

use crate::{BytewiseComparator, Comparator};

/// Database-wide settings.
///
/// Construct with [`Options::default`] and override fields directly:
///
/// ```rust
/// let mut opts = config::Options::default();
/// opts.create_if_missing = true;
/// opts.write_buffer_size = 64 * 1024;
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct Options {
    /// Create the store if the directory holds no database.
    pub create_if_missing: bool,
    /// Fail `open` if a database already exists at the path.
    pub error_if_exists: bool,
    /// Fail recovery on a log record that does not decode instead of
    /// skipping it, and verify every data block a table read touches.
    pub paranoid_checks: bool,
    /// Bytes buffered in the mutable stage before it is frozen and flushed.
    pub write_buffer_size: usize,
    /// Target size of a single table file produced by compaction.
    pub max_file_size: usize,
    /// Uncompressed size of a data block inside a table.
    pub block_size: usize,
    /// Number of open table handles the table cache keeps.
    pub table_cache_capacity: usize,
    /// Bloom filter density; `None` writes tables without a filter.
    pub bloom_bits_per_key: Option<usize>,
    /// L0 file count that makes L0 eligible for compaction.
    pub l0_compaction_trigger: usize,
    /// L0 file count at which each write is delayed by 1 ms.
    pub l0_slowdown_writes_trigger: usize,
    /// L0 file count at which writes wait for compaction.
    pub l0_stop_writes_trigger: usize,
    /// Byte budget of level 1; level `n` gets `base * multiplier^(n-1)`.
    pub max_bytes_for_level_base: u64,
    pub level_size_multiplier: u64,
    /// Number of levels, including level 0.
    pub num_levels: usize,
    /// Upper bound on the bytes one group commit may combine.
    pub max_write_group_bytes: usize,
    /// User key ordering.
    pub comparator: Arc<dyn Comparator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_file_size: 2 * 1024 * 1024,
            block_size: 4 * 1024,
            table_cache_capacity: 1000,
            bloom_bits_per_key: Some(10),
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            max_bytes_for_level_base: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            num_levels: 7,
            max_write_group_bytes: 1024 * 1024,
            comparator: Arc::new(BytewiseComparator),
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_file_size", &self.max_file_size)
            .field("block_size", &self.block_size)
            .field("table_cache_capacity", &self.table_cache_capacity)
            .field("bloom_bits_per_key", &self.bloom_bits_per_key)
            .field("l0_compaction_trigger", &self.l0_compaction_trigger)
            .field("l0_slowdown_writes_trigger", &self.l0_slowdown_writes_trigger)
            .field("l0_stop_writes_trigger", &self.l0_stop_writes_trigger)
            .field("max_bytes_for_level_base", &self.max_bytes_for_level_base)
            .field("level_size_multiplier", &self.level_size_multiplier)
            .field("num_levels", &self.num_levels)
            .field("max_write_group_bytes", &self.max_write_group_bytes)
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

/// Parses `key` through `lookup`, falling back to `default`.
fn var_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Options {
    /// Defaults overridden by `SHOAL_*` environment variables.
    ///
    /// Unparseable values fall back to the default silently, the same way
    /// the shell has always treated them.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`Options::from_env`] with variables read through `lookup`.
    ///
    /// A raised `SHOAL_L0_TRIGGER` lifts the slowdown and stop triggers
    /// with it so the result still validates.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let kib = |key: &str, default: usize| {
            var_or(&lookup, key, default / 1024).saturating_mul(1024)
        };
        let l0_compaction_trigger = var_or(&lookup, "SHOAL_L0_TRIGGER", d.l0_compaction_trigger);
        let l0_slowdown_writes_trigger = d.l0_slowdown_writes_trigger.max(l0_compaction_trigger);
        let l0_stop_writes_trigger = d.l0_stop_writes_trigger.max(l0_slowdown_writes_trigger);
        Self {
            create_if_missing: var_or(&lookup, "SHOAL_CREATE", true),
            write_buffer_size: kib("SHOAL_WRITE_BUFFER_KB", d.write_buffer_size),
            max_file_size: kib("SHOAL_MAX_FILE_KB", d.max_file_size),
            table_cache_capacity: var_or(&lookup, "SHOAL_CACHE_TABLES", d.table_cache_capacity),
            l0_compaction_trigger,
            l0_slowdown_writes_trigger,
            l0_stop_writes_trigger,
            ..d
        }
    }

    /// Checks the settings for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.write_buffer_size == 0 {
            return Err("write_buffer_size must be > 0".into());
        }
        if self.max_file_size == 0 {
            return Err("max_file_size must be > 0".into());
        }
        if self.block_size < 64 {
            return Err(format!("block_size {} is below the 64 byte minimum", self.block_size));
        }
        if self.table_cache_capacity == 0 {
            return Err("table_cache_capacity must be > 0".into());
        }
        if self.num_levels < 2 {
            return Err(format!("num_levels must be >= 2, got {}", self.num_levels));
        }
        if self.l0_compaction_trigger == 0 {
            return Err("l0_compaction_trigger must be > 0".into());
        }
        if self.l0_slowdown_writes_trigger < self.l0_compaction_trigger {
            return Err("l0_slowdown_writes_trigger must be >= l0_compaction_trigger".into());
        }
        if self.l0_stop_writes_trigger < self.l0_slowdown_writes_trigger {
            return Err("l0_stop_writes_trigger must be >= l0_slowdown_writes_trigger".into());
        }
        if self.level_size_multiplier < 2 {
            return Err("level_size_multiplier must be >= 2".into());
        }
        if self.bloom_bits_per_key == Some(0) {
            return Err("bloom_bits_per_key must be > 0 (use None to disable)".into());
        }
        Ok(())
    }

    /// Byte budget for `level` (level 0 is governed by file count instead).
    #[must_use]
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut result = self.max_bytes_for_level_base;
        for _ in 1..level {
            result = result.saturating_mul(self.level_size_multiplier);
        }
        result
    }
}

/// Per-write settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// `fsync` the log before acknowledging the write.
    pub sync: bool,
}

/// Per-read settings.
///
/// `S` is the engine's snapshot type; keeping it generic lets this crate stay
/// free of engine dependencies.
#[derive(Debug)]
pub struct ReadOptions<'a, S> {
    /// Read as of this snapshot instead of the latest state.
    pub snapshot: Option<&'a S>,
    /// Verify block checksums of everything read from table files.
    pub verify_checksums: bool,
    /// Keep table handles opened by this read in the table cache.
    pub fill_cache: bool,
}

impl<S> Clone for ReadOptions<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for ReadOptions<'_, S> {}

impl<S> Default for ReadOptions<'_, S> {
    fn default() -> Self {
        Self {
            snapshot: None,
            verify_checksums: false,
            fill_cache: true,
        }
    }
}
