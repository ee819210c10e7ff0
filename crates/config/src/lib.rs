//! # Config - ShoalDB tuning knobs
//!
//! Everything the storage engine can be tuned with lives here so that the
//! lower crates (`memtable`, `sstable`) and the [`engine`] agree on one set
//! of defaults.
//!
//! | Type              | Purpose                                         |
//! |-------------------|-------------------------------------------------|
//! | [`Options`]       | Per-database settings passed to `Db::open`      |
//! | [`ReadOptions`]   | Per-read settings (snapshot, checksum checks)   |
//! | [`WriteOptions`]  | Per-write settings (fsync)                      |
//! | [`Comparator`]    | User key ordering (default: bytewise)           |
//!
//! ## Environment overrides
//!
//! [`Options::from_env`] layers the following variables over the defaults:
//!
//! ```text
//! SHOAL_WRITE_BUFFER_KB  mutable stage budget in KiB     (default: 4096)
//! SHOAL_MAX_FILE_KB      max table file size in KiB      (default: 2048)
//! SHOAL_CACHE_TABLES     open table handles kept cached  (default: 1000)
//! SHOAL_L0_TRIGGER       L0 files that trigger a merge   (default: 4)
//! SHOAL_CREATE           create the store if missing     (default: true)
//! ```
//!
//! [`engine`]: ../engine/index.html

mod comparator;
mod options;

pub use comparator::{BytewiseComparator, Comparator};
pub use options::{Options, ReadOptions, WriteOptions};
