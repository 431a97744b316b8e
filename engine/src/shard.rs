//! Shard routing and shard-count selection.
//!
//! A document's shard is a pure function of its path: the 128-bit MD5 of the
//! UTF-8 path bytes modulo the shard count, matching the layout of existing
//! data directories. The count itself is fixed the first time a data
//! directory is populated — read back from disk on every later start — and
//! chosen by a capacity heuristic over cores, memory, and storage class.

use std::path::Path;
use sysinfo::{Disks, System};

/// Shard file name prefix; `complete_search_db_<i>.db` for i in [0, N).
pub const SHARD_FILE_PREFIX: &str = "complete_search_db_";

/// Bounds for the shard count.
pub const MIN_SHARDS: usize = 2;
pub const MAX_SHARDS: usize = 64;

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Map a document path to its shard index. Pure and stable across runs.
pub fn shard_index(path: &str, shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    let digest = md5::compute(path.as_bytes());
    (u128::from_be_bytes(digest.0) % shard_count as u128) as usize
}

/// Path of shard `i` inside the data-storage directory.
pub fn shard_path(data_dir: &Path, index: usize) -> std::path::PathBuf {
    data_dir.join(format!("{SHARD_FILE_PREFIX}{index}.db"))
}

/// Shard count recorded in an existing data directory, if any. The count is
/// one past the highest shard index present, so a partially corrupted
/// directory still reports the original N.
pub fn discover_shard_count(data_dir: &Path) -> Option<usize> {
    let entries = std::fs::read_dir(data_dir).ok()?;
    let mut max_index: Option<usize> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix(SHARD_FILE_PREFIX) {
            if let Some(idx) = rest.strip_suffix(".db").and_then(|s| s.parse::<usize>().ok()) {
                max_index = Some(max_index.map_or(idx, |m: usize| m.max(idx)));
            }
        }
    }
    max_index.map(|m| (m + 1).clamp(MIN_SHARDS, MAX_SHARDS))
}

// ---------------------------------------------------------------------------
// Capacity heuristic
// ---------------------------------------------------------------------------

/// Broad storage class of the volume holding the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Nvme,
    Ssd,
    Hdd,
    Unknown,
}

impl StorageClass {
    fn multiplier(self) -> f64 {
        match self {
            Self::Nvme => 1.4,
            Self::Ssd => 1.2,
            Self::Unknown => 1.0,
            Self::Hdd => 0.7,
        }
    }
}

/// Hardware facts feeding the shard-count heuristic. Split from the probing
/// so the arithmetic stays testable with fixed inputs.
#[derive(Debug, Clone)]
pub struct HardwareProfile {
    pub physical_cores: usize,
    pub logical_cores: usize,
    pub memory_gib: f64,
    pub storage: StorageClass,
    pub existing_data_bytes: u64,
}

impl HardwareProfile {
    /// Probe the running system. Falls back to small conservative values when
    /// the platform hides a detail.
    pub fn detect(data_dir: &Path) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let logical_cores = sys.cpus().len().max(1);
        let physical_cores = sys.physical_core_count().unwrap_or(logical_cores.div_ceil(2)).max(1);
        let memory_gib = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

        let storage = detect_storage_class(data_dir);
        let existing_data_bytes = dir_size(data_dir);

        Self { physical_cores, logical_cores, memory_gib, storage, existing_data_bytes }
    }

    /// Number of shards this machine should run, per the capacity heuristic.
    pub fn optimal_shard_count(&self) -> usize {
        let logical = self.logical_cores as f64;
        let base = match self.physical_cores {
            c if c >= 20 => logical.min(48.0),
            c if c >= 16 => logical.min(40.0),
            c if c >= 12 => logical.min(32.0),
            c if c >= 8 => (logical * 0.8).min(24.0),
            c if c >= 6 => (logical * 0.75).min(16.0),
            c if c >= 4 => (logical * 0.6).min(12.0),
            c => (c as f64).max(2.0),
        };

        let mem_mul = match self.memory_gib {
            m if m >= 128.0 => 2.2,
            m if m >= 64.0 => 2.0,
            m if m >= 32.0 => 1.7,
            m if m >= 16.0 => 1.4,
            m if m >= 8.0 => 1.0,
            m if m >= 4.0 => 0.8,
            _ => 0.6,
        };

        // More existing data spreads over more shards, capped at 2x.
        let existing_gib = self.existing_data_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let size_mul = 1.0 + (existing_gib / 64.0).min(1.0);

        let n = (base * mem_mul * self.storage.multiplier() * size_mul).round() as usize;
        n.clamp(MIN_SHARDS, MAX_SHARDS)
    }
}

fn detect_storage_class(data_dir: &Path) -> StorageClass {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, StorageClass)> = None;
    for disk in disks.iter() {
        let mount = disk.mount_point();
        if !data_dir.starts_with(mount) {
            continue;
        }
        let depth = mount.components().count();
        let class = match disk.kind() {
            sysinfo::DiskKind::SSD => {
                if disk.name().to_string_lossy().to_lowercase().contains("nvme") {
                    StorageClass::Nvme
                } else {
                    StorageClass::Ssd
                }
            }
            sysinfo::DiskKind::HDD => StorageClass::Hdd,
            sysinfo::DiskKind::Unknown(_) => StorageClass::Unknown,
        };
        // Deepest matching mount point wins
        if best.map_or(true, |(d, _)| depth > d) {
            best = Some((depth, class));
        }
    }
    best.map(|(_, c)| c).unwrap_or(StorageClass::Unknown)
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_is_stable_across_calls() {
        let a = shard_index("/x/y/z.txt", 4);
        let b = shard_index("/x/y/z.txt", 4);
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn router_spreads_paths() {
        let n = 8;
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(shard_index(&format!("/data/file_{i}.txt"), n));
        }
        // 200 paths over 8 shards must land on more than one shard
        assert!(seen.len() > 1);
        assert!(seen.iter().all(|&s| s < n));
    }

    fn profile(cores: usize, logical: usize, mem: f64) -> HardwareProfile {
        HardwareProfile {
            physical_cores: cores,
            logical_cores: logical,
            memory_gib: mem,
            storage: StorageClass::Unknown,
            existing_data_bytes: 0,
        }
    }

    #[test]
    fn heuristic_clamps_to_bounds() {
        assert_eq!(profile(1, 1, 0.5).optimal_shard_count(), MIN_SHARDS);
        let big = HardwareProfile {
            physical_cores: 32,
            logical_cores: 64,
            memory_gib: 256.0,
            storage: StorageClass::Nvme,
            existing_data_bytes: 200 * 1024 * 1024 * 1024,
        };
        assert_eq!(big.optimal_shard_count(), MAX_SHARDS);
    }

    #[test]
    fn heuristic_mid_range_machine() {
        // 8 physical / 16 logical, 16 GiB: base 12.8, mem 1.4 -> 17.92 -> 18
        assert_eq!(profile(8, 16, 16.0).optimal_shard_count(), 18);
    }

    #[test]
    fn discover_returns_none_for_empty_dir() {
        let dir = std::env::temp_dir().join("docfind-shard-test-empty");
        let _ = std::fs::create_dir_all(&dir);
        assert_eq!(discover_shard_count(&dir), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
