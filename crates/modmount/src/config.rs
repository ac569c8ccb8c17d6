//! Runtime configuration, threaded by reference through the composer
//! instead of living in process-wide mutable state.

use std::path::{Path, PathBuf};

/// Where modules live: one subdirectory per module, each with an optional
/// `disable` / `skip_mount` marker and a `system/` contribution subtree.
pub const MODULE_ROOT: &str = "/data/adb/modules";

/// Default mountpoint for the staging tmpfs.
pub const WORK_DIR: &str = "/debug_ramdisk";

/// Default source tag of the staging tmpfs.  Teardown identifies our own
/// synthetic tmpfs mounts by this tag.
pub const MAGIC: &str = "magic";

/// Partitions that modules may target through their `system/<partition>/`
/// subtree and which are mounted as their own roots when the partition
/// exists as a real directory.
pub const DEFAULT_PARTITIONS: &[&str] = &["vendor", "product", "system_ext"];

#[derive(Debug, Clone)]
pub struct Config {
    /// Base of the target filesystem.  Always `/` in production; tests point
    /// this at a scratch directory.
    pub root: PathBuf,
    /// Module directory to enumerate.
    pub module_root: PathBuf,
    /// Root used as the *source* of module bind mounts.  Usually the same
    /// location as `module_root`; a deployment may substitute a snapshot.
    pub module_mnt: PathBuf,
    /// Mountpoint of the staging tmpfs under which tmpfs subtrees are
    /// assembled before being moved into place.
    pub work_dir: PathBuf,
    /// Source tag for the staging tmpfs.
    pub magic: String,
    /// Partition names (no leading slash) eligible for extraction out of the
    /// merged `system` subtree.
    pub partitions: Vec<String>,
    /// When set, an entry that cannot be represented under a fixed mount
    /// root aborts preparation instead of being dropped with a warning.
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            module_root: PathBuf::from(MODULE_ROOT),
            module_mnt: PathBuf::from(MODULE_ROOT),
            work_dir: PathBuf::from(WORK_DIR),
            magic: MAGIC.to_string(),
            partitions: DEFAULT_PARTITIONS.iter().map(|p| p.to_string()).collect(),
            strict: false,
        }
    }
}

impl Config {
    /// Target path of a node, i.e. where the composed entry becomes visible.
    pub(crate) fn node_path(&self, rpath: &Path) -> PathBuf {
        self.root.join(rpath)
    }

    /// Staging path of a node under the work directory.
    pub(crate) fn worker_path(&self, rpath: &Path) -> PathBuf {
        self.work_dir.join(rpath)
    }

    /// Adds a partition to the extraction set.  Leading slashes are
    /// stripped; empty names and duplicates are ignored.
    pub fn add_partition(&mut self, partition: &str) {
        let name = partition.trim_start_matches('/');
        if !name.is_empty() && !self.partitions.iter().any(|p| p == name) {
            self.partitions.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_partitions() {
        let config = Config::default();
        assert_eq!(config.partitions, ["vendor", "product", "system_ext"]);
        assert_eq!(config.work_dir, Path::new("/debug_ramdisk"));
        assert_eq!(config.module_root, config.module_mnt);
    }

    #[test]
    fn test_add_partition() {
        let mut config = Config::default();
        config.add_partition("/odm");
        config.add_partition("odm");
        config.add_partition("/");
        config.add_partition("");
        assert_eq!(
            config.partitions,
            ["vendor", "product", "system_ext", "odm"]
        );
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.root = PathBuf::from("/srv/base");
        config.work_dir = PathBuf::from("/tmp/stage");
        let rpath = Path::new("system/lib/libfoo.so");
        assert_eq!(
            config.node_path(rpath),
            Path::new("/srv/base/system/lib/libfoo.so")
        );
        assert_eq!(
            config.worker_path(rpath),
            Path::new("/tmp/stage/system/lib/libfoo.so")
        );
    }
}
