//! Teardown: detaches every mount a previous composer run installed.

use std::path::Path;

use anyhow::Result;
use log::{debug, warn};

use crate::mount;
use crate::mountinfo::{self, MountInfo};

/// Module binds show their mount root under this path: the module
/// directory lives on the userdata filesystem, whose mount root strips the
/// `/data` prefix.
const MODULE_BIND_ROOT: &str = "/adb/modules/";

/// True for mounts this tool installs: module file binds, and the
/// synthetic tmpfs overlays tagged with our magic source.
pub fn is_composer_mount(info: &MountInfo, magic: &str) -> bool {
    info.root.starts_with(MODULE_BIND_ROOT) || (info.source == magic && info.fs_type == "tmpfs")
}

/// Detaches every mount installed by a previous `mount` run with the same
/// magic.  Failures are reported but not propagated, and a second run
/// finds nothing left to select, so the operation is idempotent.
pub fn unmount_modules(magic: &str) -> Result<()> {
    let targets: Vec<String> = mountinfo::read_self()?
        .into_iter()
        .filter(|info| is_composer_mount(info, magic))
        .map(|info| info.target)
        .collect();

    for target in &targets {
        match mount::detach(Path::new(target)) {
            Ok(()) => debug!("umount {target}"),
            Err(err) => warn!("umount {target}: {err}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(root: &str, source: &str, fs_type: &str) -> MountInfo {
        MountInfo {
            root: root.to_string(),
            source: source.to_string(),
            fs_type: fs_type.to_string(),
            ..MountInfo::default()
        }
    }

    #[test]
    fn test_selects_module_binds() {
        let info = record("/adb/modules/m1/system/lib/libfoo.so", "/dev/sda2", "ext4");
        assert!(is_composer_mount(&info, "magic"));
    }

    #[test]
    fn test_selects_tagged_tmpfs() {
        assert!(is_composer_mount(&record("/", "magic", "tmpfs"), "magic"));
        // Same tag, different filesystem type: someone else's mount.
        assert!(!is_composer_mount(&record("/", "magic", "ext4"), "magic"));
        // Different tag.
        assert!(!is_composer_mount(&record("/", "tmpfs", "tmpfs"), "magic"));
    }

    #[test]
    fn test_ignores_unrelated_mounts() {
        assert!(!is_composer_mount(
            &record("/", "/dev/nvme0n1p2", "ext4"),
            "magic"
        ));
        assert!(!is_composer_mount(
            &record("/modules/m1", "/dev/sda2", "ext4"),
            "magic"
        ));
    }
}
