//! Module discovery and the mount driver.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rustix::fs::{lstat, openat, FileType, Mode, OFlags, CWD};

use crate::config::Config;
use crate::tree::Node;

/// Marker disabling a module entirely.
const DISABLE: &str = "disable";
/// Marker keeping a module installed but excluded from mounting.
const SKIP_MOUNT: &str = "skip_mount";
/// Reserved bookkeeping entry in the module root; never a module.
const CORE_DIR: &str = ".core";
/// Name of a module's contribution subtree.
const SYSTEM_DIR: &str = "system";

/// An enumerated, enabled module.  Opaque to the node tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: OsString,
}

/// Enumerates the module root, skipping `.core` and disabled modules.
/// A missing module root yields an empty list.
///
/// Modules come back in directory-listing order; on leaf collisions the
/// last one wins.  Callers wanting deterministic precedence sort the list
/// before passing it to [`load_modules`].
pub fn scan_modules(config: &Config) -> Result<Vec<ModuleInfo>> {
    let entries = match fs::read_dir(&config.module_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", config.module_root.display()))
        }
    };

    let mut modules = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name == CORE_DIR {
            continue;
        }
        if entry.path().join(DISABLE).exists() {
            continue;
        }
        modules.push(ModuleInfo { name });
    }
    Ok(modules)
}

/// Folds every module's `system/` contribution into a node tree and
/// extracts configured partitions that exist as real directories into their
/// own roots.  Returns `None` when no module contributes anything.
fn build_tree(config: &Config, modules: &[ModuleInfo]) -> Result<Option<Node>> {
    let mut system = Node::new_root();

    for module in modules {
        let base = config.module_root.join(&module.name);
        if base.join(SKIP_MOUNT).exists() {
            continue;
        }
        let fd = match openat(
            CWD,
            base.join(SYSTEM_DIR),
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(_) => continue,
        };
        info!("{}: loading mount files", module.name.to_string_lossy());
        if let Err(err) = system.collect_module_files(&module.name, fd) {
            warn!(
                "{}: collecting files: {err:#}",
                module.name.to_string_lossy()
            );
        }
    }

    if system.is_empty() {
        return Ok(None);
    }

    let mut root = Node::new_root();
    for partition in &config.partitions {
        let path = config.node_path(Path::new(partition));
        let is_dir = matches!(
            lstat(&path),
            Ok(st) if FileType::from_raw_mode(st.st_mode) == FileType::Directory
        );
        if !is_dir {
            continue;
        }
        // Modules ship partition content under system/<partition>/; mount
        // it at /<partition> when that is a real directory of its own.
        if let Some(node) = system.extract(partition) {
            debug!("mounting {partition} as its own root");
            root.insert(partition.as_str(), node.into_partition_root());
        }
    }
    root.insert(SYSTEM_DIR, system);
    Ok(Some(root))
}

/// Builds the composed tree for the given modules, prepares it, and
/// executes the mounts.  No contribution is a successful no-op.
pub fn load_modules(config: &Config, modules: &[ModuleInfo]) -> Result<()> {
    let Some(mut root) = build_tree(config, modules)? else {
        return Ok(());
    };
    root.prepare(config)?;
    root.mount(config);
    Ok(())
}

/// Scans the module root and installs every enabled module's overlay.
pub fn handle_modules(config: &Config) -> Result<()> {
    debug!("collecting modules");
    let modules = scan_modules(config)?;
    debug!("loading modules");
    load_modules(config, &modules)
}

#[cfg(test)]
mod tests {
    use crate::tree::NodeKind;

    use super::*;

    fn test_config(scratch: &Path) -> Config {
        Config {
            root: scratch.join("base"),
            module_root: scratch.join("modules"),
            module_mnt: scratch.join("modules"),
            work_dir: scratch.join("worker"),
            ..Config::default()
        }
    }

    fn write_file(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_scan_filters_modules() {
        let scratch = tempfile::tempdir().unwrap();
        let config = test_config(scratch.path());
        let modules = &config.module_root;
        fs::create_dir_all(modules.join("m1")).unwrap();
        fs::create_dir_all(modules.join("m2")).unwrap();
        write_file(&modules.join("m2/disable"), b"");
        fs::create_dir_all(modules.join(".core")).unwrap();
        write_file(&modules.join("stray-file"), b"");

        let mut found = scan_modules(&config).unwrap();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            found,
            vec![ModuleInfo { name: "m1".into() }]
        );
    }

    #[test]
    fn test_scan_missing_module_root() {
        let scratch = tempfile::tempdir().unwrap();
        let config = test_config(scratch.path());
        assert!(scan_modules(&config).unwrap().is_empty());
    }

    #[test]
    fn test_build_tree_skips_skip_mount_and_no_system() {
        let scratch = tempfile::tempdir().unwrap();
        let config = test_config(scratch.path());
        write_file(
            &config.module_root.join("skipped/system/lib/x.so"),
            b"",
        );
        write_file(&config.module_root.join("skipped/skip_mount"), b"");
        fs::create_dir_all(config.module_root.join("empty")).unwrap();

        let modules = [
            ModuleInfo {
                name: "skipped".into(),
            },
            ModuleInfo {
                name: "empty".into(),
            },
        ];
        assert!(build_tree(&config, &modules).unwrap().is_none());
    }

    #[test]
    fn test_build_tree_extracts_existing_partition() {
        let scratch = tempfile::tempdir().unwrap();
        let config = test_config(scratch.path());
        fs::create_dir_all(config.root.join("vendor/lib")).unwrap();
        write_file(
            &config.module_root.join("m1/system/vendor/lib/libv.so"),
            b"",
        );
        write_file(&config.module_root.join("m1/system/lib/libfoo.so"), b"");

        let modules = [ModuleInfo { name: "m1".into() }];
        let root = build_tree(&config, &modules).unwrap().unwrap();

        let vendor = root.get("vendor").unwrap();
        assert!(matches!(vendor.kind(), NodeKind::Root { .. }));
        assert!(vendor.get("lib").unwrap().get("libv.so").is_some());

        let system = root.get("system").unwrap();
        assert!(system.get("vendor").is_none());
        assert!(system.get("lib").unwrap().get("libfoo.so").is_some());
    }

    #[test]
    fn test_build_tree_keeps_partition_without_real_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let config = test_config(scratch.path());
        // No base/vendor directory exists.
        fs::create_dir_all(&config.root).unwrap();
        write_file(
            &config.module_root.join("m1/system/vendor/lib/libv.so"),
            b"",
        );

        let modules = [ModuleInfo { name: "m1".into() }];
        let root = build_tree(&config, &modules).unwrap().unwrap();

        assert!(root.get("vendor").is_none());
        assert!(root
            .get("system")
            .unwrap()
            .get("vendor")
            .unwrap()
            .get("lib")
            .is_some());
    }

    #[test]
    fn test_build_tree_ignores_partition_symlink() {
        let scratch = tempfile::tempdir().unwrap();
        let config = test_config(scratch.path());
        fs::create_dir_all(config.root.join("system/vendor")).unwrap();
        std::os::unix::fs::symlink("system/vendor", config.root.join("vendor")).unwrap();
        write_file(
            &config.module_root.join("m1/system/vendor/lib/libv.so"),
            b"",
        );

        let modules = [ModuleInfo { name: "m1".into() }];
        let root = build_tree(&config, &modules).unwrap().unwrap();

        // A symlinked partition is not extracted; the content mounts under
        // the system subtree it was shipped in.
        assert!(root.get("vendor").is_none());
        assert!(root.get("system").unwrap().get("vendor").is_some());
    }
}
