//! Thin wrappers over the classic `mount(2)` family, plus setup and
//! teardown of the staging tmpfs.
//!
//! Callers decide what a failure means: inside the node tree everything is
//! logged and skipped, while the staging tmpfs itself is the one mount that
//! must succeed.

use std::ffi::CStr;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use rustix::mount::{
    mount, mount_change, mount_move, mount_bind_recursive, mount_remount, unmount, MountFlags,
    MountPropagationFlags, UnmountFlags,
};

use crate::config::Config;

/// Recursive bind of `from` onto `to` (`MS_BIND | MS_REC`).
pub fn bind_mount(from: &Path, to: &Path) -> rustix::io::Result<()> {
    mount_bind_recursive(from, to)
}

/// Atomically repositions the mount at `from` onto `to` (`MS_MOVE`).
pub fn move_mount(from: &Path, to: &Path) -> rustix::io::Result<()> {
    mount_move(from, to)
}

/// Remounts the filesystem at `target` read-only.
pub fn remount_ro(target: &Path) -> rustix::io::Result<()> {
    mount_remount(target, MountFlags::RDONLY, "")
}

/// Remounts a single bind at `target` read-only without touching the
/// underlying filesystem (`MS_REMOUNT | MS_BIND | MS_RDONLY`).
pub fn remount_bind_ro(target: &Path) -> rustix::io::Result<()> {
    mount_remount(target, MountFlags::BIND | MountFlags::RDONLY, "")
}

/// Marks the mount at `target` private so later changes do not propagate
/// into peer groups.
pub fn make_private(target: &Path) -> rustix::io::Result<()> {
    mount_change(target, MountPropagationFlags::PRIVATE)
}

/// Lazily detaches the mount at `target` (`MNT_DETACH`).
pub fn detach(target: &Path) -> rustix::io::Result<()> {
    unmount(target, UnmountFlags::DETACH)
}

/// Mounts the staging tmpfs at the work directory, tagged with the
/// configured magic source, and makes it private.  This is the only mount
/// whose failure aborts the run.
pub fn setup_work_dir(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("create {}", config.work_dir.display()))?;
    mount(
        config.magic.as_str(),
        &config.work_dir,
        "tmpfs",
        MountFlags::empty(),
        None::<&CStr>,
    )
    .with_context(|| format!("mount staging tmpfs at {}", config.work_dir.display()))?;
    make_private(&config.work_dir)
        .with_context(|| format!("make {} private", config.work_dir.display()))?;
    Ok(())
}

/// Detaches the staging tmpfs.  By this point every composed subtree has
/// been moved out of it, so losing it is not fatal.
pub fn detach_work_dir(config: &Config) {
    if let Err(err) = detach(&config.work_dir) {
        warn!("detach {}: {err}", config.work_dir.display());
    }
}
