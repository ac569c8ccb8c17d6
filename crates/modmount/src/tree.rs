//! The virtual node tree.
//!
//! A typed tree mirroring the union of every module's contribution.  Each
//! path is classified into a mount strategy in two passes: `collect` builds
//! the union, `prepare` walks it post-order and decides per directory
//! whether a shallow bind suffices or a synthetic tmpfs must be interposed,
//! and `mount` materializes the decisions top-down.  Bind-mounting requires
//! the target inode to exist and not be a symlink; whenever a child
//! violates this, the enclosing directory is upgraded to a tmpfs into which
//! placeholder inodes can be created and bound over.

use std::collections::btree_map::{BTreeMap, Entry};
use std::ffi::{OsStr, OsString};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{debug, warn};
use rustix::fd::AsFd;
use rustix::fs::{lstat, openat, statat, AtFlags, Dir, FileType, Mode, OFlags};
use thiserror::Error;

use crate::attr;
use crate::config::Config;
use crate::mount;

/// A file named `.replace` inside a contributed directory shadows the
/// underlying directory entirely instead of merging with it.
pub const REPLACE_NAME: &str = ".replace";

#[derive(Error, Debug)]
pub enum TreeError {
    /// An entry that can only be represented inside a synthetic tmpfs was
    /// found directly under a mount root, which cannot be upgraded.  Only
    /// raised in strict mode; the default policy drops the entry.
    #[error("unsupported entry {0:?} under a fixed mount root")]
    UnsupportedChild(PathBuf),
}

/// File type of a node, from `d_type` at collection time or `lstat` during
/// preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFileType {
    Directory,
    RegularFile,
    Symlink,
    /// Devices, fifos, sockets: never overlaid.
    Other,
}

impl From<FileType> for NodeFileType {
    fn from(file_type: FileType) -> Self {
        match file_type {
            FileType::Directory => NodeFileType::Directory,
            FileType::RegularFile => NodeFileType::RegularFile,
            FileType::Symlink => NodeFileType::Symlink,
            _ => NodeFileType::Other,
        }
    }
}

impl From<std::fs::FileType> for NodeFileType {
    fn from(file_type: std::fs::FileType) -> Self {
        if file_type.is_dir() {
            NodeFileType::Directory
        } else if file_type.is_file() {
            NodeFileType::RegularFile
        } else if file_type.is_symlink() {
            NodeFileType::Symlink
        } else {
            NodeFileType::Other
        }
    }
}

/// Node variant.  The declaration order is the upgrade order: a node may
/// only ever be replaced by a variant of strictly higher rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Placeholder accumulating children while the union is built.
    Intermediate,
    /// A concrete file, symlink, or special file contributed by exactly one
    /// module.  Later contributions under the same name win.
    Module { module: OsString },
    /// A directory (or, inside one, a re-exposed base entry) realized in a
    /// synthetic tmpfs overlay.
    Tmpfs,
    /// A top-level partition root.
    Root {
        /// Path component between the module name and the node path when
        /// resolving a backing file.  Partition roots extracted out of the
        /// merged `system` subtree carry `"system"` here, since their
        /// content is shipped under `<module>/system/<partition>/`.
        source_prefix: &'static str,
    },
}

impl NodeKind {
    fn rank(&self) -> u8 {
        match self {
            NodeKind::Intermediate => 0,
            NodeKind::Module { .. } => 1,
            NodeKind::Tmpfs => 2,
            NodeKind::Root { .. } => 3,
        }
    }
}

const TMPFS_RANK: u8 = 2;

/// One name in one directory of the composed overlay.
#[derive(Debug)]
pub struct Node {
    kind: NodeKind,
    file_type: NodeFileType,
    /// Whether the corresponding path exists in the base filesystem.
    exists: bool,
    /// Shadow the underlying directory instead of merging with it.
    replace: bool,
    children: BTreeMap<OsString, Node>,
}

struct MountCtx<'a> {
    config: &'a Config,
    /// `source_prefix` of the partition root owning this subtree.
    prefix: &'a str,
}

impl Node {
    fn new(kind: NodeKind, file_type: NodeFileType) -> Self {
        Self {
            kind,
            file_type,
            exists: false,
            replace: false,
            children: BTreeMap::new(),
        }
    }

    /// A partition root (or the unnamed tree root holding the partition
    /// roots as children).
    pub fn new_root() -> Self {
        Self::new(NodeKind::Root { source_prefix: "" }, NodeFileType::Directory)
    }

    /// Re-tags an extracted subtree as a partition root of its own.  Its
    /// backing files keep living under the module's `system/` subtree.
    pub fn into_partition_root(mut self) -> Self {
        self.kind = NodeKind::Root {
            source_prefix: "system",
        };
        self
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn file_type(&self) -> NodeFileType {
        self.file_type
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn replace(&self) -> bool {
        self.replace
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&Node> {
        self.children.get(name.as_ref())
    }

    pub fn children(&self) -> impl Iterator<Item = (&OsStr, &Node)> {
        self.children
            .iter()
            .map(|(name, node)| (name.as_os_str(), node))
    }

    /// Inserts `node` as a direct child, replacing any previous child of
    /// the same name.
    pub fn insert(&mut self, name: impl Into<OsString>, node: Node) {
        self.children.insert(name.into(), node);
    }

    /// Removes and returns the direct child `name`, if present.
    pub fn extract(&mut self, name: impl AsRef<OsStr>) -> Option<Node> {
        self.children.remove(name.as_ref())
    }

    fn is_dir_variant(&self) -> bool {
        !matches!(self.kind, NodeKind::Module { .. })
    }

    /// Folds one module's contributed directory into this node.  `dir` is
    /// an open descriptor of the directory corresponding to this node
    /// inside the module.
    ///
    /// The union is last-writer-wins at leaves: a later module's file
    /// overwrites an earlier one's under the same name, while a later
    /// directory does not displace an earlier file.
    pub fn collect_module_files(&mut self, module: &OsStr, dir: impl AsFd) -> Result<()> {
        for item in Dir::read_from(&dir)? {
            let entry = item?;
            let name = OsStr::from_bytes(entry.file_name().to_bytes());
            if name == "." || name == ".." {
                continue;
            }
            if name == REPLACE_NAME {
                self.replace = true;
                continue;
            }

            let file_type = match entry.file_type() {
                // d_type is not filled in on every filesystem
                FileType::Unknown => {
                    match statat(&dir, entry.file_name(), AtFlags::SYMLINK_NOFOLLOW) {
                        Ok(st) => NodeFileType::from(FileType::from_raw_mode(st.st_mode)),
                        Err(_) => NodeFileType::Other,
                    }
                }
                file_type => NodeFileType::from(file_type),
            };

            if file_type == NodeFileType::Directory {
                let child = match self.children.entry(name.to_os_string()) {
                    Entry::Vacant(slot) => {
                        slot.insert(Node::new(NodeKind::Intermediate, file_type))
                    }
                    Entry::Occupied(slot) => {
                        let node = slot.into_mut();
                        if !matches!(node.kind, NodeKind::Intermediate) {
                            continue;
                        }
                        node
                    }
                };
                match openat(
                    &dir,
                    entry.file_name(),
                    OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                    Mode::empty(),
                ) {
                    Ok(fd) => child.collect_module_files(module, fd)?,
                    Err(err) => warn!("open module directory {name:?}: {err}"),
                }
            } else {
                self.children.insert(
                    name.to_os_string(),
                    Node::new(
                        NodeKind::Module {
                            module: module.to_os_string(),
                        },
                        file_type,
                    ),
                );
            }
        }
        Ok(())
    }

    /// The upgrade pass.  `self` is the unnamed tree root; its children are
    /// partition roots.
    pub fn prepare(&mut self, config: &Config) -> Result<(), TreeError> {
        self.prepare_dir(config, Path::new("")).map(|_| ())
    }

    /// Post-order traversal deciding which directories become tmpfs.
    /// Returns whether the *caller* must realize this directory as tmpfs.
    fn prepare_dir(&mut self, config: &Config, rpath: &Path) -> Result<bool, TreeError> {
        // Direct replace or a missing target means we cannot merge in place.
        let mut upgrade = self.replace || !self.exists;
        let replace = self.replace;
        let self_rank = self.kind.rank();

        let names: Vec<OsString> = self.children.keys().cloned().collect();
        for name in names {
            let child_rpath = rpath.join(&name);
            let child_path = config.node_path(&child_rpath);
            let Some(child) = self.children.get_mut(&name) else {
                continue;
            };

            // A child forces tmpfs when its target is missing, or when
            // either side of the bind would be a symlink.
            let cannot_mount = match lstat(&child_path) {
                Ok(st) => {
                    child.exists = true;
                    child.file_type == NodeFileType::Symlink
                        || FileType::from_raw_mode(st.st_mode) == FileType::Symlink
                }
                Err(_) => true,
            };

            if cannot_mount {
                if self_rank > TMPFS_RANK {
                    if config.strict {
                        return Err(TreeError::UnsupportedChild(child_path));
                    }
                    warn!("unable to add {}, skipped", child_path.display());
                    self.children.remove(&name);
                    continue;
                }
                upgrade = true;
            }

            if child.is_dir_variant() {
                if replace {
                    child.replace = true;
                }
                if child.prepare_dir(config, &child_rpath)? && child.kind.rank() < TMPFS_RANK {
                    child.upgrade_to_tmpfs(config, &child_rpath);
                }
            }
        }
        Ok(upgrade)
    }

    /// Turns this node into a tmpfs node.  Directories re-expose their
    /// existing base content through placeholder children (unless replaced)
    /// and cascade the upgrade: everything inside a synthetic tmpfs must be
    /// materialized there.
    fn upgrade_to_tmpfs(&mut self, config: &Config, rpath: &Path) {
        debug_assert!(self.kind.rank() <= TMPFS_RANK);
        self.kind = NodeKind::Tmpfs;
        if self.file_type != NodeFileType::Directory {
            return;
        }

        if !self.replace {
            if let Ok(entries) = std::fs::read_dir(config.node_path(rpath)) {
                self.exists = true;
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if self.children.contains_key(&name) {
                        continue;
                    }
                    let file_type = entry
                        .file_type()
                        .map(NodeFileType::from)
                        .unwrap_or(NodeFileType::Other);
                    self.children
                        .insert(name, Node::new(NodeKind::Intermediate, file_type));
                }
            }
        }

        for (name, child) in self.children.iter_mut() {
            if matches!(child.kind, NodeKind::Intermediate) {
                child.upgrade_to_tmpfs(config, &rpath.join(name));
            }
        }
    }

    /// Executes the planned mounts.  `self` is the unnamed tree root.
    pub fn mount(&self, config: &Config) {
        for (name, child) in &self.children {
            let prefix = match &child.kind {
                NodeKind::Root { source_prefix } => *source_prefix,
                _ => "",
            };
            let ctx = MountCtx { config, prefix };
            child.mount_node(&ctx, Path::new(name), false);
        }
    }

    fn mount_node(&self, ctx: &MountCtx, rpath: &Path, parent_is_tmpfs: bool) {
        match &self.kind {
            NodeKind::Root { .. } => {
                let path = ctx.config.node_path(rpath);
                if !self.exists {
                    mkdirs(&path);
                }
                self.mount_children(ctx, rpath, false);
            }
            NodeKind::Intermediate => {
                // Plain directory present on the base filesystem; nothing
                // to install at this level.
                self.mount_children(ctx, rpath, false);
            }
            NodeKind::Module { module } => {
                self.mount_module(ctx, rpath, module, parent_is_tmpfs)
            }
            NodeKind::Tmpfs => self.mount_tmpfs(ctx, rpath, parent_is_tmpfs),
        }
    }

    fn mount_children(&self, ctx: &MountCtx, rpath: &Path, self_is_tmpfs: bool) {
        for (name, child) in &self.children {
            child.mount_node(ctx, &rpath.join(name), self_is_tmpfs);
        }
    }

    fn mount_module(&self, ctx: &MountCtx, rpath: &Path, module: &OsStr, parent_is_tmpfs: bool) {
        let config = ctx.config;
        let mut rel = PathBuf::from(module);
        if !ctx.prefix.is_empty() {
            rel.push(ctx.prefix);
        }
        rel.push(rpath);
        let backing = config.module_root.join(&rel);
        let mnt_src = config.module_mnt.join(&rel);
        let path = config.node_path(rpath);

        if self.exists {
            // Labels travel with the bind source; give the backing file the
            // attributes of the path it shadows.
            attr::clone_attr(&path, &backing);
        }
        if parent_is_tmpfs {
            self.create_and_mount("module", &mnt_src, &config.worker_path(rpath), false);
        } else {
            log_mount("module", &mnt_src, &path, mount::bind_mount(&mnt_src, &path));
        }
    }

    fn mount_tmpfs(&self, ctx: &MountCtx, rpath: &Path, parent_is_tmpfs: bool) {
        let config = ctx.config;
        let path = config.node_path(rpath);
        let worker = config.worker_path(rpath);

        if self.file_type != NodeFileType::Directory {
            // A pre-existing non-directory re-exposed inside the enclosing
            // tmpfs.
            self.create_and_mount("mirror", &path, &worker, false);
            return;
        }

        let parent_rpath = rpath.parent().unwrap_or(Path::new(""));
        if parent_is_tmpfs {
            // The parent tmpfs already covers us; no extra mount layer.
            mkdir(&worker);
            let attr_src = if self.exists {
                path
            } else {
                config.worker_path(parent_rpath)
            };
            attr::clone_attr(&attr_src, &worker);
            self.mount_children(ctx, rpath, true);
        } else {
            let reason = if self.replace { "replace" } else { "move" };
            mkdirs(&worker);
            // Self-bind turns the staging directory into a mount point that
            // can later be moved into place.
            log_mount(reason, &worker, &worker, mount::bind_mount(&worker, &worker));
            let attr_src = if self.exists {
                path.clone()
            } else {
                config.node_path(parent_rpath)
            };
            attr::clone_attr(&attr_src, &worker);
            self.mount_children(ctx, rpath, true);
            // The populated subtree lands at the target in one move, so a
            // partially-built tmpfs is never observable there.
            log_mount(reason, &worker, &path, mount::move_mount(&worker, &path));
            if let Err(err) = mount::remount_ro(&path) {
                warn!("remount {} read-only: {err}", path.display());
            }
            if let Err(err) = mount::make_private(&path) {
                warn!("make {} private: {err}", path.display());
            }
        }
    }

    /// Recreates this node at `dest` (a placeholder inside a staging tmpfs)
    /// and binds `src` over it.  Symlinks cannot be bind-mounted and are
    /// copied instead; special files are skipped.
    fn create_and_mount(&self, reason: &str, src: &Path, dest: &Path, ro: bool) {
        match self.file_type {
            NodeFileType::Symlink => match attr::copy_path(src, dest) {
                Ok(()) => debug!("{reason:<8}: {} <- {}", dest.display(), src.display()),
                Err(err) => warn!("copy {} -> {}: {err}", src.display(), dest.display()),
            },
            NodeFileType::Directory | NodeFileType::RegularFile => {
                if self.file_type == NodeFileType::Directory {
                    mkdir(dest);
                } else {
                    touch(dest);
                }
                log_mount(reason, src, dest, mount::bind_mount(src, dest));
                if ro {
                    if let Err(err) = mount::remount_bind_ro(dest) {
                        warn!("remount {} read-only: {err}", dest.display());
                    }
                }
            }
            NodeFileType::Other => {}
        }
    }
}

fn log_mount(reason: &str, from: &Path, to: &Path, result: rustix::io::Result<()>) {
    match result {
        Ok(()) => debug!("{reason:<8}: {} <- {}", to.display(), from.display()),
        Err(err) => warn!(
            "{reason}: mount {} over {}: {err}",
            from.display(),
            to.display()
        ),
    }
}

fn mkdirs(path: &Path) {
    if let Err(err) = std::fs::create_dir_all(path) {
        warn!("mkdirs {}: {err}", path.display());
    }
}

fn mkdir(path: &Path) {
    if let Err(err) = std::fs::create_dir(path) {
        if err.kind() != ErrorKind::AlreadyExists {
            warn!("mkdir {}: {err}", path.display());
        }
    }
}

fn touch(path: &Path) {
    if let Err(err) = std::fs::File::create(path) {
        warn!("create {}: {err}", path.display());
    }
}
