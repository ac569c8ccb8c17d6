//! File attribute primitives: acquire and re-apply the `(mode, uid, gid,
//! SELinux context)` tuple of a path, and attribute-preserving copies.
//!
//! Labels must survive overlay creation for policy enforcement, so every
//! synthesized inode gets its attributes cloned from the path it stands in
//! for.  Attribute failures are best-effort by design: the composer keeps
//! going with whatever could be applied.

use std::fs::File;
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::os::unix::fs::symlink;
use std::path::Path;

use log::warn;
use rustix::fs::{
    chmod, chown, lgetxattr, lsetxattr, lstat, FileType, Gid, Mode, Uid, XattrFlags,
};

/// The extended attribute carrying the SELinux label.
pub const SELINUX_XATTR: &str = "security.selinux";

/// Ownership, permission bits, and SELinux label of one path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttr {
    /// Permission bits only (`mode & 0o777`).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Raw `security.selinux` value, or `None` where the filesystem carries
    /// no label.
    pub context: Option<Box<[u8]>>,
}

/// Reads the attribute tuple of `path` without following symlinks.
pub fn get_attr(path: &Path) -> io::Result<FileAttr> {
    let st = lstat(path)?;
    let mut buffer = [MaybeUninit::new(0); 256];
    let context = match lgetxattr(path, SELINUX_XATTR, &mut buffer) {
        Ok((value, _)) => Some(Box::from(&*value)),
        Err(_) => None,
    };
    Ok(FileAttr {
        mode: st.st_mode & 0o777,
        uid: st.st_uid,
        gid: st.st_gid,
        context,
    })
}

/// Applies an attribute tuple to `path`.
pub fn set_attr(path: &Path, attr: &FileAttr) -> io::Result<()> {
    chmod(path, Mode::from_raw_mode(attr.mode))?;
    chown(
        path,
        Some(Uid::from_raw(attr.uid)),
        Some(Gid::from_raw(attr.gid)),
    )?;
    if let Some(context) = &attr.context {
        lsetxattr(path, SELINUX_XATTR, context, XattrFlags::empty())?;
    }
    Ok(())
}

/// Copies the attribute tuple from `src` to `dst`.  Failures are logged and
/// swallowed; the caller proceeds with whatever was applied.
pub fn clone_attr(src: &Path, dst: &Path) {
    let result = get_attr(src).and_then(|attr| set_attr(dst, &attr));
    if let Err(err) = result {
        warn!(
            "clone attributes {} -> {}: {err}",
            src.display(),
            dst.display()
        );
    }
}

/// Recreates the symlink at `src` as `dst`, carrying over its SELinux
/// label.  Mode and ownership are not copied: symlink permission bits are
/// ignored by the kernel.
pub fn clone_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = std::fs::read_link(src)?;
    symlink(&target, dst)?;
    let mut buffer = [MaybeUninit::new(0); 256];
    if let Ok((context, _)) = lgetxattr(src, SELINUX_XATTR, &mut buffer) {
        lsetxattr(dst, SELINUX_XATTR, context, XattrFlags::empty())?;
    }
    Ok(())
}

/// Attribute-preserving copy, dispatching on the file type of `src`:
/// directories are cloned recursively, regular files are copied by content,
/// symlinks are re-linked.  Anything else is skipped.
pub fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
    let st = lstat(src)?;
    match FileType::from_raw_mode(st.st_mode) {
        FileType::Directory => {
            match std::fs::create_dir(dst) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
            for entry in std::fs::read_dir(src)? {
                let entry = entry?;
                copy_path(&entry.path(), &dst.join(entry.file_name()))?;
            }
        }
        FileType::RegularFile => {
            remove_existing(dst)?;
            io::copy(&mut File::open(src)?, &mut File::create(dst)?)?;
        }
        FileType::Symlink => {
            remove_existing(dst)?;
            return clone_symlink(src, dst);
        }
        _ => return Ok(()),
    }
    set_attr(dst, &get_attr(src)?)
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn test_attr_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"y").unwrap();
        std::fs::set_permissions(&a, std::fs::Permissions::from_mode(0o640)).unwrap();

        let attr = get_attr(&a).unwrap();
        assert_eq!(attr.mode, 0o640);
        set_attr(&b, &attr).unwrap();
        assert_eq!(get_attr(&b).unwrap().mode, 0o640);
    }

    #[test]
    fn test_clone_attr_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        // Neither path exists; this must not panic or error out.
        clone_attr(&dir.path().join("missing"), &dir.path().join("also-missing"));
    }

    #[test]
    fn test_copy_path_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"contents").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o604)).unwrap();

        copy_path(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"contents");
        assert_eq!(get_attr(&dst).unwrap().mode, 0o604);
    }

    #[test]
    fn test_copy_path_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        copy_path(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn test_copy_path_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("sub/file"), b"data").unwrap();
        symlink("sub/file", src.join("link")).unwrap();

        let dst = dir.path().join("dst");
        copy_path(&src, &dst).unwrap();

        assert_eq!(std::fs::read(dst.join("sub/file")).unwrap(), b"data");
        assert_eq!(
            std::fs::read_link(dst.join("link")).unwrap(),
            Path::new("sub/file")
        );
    }

    #[test]
    fn test_clone_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        symlink("../target", &src).unwrap();

        clone_symlink(&src, &dst).unwrap();
        assert_eq!(std::fs::read_link(&dst).unwrap(), Path::new("../target"));
    }
}
