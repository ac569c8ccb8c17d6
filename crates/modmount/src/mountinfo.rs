//! Reader for `/proc/<pid>/mountinfo`.
//!
//! Teardown needs to enumerate the live mounts of a process to find the
//! targets the composer installed.  Each line has the shape
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)  (4)   (5)   (6)        (7)      (8)(9) (10)      (11)
//! ```
//!
//! where (7) is a variable-length list of optional fields terminated by a
//! lone `-`.  The kernel escapes whitespace in path-valued fields as octal
//! (`\040`); those fields are decoded here so that matching and unmounting
//! work on paths containing spaces.

use std::path::Path;

use rustix::fs::makedev;
use thiserror::Error;

/// One record of a process's mount table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountInfo {
    /// Unique mount ID.
    pub id: u32,
    /// Mount ID of the parent mount.
    pub parent: u32,
    /// Device number of the backing filesystem.
    pub device: u64,
    /// Root of the mount within its filesystem.
    pub root: String,
    /// Mountpoint relative to the process's root.
    pub target: String,
    /// Per-mountpoint options.
    pub vfs_options: String,
    /// Propagation peer groups from the optional-fields list.
    pub peers: PeerGroups,
    /// Filesystem type.
    pub fs_type: String,
    /// Filesystem-specific source (device, tmpfs tag, ...).
    pub source: String,
    /// Per-superblock options.
    pub fs_options: String,
}

/// `shared:N` / `master:N` / `propagate_from:N` optional fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerGroups {
    pub shared: Option<u32>,
    pub master: Option<u32>,
    pub propagate_from: Option<u32>,
}

#[derive(Error, Debug)]
pub enum MountInfoError {
    #[error("truncated mountinfo line {0:?}")]
    Truncated(String),
    #[error("invalid {field} field {value:?} in mountinfo line")]
    Invalid {
        field: &'static str,
        value: String,
    },
}

fn parse_u32(field: &'static str, value: &str) -> Result<u32, MountInfoError> {
    value.parse().map_err(|_| MountInfoError::Invalid {
        field,
        value: value.to_string(),
    })
}

/// Decodes the kernel's octal escapes (`\040` for space, `\011` for tab,
/// `\012` for newline, `\134` for backslash).
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: Vec<char> = chars.clone().take(3).collect();
        if digits.len() == 3 && digits.iter().all(|d| ('0'..='7').contains(d)) {
            let value = digits.iter().fold(0u32, |acc, d| acc * 8 + (*d as u32 - '0' as u32));
            if let Some(decoded) = char::from_u32(value) {
                out.push(decoded);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn parse_line(line: &str) -> Result<MountInfo, MountInfoError> {
    let truncated = || MountInfoError::Truncated(line.to_string());
    let mut fields = line.split_whitespace();

    let id = parse_u32("id", fields.next().ok_or_else(truncated)?)?;
    let parent = parse_u32("parent", fields.next().ok_or_else(truncated)?)?;
    let device = {
        let field = fields.next().ok_or_else(truncated)?;
        let (maj, min) = field.split_once(':').ok_or(MountInfoError::Invalid {
            field: "device",
            value: field.to_string(),
        })?;
        makedev(parse_u32("device", maj)?, parse_u32("device", min)?)
    };
    let root = unescape(fields.next().ok_or_else(truncated)?);
    let target = unescape(fields.next().ok_or_else(truncated)?);
    let vfs_options = fields.next().ok_or_else(truncated)?.to_string();

    let mut peers = PeerGroups::default();
    loop {
        let field = fields.next().ok_or_else(truncated)?;
        if field == "-" {
            break;
        }
        if let Some(value) = field.strip_prefix("shared:") {
            peers.shared = Some(parse_u32("shared", value)?);
        } else if let Some(value) = field.strip_prefix("master:") {
            peers.master = Some(parse_u32("master", value)?);
        } else if let Some(value) = field.strip_prefix("propagate_from:") {
            peers.propagate_from = Some(parse_u32("propagate_from", value)?);
        }
        // Unknown optional fields are allowed and ignored.
    }

    let fs_type = fields.next().ok_or_else(truncated)?.to_string();
    let source = unescape(fields.next().ok_or_else(truncated)?);
    let fs_options = fields.next().ok_or_else(truncated)?.to_string();

    Ok(MountInfo {
        id,
        parent,
        device,
        root,
        target,
        vfs_options,
        peers,
        fs_type,
        source,
        fs_options,
    })
}

/// Parses the full text of a mountinfo file.
pub fn parse(text: &str) -> Result<Vec<MountInfo>, MountInfoError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

/// Reads and parses the mount table of the calling process.
pub fn read_self() -> anyhow::Result<Vec<MountInfo>> {
    read_path(Path::new("/proc/self/mountinfo"))
}

/// Reads and parses a mountinfo file at an arbitrary path, e.g.
/// `/proc/<pid>/mountinfo`.
pub fn read_path(path: &Path) -> anyhow::Result<Vec<MountInfo>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse(&text)?)
}
