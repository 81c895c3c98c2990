//! Parsing of `/proc/self/mountinfo`, used to tell whether the workspace is
//! backed by an external mount or by the container's own writable layer.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

#[derive(Debug, Error)]
pub enum MountInfoError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed mountinfo line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Path of the mounted directory inside the source filesystem.
    pub root: String,
    pub mount_point: PathBuf,
    pub options: Vec<String>,
    pub fs_type: String,
    pub source: String,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Parse mountinfo text (see proc(5)).
pub fn parse_mountinfo(text: &str) -> Result<Vec<MountEntry>, MountInfoError> {
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |reason| MountInfoError::Malformed {
            line: idx + 1,
            reason,
        };

        let (pre, post) = line
            .split_once(" - ")
            .ok_or_else(|| malformed("missing ' - ' separator"))?;
        let pre: Vec<&str> = pre.split(' ').collect();
        let post: Vec<&str> = post.split(' ').collect();
        if pre.len() < 6 {
            return Err(malformed("too few fields before separator"));
        }
        if post.len() < 2 {
            return Err(malformed("too few fields after separator"));
        }

        entries.push(MountEntry {
            root: unescape(pre[3]),
            mount_point: PathBuf::from(unescape(pre[4])),
            options: pre[5].split(',').map(str::to_string).collect(),
            fs_type: post[0].to_string(),
            source: unescape(post[1]),
        });
    }
    Ok(entries)
}

pub fn read_self() -> Result<Vec<MountEntry>, MountInfoError> {
    let text = fs::read_to_string(SELF_MOUNTINFO).map_err(|source| MountInfoError::Read {
        path: PathBuf::from(SELF_MOUNTINFO),
        source,
    })?;
    parse_mountinfo(&text)
}

/// The mount whose mount point is exactly `path`. Later entries shadow
/// earlier ones mounted on the same point.
pub fn mount_at<'a>(entries: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    entries.iter().rev().find(|e| e.mount_point == path)
}

/// Octal escapes (`\040` for space etc.) used by the kernel for paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(b) = u8::try_from(value) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_MOUNTINFO: &str = "\
1071 960 0:63 / / rw,relatime master:492 - overlay overlay rw,lowerdir=/var/lib/docker/overlay2/l/A,upperdir=/var/lib/docker/overlay2/x/diff
1072 1071 0:66 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw
1080 1071 259:2 /home/alice/lethe-workspace /workspace rw,relatime - ext4 /dev/nvme0n1p2 rw
1081 1071 259:2 /var/lib/docker/containers/abc/resolv.conf /etc/resolv.conf rw,relatime - ext4 /dev/nvme0n1p2 rw
1082 1071 259:2 /home/alice/my\\040notes /mnt/my\\040notes ro,relatime - ext4 /dev/nvme0n1p2 rw
";

    #[test]
    fn test_parse_docker_mountinfo() {
        let entries = parse_mountinfo(DOCKER_MOUNTINFO).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[0].fs_type, "overlay");

        let ws = mount_at(&entries, Path::new("/workspace")).unwrap();
        assert_eq!(ws.root, "/home/alice/lethe-workspace");
        assert_eq!(ws.fs_type, "ext4");
        assert!(!ws.is_read_only());
    }

    #[test]
    fn test_unescapes_spaces() {
        let entries = parse_mountinfo(DOCKER_MOUNTINFO).unwrap();
        let notes = mount_at(&entries, Path::new("/mnt/my notes")).unwrap();
        assert_eq!(notes.root, "/home/alice/my notes");
        assert!(notes.is_read_only());
    }

    #[test]
    fn test_missing_mount_point() {
        let entries = parse_mountinfo(DOCKER_MOUNTINFO).unwrap();
        assert!(mount_at(&entries, Path::new("/app")).is_none());
        // A subdirectory of a mount is not itself a mount point.
        assert!(mount_at(&entries, Path::new("/workspace/data")).is_none());
    }

    #[test]
    fn test_later_mount_shadows_earlier() {
        let text = "\
10 1 0:1 / /workspace rw - tmpfs tmpfs rw
11 1 8:1 /srv/ws /workspace rw - ext4 /dev/sda1 rw
";
        let entries = parse_mountinfo(text).unwrap();
        assert_eq!(
            mount_at(&entries, Path::new("/workspace")).unwrap().fs_type,
            "ext4"
        );
    }

    #[test]
    fn test_malformed_line() {
        let err = parse_mountinfo("10 1 0:1 / /workspace rw tmpfs tmpfs rw\n").unwrap_err();
        assert!(matches!(err, MountInfoError::Malformed { line: 1, .. }));
    }
}
