//! Request path handling: normalisation under the TFTP root and
//! symlink-marker resolution.
//!
//! A symlink marker is a small text file standing in for a symbolic link
//! (boot trees unpacked on filesystems without symlink support). Its whole
//! content is a path relative to the directory containing the marker.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{Result, TftpError};

/// Markers followed before a request is refused
pub const MAX_HOPS: usize = 8;

/// Markers are strictly smaller than this
const MARKER_MAX_LEN: u64 = 200;

/// Split a client path into components, resolving `.` and `..` without
/// ever leaving the root. Backslashes count as separators.
pub fn canonicalize(request: &str) -> Vec<String> {
    let mut components: Vec<String> = Vec::new();
    for part in request.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other.to_string()),
        }
    }
    components
}

/// Join components into the relative form used in logs and events
pub fn join_components(components: &[String]) -> String {
    components.join("/")
}

fn join(root: &Path, components: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(components);
    path
}

fn is_marker_text(content: &[u8]) -> bool {
    !content.is_empty() && content.iter().all(|b| (32..=127).contains(b))
}

async fn is_file(path: &Path) -> bool {
    matches!(fs::metadata(path).await, Ok(m) if m.is_file())
}

/// Follow one marker. Walks the path from the root and stops at the first
/// component that is a regular file; if that file is a marker whose target
/// (plus the rest of the requested path) is an existing file, returns the
/// new components.
async fn follow_marker(root: &Path, components: &[String]) -> Result<Option<Vec<String>>> {
    for i in 1..=components.len() {
        let candidate = join(root, &components[..i]);
        let meta = match fs::metadata(&candidate).await {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };
        if meta.is_dir() {
            continue;
        }
        if !meta.is_file() || meta.len() == 0 || meta.len() >= MARKER_MAX_LEN {
            return Ok(None);
        }

        let content = fs::read(&candidate).await?;
        if !is_marker_text(&content) {
            return Ok(None);
        }

        let parent = join_components(&components[..i - 1]);
        let link = String::from_utf8_lossy(&content);
        let mut target = canonicalize(&format!("{}/{}", parent, link));
        target.extend_from_slice(&components[i..]);

        if target.is_empty() || !is_file(&join(root, &target)).await {
            return Ok(None);
        }
        return Ok(Some(target));
    }
    Ok(None)
}

/// Resolve a client request to a path under `root`.
///
/// With `follow_markers`, marker files are substituted until the path no
/// longer names one; more than [`MAX_HOPS`] substitutions fail the request.
pub async fn resolve(root: &Path, request: &str, follow_markers: bool) -> Result<(String, PathBuf)> {
    let mut components = canonicalize(request);
    if components.is_empty() {
        return Err(TftpError::FileNotFound(request.to_string()));
    }

    if follow_markers {
        let mut hops = 0;
        while let Some(target) = follow_marker(root, &components).await? {
            if hops == MAX_HOPS {
                return Err(TftpError::TooManyHops(request.to_string()));
            }
            let (from, to) = (join_components(&components), join_components(&target));
            debug!("Followed symlink marker from \"{}\" to \"{}\"", from, to);
            components = target;
            hops += 1;
        }
    }

    let path = join(root, &components);
    Ok((join_components(&components), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("/boot/pxelinux.0"), vec!["boot", "pxelinux.0"]);
        assert_eq!(canonicalize("boot\\efi\\.\\grub.efi"), vec!["boot", "efi", "grub.efi"]);
        assert_eq!(canonicalize("a/b/../c"), vec!["a", "c"]);
        assert_eq!(canonicalize("../../etc/passwd"), vec!["etc", "passwd"]);
        assert!(canonicalize("/./..").is_empty());
    }

    #[test]
    fn test_join_components() {
        assert_eq!(join_components(&canonicalize("\\boot\\efi\\grub.efi")), "boot/efi/grub.efi");
        assert_eq!(join_components(&[]), "");
    }

    #[tokio::test]
    async fn test_resolve_plain_file() {
        let root = tempfile::tempdir().unwrap();
        stdfs::write(root.path().join("pxelinux.0"), b"\x00binary").unwrap();

        let (name, path) = resolve(root.path(), "/pxelinux.0", true).await.unwrap();
        assert_eq!(name, "pxelinux.0");
        assert_eq!(path, root.path().join("pxelinux.0"));
    }

    #[tokio::test]
    async fn test_marker_relative_to_its_directory() {
        let root = tempfile::tempdir().unwrap();
        stdfs::create_dir_all(root.path().join("images/v2")).unwrap();
        stdfs::write(root.path().join("images/v2/linux"), vec![0u8; 300]).unwrap();
        stdfs::write(root.path().join("images/current"), b"v2").unwrap();

        let (name, _) = resolve(root.path(), "images/current/linux", true).await.unwrap();
        assert_eq!(name, "images/v2/linux");

        // Feature off: path taken literally
        let (name, _) = resolve(root.path(), "images/current/linux", false).await.unwrap();
        assert_eq!(name, "images/current/linux");
    }

    #[tokio::test]
    async fn test_non_marker_files_are_not_followed() {
        let root = tempfile::tempdir().unwrap();
        stdfs::write(root.path().join("target"), vec![0u8; 10]).unwrap();
        // Newline is outside the printable range
        stdfs::write(root.path().join("with-newline"), b"target\n").unwrap();
        // Points nowhere
        stdfs::write(root.path().join("dangling"), b"missing").unwrap();

        let (name, _) = resolve(root.path(), "with-newline", true).await.unwrap();
        assert_eq!(name, "with-newline");
        let (name, _) = resolve(root.path(), "dangling", true).await.unwrap();
        assert_eq!(name, "dangling");
    }

    #[tokio::test]
    async fn test_marker_chain_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        stdfs::write(root.path().join("loop"), b"loop").unwrap();

        let err = resolve(root.path(), "loop", true).await.unwrap_err();
        assert!(matches!(err, TftpError::TooManyHops(_)));
    }

    #[tokio::test]
    async fn test_chain_within_hop_limit() {
        let root = tempfile::tempdir().unwrap();
        stdfs::write(root.path().join("real"), vec![0u8; 1]).unwrap();
        let mut previous = "real".to_string();
        for n in 0..MAX_HOPS {
            let name = format!("link{}", n);
            stdfs::write(root.path().join(&name), previous.as_bytes()).unwrap();
            previous = name;
        }

        let (name, _) = resolve(root.path(), &previous, true).await.unwrap();
        assert_eq!(name, "real");
    }
}
