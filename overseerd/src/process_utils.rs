//! Process and path primitives shared by the supervisor and recovery.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Minimal view of `/proc/[pid]/stat`.
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub starttime: u64,
}

/// Parse `/proc/[pid]/stat` and extract the `starttime` field (index 21).
/// Comparing start ticks guards against pid reuse after a restart.
#[cfg(target_family = "unix")]
pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let path = format!("/proc/{pid}/stat");
    let content = fs::read_to_string(&path)?;
    // The command field may contain spaces; it is parenthesised, so split
    // after the closing paren.
    let after = content
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .unwrap_or(&content);
    let starttime = after
        .split_whitespace()
        .nth(19)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("missing starttime field in {path}"),
            )
        })?
        .parse::<u64>()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to parse starttime in {path}: {err}"),
            )
        })?;

    Ok(ProcStat { starttime })
}

#[cfg(not(target_family = "unix"))]
pub fn read_proc_stat(_pid: u32) -> io::Result<ProcStat> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process introspection requires /proc",
    ))
}

/// Check for existence of a process in `/proc`.
#[cfg(target_family = "unix")]
pub fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_family = "unix"))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// Canonicalise `candidate` relative to `root`, rejecting traversal and
/// symlinked components that would leave the root.
pub fn canonicalize_within_root(root: &Path, candidate: &Path) -> io::Result<PathBuf> {
    let root = normalize_path(root)?;
    let combined = if candidate.is_absolute() {
        normalize_path(candidate)?
    } else {
        normalize_path(&root.join(candidate))?
    };

    if !combined.starts_with(&root) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "path {} escapes managed root {}",
                combined.display(),
                root.display()
            ),
        ));
    }

    enforce_no_symlinks(&root, &combined)?;
    Ok(combined)
}

/// Lexically resolve `.` and `..` without touching the filesystem. A `..`
/// at the front of a relative path simply drops off, which is fine here:
/// the caller compares the result against the managed root afterwards.
fn normalize_path(path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    for part in path.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            // RootDir and Prefix push as-is; pushing an absolute component
            // restarts the buffer, matching how the OS would resolve it.
            other => resolved.push(other.as_os_str()),
        }
    }
    if resolved.as_os_str().is_empty() {
        resolved.push(".");
    }
    Ok(resolved)
}

fn enforce_no_symlinks(root: &Path, target: &Path) -> io::Result<()> {
    let mut current = PathBuf::new();

    for component in target.components() {
        match component {
            Component::RootDir => {
                current = PathBuf::from(Component::RootDir.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                current.pop();
            }
            Component::Normal(part) => {
                current.push(part);
            }
            Component::Prefix(prefix) => {
                current.push(prefix.as_os_str());
            }
        }

        if matches!(component, Component::Prefix(_) | Component::RootDir) {
            continue;
        }
        // Components above the root (the root's own ancestors) are outside
        // our responsibility.
        if !current.starts_with(root) {
            continue;
        }

        match fs::symlink_metadata(&current) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("symlink detected in path: {}", current.display()),
                    ));
                }
            }
            // Not-yet-created suffix of the path; the prefix checks suffice.
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn traversal_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        assert!(canonicalize_within_root(&root, Path::new("ws/app")).is_ok());
        assert!(canonicalize_within_root(&root, Path::new("../outside")).is_err());
        assert!(canonicalize_within_root(&root, Path::new("ws/../../etc")).is_err());
        assert!(canonicalize_within_root(&root, Path::new("/etc/passwd")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_component_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        assert!(canonicalize_within_root(&root, Path::new("link/escape")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_visible() {
        let pid = std::process::id();
        assert!(process_exists(pid));
        assert!(read_proc_stat(pid).unwrap().starttime > 0);
    }
}
