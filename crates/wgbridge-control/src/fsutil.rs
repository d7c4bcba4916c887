//! Stage-then-rename file helpers
//!
//! Every persistent write goes to an owner-only temporary file in the
//! target's directory, is flushed to disk, and only then renamed over the
//! target.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn owner_only(options: &mut OpenOptions) -> &mut OpenOptions {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

/// Write `data` to a fresh owner-only temporary file inside `dir` and
/// flush it. The caller renames or removes the returned path.
pub fn stage_file(dir: &Path, label: &str, data: &[u8]) -> io::Result<PathBuf> {
    let seq = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(".{}.{}.{}.tmp", label, std::process::id(), seq));

    let result = (|| -> io::Result<()> {
        let mut file = owner_only(OpenOptions::new().write(true).create_new(true)).open(&path)?;
        file.write_all(data)?;
        file.sync_all()
    })();

    match result {
        Ok(()) => Ok(path),
        Err(e) => {
            let _ = fs::remove_file(&path);
            Err(e)
        }
    }
}

/// Replace `path` with `data` atomically (owner-only permissions)
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let staged = stage_file(dir, &label, data)?;
    if let Err(e) = fs::rename(&staged, path) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    sync_dir(dir);
    Ok(())
}

/// Create a fresh owner-only directory inside `dir` to build a tree in.
/// The caller passes it to [`replace_dir`] or removes it.
pub fn stage_dir(dir: &Path, label: &str) -> io::Result<PathBuf> {
    let seq = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(".{}.{}.{}.staging", label, std::process::id(), seq));
    fs::create_dir(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(path)
}

/// Swap the directory `staged` into place at `target`. Readers see either
/// the old tree or the new one, never a mix. `staged` and `target` must
/// share a parent.
pub fn replace_dir(staged: &Path, target: &Path) -> io::Result<()> {
    let parent = parent_dir(target);
    let retired = match fs::symlink_metadata(target) {
        Ok(_) => {
            let seq = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
            let label = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dir".to_string());
            let retired = parent.join(format!(".{}.{}.{}.old", label, std::process::id(), seq));
            fs::rename(target, &retired)?;
            Some(retired)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    if let Err(e) = fs::rename(staged, target) {
        if let Some(retired) = &retired {
            let _ = fs::rename(retired, target);
        }
        return Err(e);
    }
    sync_dir(parent);

    if let Some(retired) = retired {
        if let Err(e) = fs::remove_dir_all(&retired) {
            tracing::warn!("Old tree {} not removed: {}", retired.display(), e);
        }
    }
    Ok(())
}

/// Flush directory entries so completed renames survive a crash
pub fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Create `dir` (and parents) and restrict it to the owner
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Remove a file, treating absence as success. Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Directory containing `path` (`.` for bare file names)
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wg0.conf");

        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");

        // no staging leftovers
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_staged_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let staged = stage_file(dir.path(), "x", b"secret").unwrap();
        let mode = fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let sub = dir.path().join("keys");
        ensure_private_dir(&sub).unwrap();
        let mode = fs::metadata(&sub).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_replace_dir_swaps_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wg0");
        fs::create_dir_all(target.join("meta")).unwrap();
        fs::write(target.join("meta/old.txt"), b"old").unwrap();
        fs::write(target.join("config.conf"), b"one").unwrap();

        let staged = stage_dir(dir.path(), "wg0").unwrap();
        fs::write(staged.join("config.conf"), b"two").unwrap();
        replace_dir(&staged, &target).unwrap();

        assert_eq!(fs::read(target.join("config.conf")).unwrap(), b"two");
        assert!(!target.join("meta").exists());
        // only the target remains in the parent
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        // first install: no previous tree
        let fresh = dir.path().join("wg1");
        let staged = stage_dir(dir.path(), "wg1").unwrap();
        replace_dir(&staged, &fresh).unwrap();
        assert!(fresh.is_dir());
    }
}
