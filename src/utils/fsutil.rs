/// Filesystem plumbing for sandbox cloning
///
/// Sandboxes are built by recursive copy: regular files byte-for-byte,
/// directories recursively, symbolic links as links. Permissions always
/// follow; modification times follow best-effort.
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

/// Recursively copy the *contents* of `src` into `dst`.
///
/// `dst` is created if absent. Existing entries in `dst` are overwritten
/// by same-named entries from `src`.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        copy_entry(&entry.path(), &dst.join(entry.file_name()))?;
    }
    // Directory times last so child writes don't clobber them.
    preserve_times(src, dst);
    Ok(())
}

/// Copy a single filesystem entry (file, directory, or symlink) to `dst`.
pub fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        if fs::symlink_metadata(dst).is_ok() {
            fs::remove_file(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst)?;
        preserve_link_times(src, dst);
    } else if file_type.is_dir() {
        copy_tree(src, dst)?;
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        fs::copy(src, dst)?;
        fs::set_permissions(dst, meta.permissions())?;
        preserve_times(src, dst);
    }
    Ok(())
}

fn system_time_to_timeval(t: std::time::SystemTime) -> Option<nix::sys::time::TimeVal> {
    let d = t.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(nix::sys::time::TimeVal::new(
        d.as_secs() as libc::time_t,
        d.subsec_micros() as libc::suseconds_t,
    ))
}

/// Best-effort mtime/atime preservation; failures are ignored.
fn preserve_times(src: &Path, dst: &Path) {
    let Ok(meta) = fs::metadata(src) else {
        return;
    };
    let (Ok(modified), Ok(accessed)) = (meta.modified(), meta.accessed()) else {
        return;
    };
    if let (Some(mtime), Some(atime)) = (
        system_time_to_timeval(modified),
        system_time_to_timeval(accessed),
    ) {
        let _ = nix::sys::stat::utimes(dst, &atime, &mtime);
    }
}

/// Same for symlinks themselves (not their targets).
fn preserve_link_times(src: &Path, dst: &Path) {
    let Ok(meta) = fs::symlink_metadata(src) else {
        return;
    };
    let (Ok(modified), Ok(accessed)) = (meta.modified(), meta.accessed()) else {
        return;
    };
    if let (Some(mtime), Some(atime)) = (
        system_time_to_timeval(modified),
        system_time_to_timeval(accessed),
    ) {
        let _ = nix::sys::stat::lutimes(dst, &atime, &mtime);
    }
}

/// SHA-256 hex digest of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_copy_tree_recurses() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        fs::create_dir(src.path().join("inner")).unwrap();
        fs::write(src.path().join("inner/a.txt"), b"alpha").unwrap();
        fs::write(src.path().join("b.txt"), b"beta").unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("inner/a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dst.path().join("b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn test_symlinks_copied_as_links() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        fs::write(src.path().join("target.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("target.txt", src.path().join("link")).unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        let link = dst.path().join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap().to_str().unwrap(), "target.txt");
    }

    #[test]
    fn test_permissions_preserved() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        let script = src.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        let mode = fs::metadata(dst.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_sha256_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
