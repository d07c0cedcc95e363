use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Free space in bytes available to unprivileged users on the filesystem
/// holding `path`. Returns 0 when the query fails, which callers treat the
/// same as a full disk.
pub fn free_disk_space(path: &Path) -> u64 {
    let raw = match CString::new(path.as_os_str().as_bytes()) {
        Ok(raw) => raw,
        Err(_) => return 0,
    };

    let mut stats: libc::statvfs = unsafe { mem::zeroed() };

    match unsafe { libc::statvfs(raw.as_ptr(), &mut stats) } {
        0 => stats.f_bsize as u64 * stats.f_bavail as u64,
        _ => 0,
    }
}

/// Directory containing the running executable.
pub fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(Path::to_path_buf))
}

#[inline]
pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

#[inline]
pub fn file_size(path: &Path) -> io::Result<u64> {
    fs::metadata(path).map(|meta| meta.len())
}

/// Best-effort removal. Returns true when the file is gone.
pub fn remove_file(path: &Path) -> bool {
    fs::remove_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn test_free_disk_space_reports_something() {
        let dir = tempfile::tempdir().unwrap();

        assert!(free_disk_space(dir.path()) > 0);
    }

    #[test]
    fn test_free_disk_space_missing_path() {
        assert_eq!(free_disk_space(Path::new("/definitely/not/a/path")), 0);
    }

    #[test]
    fn test_exe_dir_exists() {
        let dir = exe_dir().unwrap();

        assert!(dir.is_dir());
    }

    #[test]
    fn test_file_queries_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.bin");

        assert!(!file_exists(&path));
        assert!(!remove_file(&path));

        let mut file = File::create(&path).unwrap();
        file.write_all(&[0u8; 128]).unwrap();
        drop(file);

        assert!(file_exists(&path));
        assert_eq!(file_size(&path).unwrap(), 128);
        assert!(remove_file(&path));
        assert!(!file_exists(&path));
    }
}
