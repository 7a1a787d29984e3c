use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Replace `path` with `content` durably: exclusive lock file, temp file
/// written with 0600, fsync, atomic rename, fsync of the parent directory.
///
/// Readers never observe a partially written file.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);

    #[cfg(target_family = "unix")]
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&dir)?;
    #[cfg(not(target_family = "unix"))]
    fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            )
        })?
        .to_string_lossy()
        .to_string();

    let lock = File::create(dir.join(format!("{}.lock", file_name)))?;
    lock.lock_exclusive()?;

    let temp_path = dir.join(format!("{}.tmp", file_name));
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);
    let mut temp = options.open(&temp_path)?;

    temp.write_all(content)?;
    temp.sync_all()?;
    drop(temp);

    fs::rename(&temp_path, path)?;

    #[cfg(target_family = "unix")]
    {
        let dir_handle = File::open(&dir)?;
        dir_handle.sync_all()?;
    }

    drop(lock);
    Ok(())
}

/// Pretty-printed JSON flavour of [`write_atomic`].
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut body = serde_json::to_vec_pretty(value).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialise {}: {}", path.display(), err),
        )
    })?;
    body.push(b'\n');
    write_atomic(path, &body)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
