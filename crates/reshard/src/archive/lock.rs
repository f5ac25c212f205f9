use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{ReshardError, Result};

/// Exclusive claim on an output path, held for the duration of a conversion.
///
/// The claim is an advisory lock on `.<name>.reshard.lock` beside the output. The OS
/// releases it when the holder exits, however it exits, so a lock file that is present
/// but unlocked is stale and gets reclaimed. The file is removed on drop.
#[derive(Debug)]
pub struct OutputGuard {
    lock_path: PathBuf,
    // Holds the lock until the guard is dropped.
    _file: File,
}

/// Directory an output path lives in.
pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether `file` is still the file linked at `path`.
///
/// A previous holder unlinks the lock file just before releasing it; a claim on the
/// unlinked file would guard nothing.
fn is_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    let linked = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok(held.dev() == linked.dev() && held.ino() == linked.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = (held, linked);
        Ok(true)
    }
}

impl OutputGuard {
    /// Claims `output`.
    ///
    /// Fails with [`ReshardError::ArchiveBusy`] when another live conversion holds the
    /// claim.
    pub fn acquire(output: &Path) -> Result<Self> {
        let name = output.file_name().ok_or_else(|| {
            ReshardError::InvalidConfig(format!(
                "output path `{}` has no file name",
                output.display()
            ))
        })?;
        let mut lock_name = std::ffi::OsString::from(".");
        lock_name.push(name);
        lock_name.push(".reshard.lock");
        let lock_path = parent_dir(output).join(lock_name);
        let io_err = |err| ReshardError::io(&lock_path, err);

        for _ in 0..3 {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(io_err)?;
            match file.try_lock() {
                Ok(()) => {}
                Err(TryLockError::WouldBlock) => {
                    return Err(ReshardError::ArchiveBusy {
                        path: output.to_path_buf(),
                    });
                }
                Err(TryLockError::Error(err)) => return Err(io_err(err)),
            }
            if !is_linked(&file, &lock_path).map_err(io_err)? {
                continue;
            }

            let mut previous = String::new();
            file.read_to_string(&mut previous).map_err(io_err)?;
            if !previous.trim().is_empty() {
                log::warn!(
                    "Reclaiming stale output lock {} left by process {}",
                    lock_path.display(),
                    previous.trim()
                );
            }
            // Owner pid, for whoever inspects the lock.
            file.set_len(0)
                .and_then(|_| file.seek(SeekFrom::Start(0)))
                .and_then(|_| writeln!(file, "{}", std::process::id()))
                .map_err(io_err)?;

            log::debug!("Acquired output lock {}", lock_path.display());
            return Ok(Self {
                lock_path,
                _file: file,
            });
        }

        Err(ReshardError::ArchiveBusy {
            path: output.to_path_buf(),
        })
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        // Unlinked while still locked, so no one can claim the old file in between.
        if let Err(err) = fs::remove_file(&self.lock_path) {
            log::warn!(
                "Could not remove output lock {}: {err}",
                self.lock_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");

        let guard = OutputGuard::acquire(&output).unwrap();
        assert!(guard.lock_path().ends_with(".out.reshard.lock"));

        let err = OutputGuard::acquire(&output).unwrap_err();
        assert!(matches!(err, ReshardError::ArchiveBusy { .. }));

        drop(guard);
        assert!(!dir.path().join(".out.reshard.lock").exists());
        OutputGuard::acquire(&output).unwrap();
    }

    #[test]
    fn test_abandoned_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        let lock_path = dir.path().join(".out.reshard.lock");
        fs::write(&lock_path, "4194303\n").unwrap();

        let guard = OutputGuard::acquire(&output).unwrap();

        assert_eq!(
            fs::read_to_string(&lock_path).unwrap(),
            format!("{}\n", std::process::id())
        );
        let err = OutputGuard::acquire(&output).unwrap_err();
        assert!(matches!(err, ReshardError::ArchiveBusy { .. }));
        drop(guard);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_parent_of_bare_name() {
        assert_eq!(parent_dir(Path::new("out")), PathBuf::from("."));
        assert_eq!(parent_dir(Path::new("a/out")), PathBuf::from("a"));
    }
}
