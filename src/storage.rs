//! Durable file storage for key records and encrypted file output.

use crate::crypto::secure_random;
use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A directory holding the key store's files.
///
/// Every write goes through a uniquely named temporary sibling that is
/// fsynced and then renamed over the target, so a crash leaves either the
/// old or the new content and never a torn record. On Unix the directory is
/// created `0700` and files `0600`.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Creates a new Storage rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns `true` if the storage directory exists.
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.root.join(name).is_file()
    }

    /// Reads a whole entry into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be read.
    pub fn load(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.root.join(name))?)
    }

    /// Atomically writes an entry, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn save(&self, name: &str, data: &[u8]) -> Result<()> {
        create_private_dir(&self.root)?;

        let mut pending = PendingFile::create(&self.root.join(name))?;
        pending.write_all(data)?;
        pending.commit()
    }

    /// Deletes an entry. Missing entries are not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Names of the entries ending in `.{extension}`, sorted.
    pub fn entries(&self, extension: &str) -> Result<Vec<String>> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// An output file that only appears at its final path on [`commit`](Self::commit).
///
/// Content is written to `<name>.tmp.<random>` beside the target. Dropping
/// without committing removes the temporary file and leaves whatever was at
/// the target untouched.
pub(crate) struct PendingFile {
    file: Option<File>,
    tmp_path: PathBuf,
    target: PathBuf,
}

impl PendingFile {
    pub(crate) fn create(target: &Path) -> Result<Self> {
        let tmp_path = random_tmp_path(target)?;

        let mut options = OpenOptions::new();
        // securely create temp file (fail if exists)
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&tmp_path)?;

        Ok(Self {
            file: Some(file),
            tmp_path,
            target: target.to_path_buf(),
        })
    }

    /// Flush, fsync and rename over the target, then fsync the directory.
    pub(crate) fn commit(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }

        atomic_replace(&self.tmp_path, &self.target)?;

        if let Some(parent) = self.target.parent().filter(|p| !p.as_os_str().is_empty()) {
            sync_dir(parent)?;
        }
        Ok(())
    }
}

impl Write for PendingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("pending file already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.file.take().is_some() || self.tmp_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

pub(crate) fn create_private_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    Ok(())
}

/// Generates a unique temporary file path in the same directory.
///
/// Format: `filename.tmp.<randomhex>`
fn random_tmp_path(target: &Path) -> Result<PathBuf> {
    let mut buf = [0u8; 8]; // 64 bit entropy
    secure_random(&mut buf)?;

    let file_name = target
        .file_name()
        .ok_or_else(|| Error::Io(io::Error::other(format!("{} has no file name", target.display()))))?
        .to_string_lossy();

    let tmp_name = format!("{}.tmp.{}", file_name, hex::encode(buf));

    Ok(target.with_file_name(tmp_name))
}

/// Atomically replaces the target file with the temporary file.
///
/// Uses Windows `ReplaceFileW` with `REPLACEFILE_WRITE_THROUGH` when the
/// target exists and `MoveFileExW` otherwise.
#[cfg(target_os = "windows")]
fn atomic_replace(tmp_path: &Path, target: &Path) -> Result<()> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{
        MOVEFILE_WRITE_THROUGH, MoveFileExW, REPLACEFILE_WRITE_THROUGH, ReplaceFileW,
    };

    fn to_wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(std::iter::once(0)).collect()
    }

    let target_w = to_wide(target.as_os_str());
    let tmp_w = to_wide(tmp_path.as_os_str());

    // SAFETY:
    // - Strings are valid UTF-16 and null-terminated
    // - Pointers remain valid during the call
    // - Windows does not retain the pointers after return
    let result = unsafe {
        if target.exists() {
            ReplaceFileW(
                target_w.as_ptr(),
                tmp_w.as_ptr(),
                std::ptr::null(),
                REPLACEFILE_WRITE_THROUGH,
                std::ptr::null(),
                std::ptr::null(),
            )
        } else {
            MoveFileExW(tmp_w.as_ptr(), target_w.as_ptr(), MOVEFILE_WRITE_THROUGH)
        }
    };

    if result == 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(())
}

/// Atomically replaces the target file with the temporary file.
///
/// On Unix, `rename()` is atomic when both paths are on the same filesystem.
#[cfg(not(target_os = "windows"))]
fn atomic_replace(tmp_path: &Path, target: &Path) -> Result<()> {
    fs::rename(tmp_path, target)?;
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// Directories cannot be opened as files on Windows; ReplaceFileW already
// writes through.
#[cfg(target_os = "windows")]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
