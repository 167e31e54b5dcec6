//! The shared mailbox files: inbound message, assistant reply and the
//! assistant's own configuration document.
//!
//! Writes to the configuration document go through [`atomic_write_json`] while
//! holding a [`FileLock`], so this bridge never leaves a half-written file and
//! never interleaves with another bridge writer.

use std::{
    fs::{self, File, OpenOptions, Permissions},
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::BridgeError;

#[derive(Clone, Debug)]
pub(crate) struct SharedFiles {
    pub(crate) inbound: PathBuf,
    pub(crate) reply: PathBuf,
    pub(crate) claude_config: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub(crate) struct FilesStatus {
    pub(crate) whatsapp_messages: bool,
    pub(crate) claude_config: bool,
    pub(crate) claude_response: bool,
}

impl SharedFiles {
    pub(crate) fn status(&self) -> FilesStatus {
        FilesStatus {
            whatsapp_messages: self.inbound.exists(),
            claude_config: self.claude_config.exists(),
            claude_response: self.reply.exists(),
        }
    }

    pub(crate) fn claude_config_lock_path(&self) -> PathBuf {
        sibling_with_suffix(&self.claude_config, ".lock")
    }
}

/// Reads and parses a JSON file. A missing file is `Ok(None)`, not an error.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BridgeError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(BridgeError::io(path, error)),
    };

    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|error| BridgeError::parse(path, error))
}

/// Removes a file. Returns `Ok(false)` when it was already gone.
pub(crate) fn remove_if_present(path: &Path) -> Result<bool, BridgeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(BridgeError::io(path, error)),
    }
}

/// Pretty-prints `value` into a temp file next to the file `path` resolves to,
/// syncs it and renames it into place. A symlinked `path` stays a symlink and
/// an existing file keeps its permissions.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BridgeError> {
    let mut json =
        serde_json::to_vec_pretty(value).map_err(|error| BridgeError::parse(path, error))?;
    json.push(b'\n');

    let (target, permissions) = match fs::canonicalize(path) {
        Ok(target) => {
            let permissions = fs::metadata(&target)
                .map_err(|error| BridgeError::io(&target, error))?
                .permissions();
            (target, Some(permissions))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => (path.to_path_buf(), None),
        Err(error) => return Err(BridgeError::io(path, error)),
    };

    let tmp_path = sibling_with_suffix(&target, ".tmp");
    write_synced(&tmp_path, &json, permissions).map_err(|error| {
        let _ = fs::remove_file(&tmp_path);
        BridgeError::io(&tmp_path, error)
    })?;

    fs::rename(&tmp_path, &target).map_err(|error| {
        let _ = fs::remove_file(&tmp_path);
        BridgeError::io(&target, error)
    })
}

fn write_synced(path: &Path, contents: &[u8], permissions: Option<Permissions>) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    {
        let mut writer = BufWriter::new(&mut file);
        writer.write_all(contents)?;
        writer.flush()?;
    }

    if let Some(permissions) = permissions {
        file.set_permissions(permissions)?;
    }

    file.sync_all()
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Exclusive advisory lock held until drop.
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    /// Blocks until the lock is acquired. Call from a blocking context.
    pub(crate) fn acquire(lock_path: &Path) -> Result<Self, BridgeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|error| BridgeError::io(lock_path, error))?;

        file.lock_exclusive()
            .map_err(|error| BridgeError::io(lock_path, error))?;

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
