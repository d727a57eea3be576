// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Atomic installation of proxy files.
//!
//! The proxy file is read by the running job at arbitrary times, so
//! it must never be observed half-written.  A new proxy is written to
//! a uniquely-named file in the same directory, flushed to disk, and
//! then renamed over the old one.  If anything goes wrong before the
//! rename, the old proxy is untouched and the temporary file is
//! removed.
use std::fmt::Display;
use std::fmt::Formatter;
use std::fs::Permissions;
use std::io::Error;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::info;
use tempfile::Builder;
use tempfile::NamedTempFile;

use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::proxy::proxy_filename;

/// Mode of installed proxy files.
const PROXY_MODE: u32 = 0o600;

/// Prefix of temporary proxy files.
const TEMP_PREFIX: &str = ".x509up.";

/// Location of the canonical proxy file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyStore {
    path: PathBuf
}

/// A proxy written next to the canonical file but not yet installed.
///
/// Dropping this without calling [commit](StagedProxy::commit)
/// removes the temporary file and leaves the canonical file alone.
pub struct StagedProxy {
    file: NamedTempFile,
    target: PathBuf
}

/// Errors that can occur installing a proxy.
#[derive(Debug)]
pub enum StoreError {
    /// The temporary file could not be created or written.
    Write {
        /// IO error.
        error: Error
    },
    /// The temporary file could not be renamed into place.
    Rename {
        /// IO error.
        error: Error
    }
}

impl ProxyStore {
    /// Create a store for the proxy file at `path`.
    #[inline]
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf> {
        ProxyStore { path: path.into() }
    }

    /// Create a store for the proxy file this process uses.
    #[inline]
    pub fn from_env() -> Self {
        ProxyStore::new(proxy_filename())
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new(".")
        }
    }

    /// Write `contents` to a temporary file beside the proxy file.
    pub fn stage(
        &self,
        contents: &[u8]
    ) -> Result<StagedProxy, StoreError> {
        let mut file = Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.dir())
            .map_err(|err| StoreError::Write { error: err })?;

        debug!(target: "bpr-store",
               "staging proxy at {}",
               file.path().display());

        file.as_file()
            .set_permissions(Permissions::from_mode(PROXY_MODE))
            .map_err(|err| StoreError::Write { error: err })?;
        file.write_all(contents)
            .map_err(|err| StoreError::Write { error: err })?;
        file.as_file()
            .sync_all()
            .map_err(|err| StoreError::Write { error: err })?;

        Ok(StagedProxy {
            file: file,
            target: self.path.clone()
        })
    }

    /// Replace the proxy file with `contents`.
    #[inline]
    pub fn install(
        &self,
        contents: &[u8]
    ) -> Result<(), StoreError> {
        self.stage(contents)?.commit()
    }
}

impl StagedProxy {
    /// Path of the temporary file.
    #[inline]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Rename the temporary file over the proxy file.
    pub fn commit(self) -> Result<(), StoreError> {
        self.file
            .persist(&self.target)
            .map_err(|err| StoreError::Rename { error: err.error })?;

        info!(target: "bpr-store",
              "installed new proxy at {}",
              self.target.display());

        Ok(())
    }
}

impl ScopedError for StoreError {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::Unrecoverable
    }
}

impl Display for StoreError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            StoreError::Write { error } => {
                write!(f, "could not write proxy ({})", error)
            }
            StoreError::Rename { error } => {
                write!(f, "could not install proxy ({})", error)
            }
        }
    }
}

#[cfg(test)]
use std::fs;

#[cfg(test)]
use crate::init;

#[cfg(test)]
fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();

    names.sort();

    names
}

#[test]
fn test_install_new() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let store = ProxyStore::new(dir.path().join("x509up_u1000"));

    store.install(b"first proxy").unwrap();

    let meta = fs::metadata(store.path()).unwrap();

    assert_eq!(b"first proxy".to_vec(), fs::read(store.path()).unwrap());
    assert_eq!(PROXY_MODE, meta.permissions().mode() & 0o777);
    assert_eq!(vec!["x509up_u1000".to_string()], dir_entries(dir.path()));
}

#[test]
fn test_install_replaces() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let store = ProxyStore::new(dir.path().join("x509up_u1000"));

    fs::write(store.path(), "old proxy").unwrap();
    store.install(b"new proxy").unwrap();

    assert_eq!("new proxy", fs::read_to_string(store.path()).unwrap());
    assert_eq!(vec!["x509up_u1000".to_string()], dir_entries(dir.path()));
}

#[test]
fn test_abandoned_stage_keeps_old() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let store = ProxyStore::new(dir.path().join("x509up_u1000"));

    fs::write(store.path(), "old proxy").unwrap();

    let staged = store.stage(b"new proxy").unwrap();
    let temp = staged.path().to_path_buf();

    // Both files exist until the rename.
    assert_eq!(temp.parent(), store.path().parent());
    assert_eq!("new proxy", fs::read_to_string(&temp).unwrap());
    assert_eq!("old proxy", fs::read_to_string(store.path()).unwrap());

    drop(staged);

    assert!(!temp.exists());
    assert_eq!("old proxy", fs::read_to_string(store.path()).unwrap());
}

#[test]
fn test_commit_after_stage() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let store = ProxyStore::new(dir.path().join("x509up_u1000"));

    fs::write(store.path(), "old proxy").unwrap();

    let staged = store.stage(b"new proxy").unwrap();
    let temp = staged.path().to_path_buf();

    staged.commit().unwrap();

    assert!(!temp.exists());
    assert_eq!("new proxy", fs::read_to_string(store.path()).unwrap());
}

#[test]
fn test_missing_directory() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let store = ProxyStore::new(dir.path().join("absent").join("x509up_u1000"));

    assert!(matches!(
        store.install(b"proxy"),
        Err(StoreError::Write { .. })
    ));
}
