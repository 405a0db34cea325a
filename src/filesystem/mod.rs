//! Filesystem capability interface.
//!
//! The planner and verifier are polymorphic over this trait; everything else
//! about a filesystem is opaque to the engine. Drivers are registered with the
//! state backend so persisted filesystem names can be resolved back to live
//! instances.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::FilesystemError;

pub mod posix;

pub mod irods;

pub use irods::IrodsFilesystem;
pub use posix::PosixFilesystem;

/// Streaming sequence of addresses enumerated from a FoFN.
pub type AddressStream = Box<dyn Iterator<Item = PathBuf> + Send>;

/// Uniform capability set every filesystem driver must expose.
///
/// `size` and `checksum` fail with a distinct "data inaccessible" error when
/// `accessible` would be false; `checksum` fails with "unsupported checksum"
/// for algorithms outside `supported_checksums`. Both checks live in the
/// provided methods so drivers only implement the raw operations.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &str;

    fn max_concurrency(&self) -> u32;

    /// Does the data exist and can it be read?
    fn accessible(&self, address: &Path) -> bool;

    fn supported_checksums(&self) -> Vec<String>;

    /// Raw size lookup; accessibility has already been checked.
    fn read_size(&self, address: &Path) -> Result<u64, FilesystemError>;

    /// Raw checksum computation; support and accessibility have already been
    /// checked.
    fn compute_checksum(&self, algorithm: &str, address: &Path)
    -> Result<String, FilesystemError>;

    /// Stream the addresses named by a file of filenames.
    ///
    /// MUST stream: FoFNs are of arbitrary size and must not be materialised.
    /// `compressed` of `None` auto-detects gzip from the file's magic bytes.
    fn enumerate_fofn(
        &self,
        fofn: &Path,
        delimiter: u8,
        compressed: Option<bool>,
    ) -> Result<AddressStream, FilesystemError>;

    fn size(&self, address: &Path) -> Result<u64, FilesystemError> {
        if !self.accessible(address) {
            return Err(FilesystemError::DataInaccessible {
                filesystem: self.name().to_string(),
                address: address.to_path_buf(),
            });
        }

        self.read_size(address)
    }

    fn checksum(&self, algorithm: &str, address: &Path) -> Result<String, FilesystemError> {
        if !self.supported_checksums().iter().any(|a| a == algorithm) {
            return Err(FilesystemError::UnsupportedChecksum {
                filesystem: self.name().to_string(),
                algorithm: algorithm.to_string(),
            });
        }

        if !self.accessible(address) {
            return Err(FilesystemError::DataInaccessible {
                filesystem: self.name().to_string(),
                address: address.to_path_buf(),
            });
        }

        self.compute_checksum(algorithm, address)
    }

    fn set_metadata(&self, _address: &Path, _metadata: &[(&str, &str)]) -> Result<(), FilesystemError> {
        Err(FilesystemError::Unsupported {
            filesystem: self.name().to_string(),
            operation: "key-value metadata",
        })
    }

    fn delete_metadata(&self, _address: &Path, _keys: &[&str]) -> Result<(), FilesystemError> {
        Err(FilesystemError::Unsupported {
            filesystem: self.name().to_string(),
            operation: "key-value metadata",
        })
    }

    fn delete_data(&self, _address: &Path) -> Result<(), FilesystemError> {
        Err(FilesystemError::Unsupported {
            filesystem: self.name().to_string(),
            operation: "deletion",
        })
    }
}

/// Tag distinguishing the source side from the target side of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    Source,
    Target,
}

/// A file object: an opaque address keyed to a filesystem.
#[derive(Clone)]
pub struct Data {
    pub filesystem: Arc<dyn Filesystem>,
    pub address: PathBuf,
}

impl Data {
    pub fn new(filesystem: Arc<dyn Filesystem>, address: impl Into<PathBuf>) -> Self {
        Data {
            filesystem,
            address: address.into(),
        }
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data({} on {})",
            self.address.display(),
            self.filesystem.name()
        )
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}",
            self.address.display(),
            self.filesystem.name()
        )
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.filesystem.name() == other.filesystem.name() && self.address == other.address
    }
}

/// Pick a checksum algorithm both endpoints support, preferring md5.
pub fn common_checksum_algorithm(
    source: &dyn Filesystem,
    target: &dyn Filesystem,
) -> Option<String> {
    let ours = source.supported_checksums();
    let theirs = target.supported_checksums();

    if ours.iter().any(|a| a == "md5") && theirs.iter().any(|a| a == "md5") {
        return Some("md5".to_string());
    }

    ours.into_iter().find(|a| theirs.contains(a))
}
