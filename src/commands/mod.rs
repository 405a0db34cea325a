//! CLI subcommands.
//!
//! `submit` and `status` are user-facing; `__prepare` and `__transfer` are
//! internal modes the executor re-invokes this binary with on the cluster.

use std::sync::Arc;

use crate::config::Config;
use crate::errors::StateError;
use crate::filesystem::{Filesystem, IrodsFilesystem, PosixFilesystem};
use crate::state::StateBackend;

pub mod prepare;
pub mod status;
pub mod submit;
pub mod transfer;

/// Client identity recorded against every job this binary creates.
pub const CLIENT: &str = "shepherd";

/// The filesystems this client transfers between.
pub(crate) struct Filesystems {
    pub lustre: Arc<dyn Filesystem>,
    pub irods: Arc<dyn Filesystem>,
}

pub(crate) fn filesystems() -> Filesystems {
    Filesystems {
        lustre: Arc::new(PosixFilesystem::new("Lustre", 50)),
        irods: Arc::new(IrodsFilesystem::new("iRODS", 10)),
    }
}

/// Connect to the state database with the client's filesystems registered.
pub(crate) fn open_state(config: &Config) -> Result<(Arc<StateBackend>, Filesystems), StateError> {
    let filesystems = filesystems();
    let mut backend = StateBackend::connect(&config.pg)?;
    backend.register_filesystems([
        Arc::clone(&filesystems.lustre),
        Arc::clone(&filesystems.irods),
    ]);
    Ok((Arc::new(backend), filesystems))
}
