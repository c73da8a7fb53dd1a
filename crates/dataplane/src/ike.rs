//! IKE daemon capability.
//!
//! The binding layer never speaks the daemon's control protocol itself. It
//! drives an [`IkeDaemon`] implementation, which tests replace with a
//! recording fake.
//!
//! ```text
//! Dataplane --load/unload key--> IkeDaemon --> charon / pluto / ...
//!           --load/unload conn-->
//! ```

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{DataplaneError, IkeError};

/// Operations the binding layer needs from the IKE daemon.
///
/// `load_shared_key` must be safe to retry. Connection calls identify the
/// connection by the ordered `(local, remote)` pair; see [`connection_name`].
pub trait IkeDaemon {
    /// Registers the pre-shared key used to authenticate `remote`.
    fn load_shared_key(&mut self, remote: Ipv4Addr, key: &PresharedKey) -> Result<(), IkeError>;

    /// Forgets the key registered for `remote`.
    fn unload_shared_key(&mut self, remote: Ipv4Addr) -> Result<(), IkeError>;

    /// Loads the tunnel-mode connection from `local` to `remote`.
    fn load_connection(&mut self, local: Ipv4Addr, remote: Ipv4Addr) -> Result<(), IkeError>;

    /// Unloads the connection from `local` to `remote`.
    fn unload_connection(&mut self, local: Ipv4Addr, remote: Ipv4Addr) -> Result<(), IkeError>;
}

/// Deterministic connection name for an ordered address pair.
pub fn connection_name(local: Ipv4Addr, remote: Ipv4Addr) -> String {
    format!("{local}-{remote}")
}

/// Pre-shared key shared by every host in the mesh.
///
/// Cleared on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey(String);

impl PresharedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Reads the key from `path`, trimming surrounding whitespace.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DataplaneError> {
        let path = path.as_ref();
        let mut raw = fs::read_to_string(path).map_err(|e| DataplaneError::KeyFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let key = Self::new(raw.trim());
        raw.zeroize();

        if key.is_empty() {
            return Err(DataplaneError::KeyFile {
                path: path.display().to_string(),
                reason: "key file is empty".to_owned(),
            });
        }
        Ok(key)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresharedKey")
            .field("key", &"[REDACTED]")
            .field("len", &self.0.len())
            .finish()
    }
}
