//! IPsec tunnel and binding layer.
//!
//! # Module Structure
//!
//! - [`dataplane`]: Reference-counted tunnel/binding map (`Dataplane`)
//! - [`ike`]: IKE daemon capability (`IkeDaemon`, `PresharedKey`)
//! - [`config`]: Binding-layer settings (`DataplaneConfig`)
//! - [`error`]: Domain error types (`IkeError`, `DataplaneError`)
//!
//! # Architecture
//!
//! ```text
//! add/remove tunnel ----> IkeDaemon (keys, connections)
//!        |
//! add/remove binding ---> PolicyStore.set_rule / delete_rule
//! add/remove blacklist        |
//!                        PolicyTable.apply() --> kernel
//! ```

pub mod config;
pub mod dataplane;
pub mod error;
pub mod ike;

// --- Public API Re-exports ---

pub use config::DataplaneConfig;
pub use dataplane::{Dataplane, KEY_LOAD_RETRY_DELAY, MAX_KEY_LOAD_ATTEMPTS};
pub use error::{DataplaneError, IkeError};
pub use ike::{IkeDaemon, PresharedKey, connection_name};
