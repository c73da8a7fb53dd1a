//! Kernel XFRM policy reconciliation.
//!
//! # Module Structure
//!
//! - [`model`]: Selector/rule value types (`PolicySelector`, `PolicyRule`)
//! - [`kernel`]: Kernel policy gateway abstraction (`XfrmHandle`, `XfrmConnector`, `XfrmPolicy`)
//! - [`wire`]: XFRM netlink payload codec (`XfrmMessage`)
//! - [`netlink`]: NETLINK_XFRM socket gateway (`NetlinkXfrmConnector`)
//! - [`grace`]: Graceful shutdown phases (`GracefulShutdownPhase`)
//! - [`table`]: Reconciliation engine (`PolicyTable`)
//! - [`store`]: Desired-state sink trait (`PolicyStore`)
//! - [`error`]: Gateway error types (`PolicyTableError`)
//!
//! # Architecture
//!
//! ```text
//! set_rule / delete_rule --> pending changes
//!                                 |
//!                           apply(): resync (list) --> deletions --> updates
//!                                 |                        |
//!                          retry with backoff        XfrmHandle (kernel)
//! ```

pub mod error;
pub mod grace;
pub mod kernel;
pub mod model;
pub mod netlink;
pub mod store;
pub mod table;
pub mod wire;

// --- Public API Re-exports ---

pub use error::PolicyTableError;
pub use grace::{GraceTimes, GracefulShutdownPhase};
pub use kernel::{
    AddressFamily, XfrmConnector, XfrmHandle, XfrmMark, XfrmMode, XfrmPolicy, XfrmProto,
    XfrmTemplate,
};
pub use model::{Direction, PolicyAction, PolicyRule, PolicySelector, host_net};
pub use netlink::{NetlinkXfrmConnector, NetlinkXfrmHandle};
pub use store::PolicyStore;
pub use table::PolicyTable;
pub use wire::{WireError, XfrmMessage, decode_policy, encode_policy_info};
