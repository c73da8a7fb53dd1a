//! Desired-state sink used by the binding layer.

use crate::model::{PolicyRule, PolicySelector};

/// Accepts desired-state changes keyed by selector.
///
/// Implementations queue the change; nothing reaches the kernel until the
/// owner of the store applies it. Neither call can fail.
pub trait PolicyStore {
    /// Desire `rule` for `sel`, replacing any earlier desire.
    fn set_rule(&mut self, sel: PolicySelector, rule: PolicyRule);

    /// Desire that no policy exists for `sel`.
    fn delete_rule(&mut self, sel: PolicySelector);
}
