//! Defines the [`Replicable`] trait.

use crate::packet::RequestPacket;
use crate::GroupId;

/// The application state machine decided requests are executed against.
///
/// Requests may be delivered more than once, e.g. when a group is recovered
/// and replays decisions above its last checkpoint, so execution must be
/// idempotent.
pub trait Replicable: Send + Sync + 'static {
    /// Executes `request` against the state of `group`.
    ///
    /// Returning `false` signals a transient failure. Execution of the group is
    /// halted at this request and retried later; later slots are never
    /// executed first.
    fn execute(&self, group: &GroupId, request: &RequestPacket, recovery: bool) -> bool;

    /// Returns an opaque snapshot of the state of `group`.
    fn checkpoint(&self, group: &GroupId) -> Option<Vec<u8>>;

    /// Replaces the state of `group` with the given snapshot.
    fn restore(&self, group: &GroupId, state: Option<&[u8]>) -> bool;
}
