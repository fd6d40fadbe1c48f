use tracing::{debug, warn};

use crate::{
    message::{Frame, Record, to_frame},
    registry::Registry,
};

/// Sends the current `userlist` to every registered session.
///
/// The record is encoded once and shared. A recipient whose connection is
/// already gone is skipped; its own task will notice the closed socket and
/// unregister. Returns the number of sessions the record was queued for.
pub fn announce(registry: &Registry) -> usize {
    let record = Record::UserList {
        users: registry.snapshot(),
    };
    let frame = match to_frame(&record) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(?error, "failed to encode presence record");
            return 0;
        }
    };

    let mut delivered = 0;
    for (nickname, handle) in registry.sessions() {
        if handle.deliver(Frame::clone(&frame)) {
            delivered += 1;
        } else {
            debug!(%nickname, "presence recipient already disconnected");
        }
    }
    delivered
}
