use crate::{connection::OwnerChange, queue::lock};

use super::Inner;

impl Inner {
    /// Starts following the owner of the service, if there is one to follow.
    pub(super) fn init_owner_tracking(&self) {
        let conn = self.conn();
        if !self.is_valid || !conn.is_connected() || conn.is_peer() || self.service.is_empty() {
            return;
        }

        if !conn.should_watch_service(&self.service) {
            // The bus driver and unique names never change hands.
            lock(&self.state).current_owner = self.service.clone();
            return;
        }

        let this = self.this.clone();
        let watch = conn.watch_owner_changes(
            &self.service,
            Box::new(move |change| {
                if let Some(inner) = this.upgrade() {
                    inner.service_owner_changed(change);
                }
            }),
        );
        *lock(&self.owner_watch) = Some(watch);

        match conn.name_owner(&self.service) {
            Ok(owner) => {
                log::debug!("{} is owned by {}", self.service, owner);
                lock(&self.state).current_owner = owner;
            }
            Err(e) => {
                log::debug!("{} has no owner: {}", self.service, e);
                self.set_last_error(e);
            }
        }
    }

    pub(super) fn service_owner_changed(&self, change: OwnerChange) {
        if change.name != self.service {
            log::warn!(
                "proxy for {} ignoring owner change of {}",
                self.service,
                change.name
            );
            return;
        }

        log::debug!(
            "owner of {} changed from '{}' to '{}'",
            change.name,
            change.old_owner,
            change.new_owner
        );
        lock(&self.state).current_owner = change.new_owner;
    }
}
