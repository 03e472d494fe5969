use std::sync::Arc;

use super::{Fabricator, FabricatorStatus};

impl Fabricator {
    /// The Drive Loop: connect, then pop and print queued jobs for as long
    /// as the fabricator is `ready`.
    ///
    /// A failed job leaves the fabricator in `error`; the loop then waits
    /// for an operator to release it. An offline fabricator is
    /// re-initialized when woken (new work, or discovery seeing the device
    /// again). Never returns while the fabricator is alive.
    pub async fn drive(self: Arc<Self>) {
        let mut status_rx = self.status.subscribe();
        let mut wants_init = true;

        loop {
            let status = *status_rx.borrow_and_update();
            match status {
                FabricatorStatus::Offline if wants_init => {
                    wants_init = false;
                    if let Err(e) = self.initialize().await {
                        tracing::warn!(
                            fabricator = self.id.0,
                            device = self.device_path(),
                            error = format!("{:?}", e),
                            "initialize failed"
                        );
                    }
                    continue;
                }
                FabricatorStatus::Ready => match self.print_next_in_queue().await {
                    Ok(Some(job_id)) => {
                        tracing::debug!(fabricator = self.id.0, job_id = job_id.0, "job finished");
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(fabricator = self.id.0, error = format!("{:?}", e), "print failed");
                        continue;
                    }
                },
                _ => {}
            }

            tokio::select! {
                _ = self.wake.notified() => wants_init = true,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
