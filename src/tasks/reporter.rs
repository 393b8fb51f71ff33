use std::sync::Arc;

use frame_link::{ChannelMessage, Publisher, StatusSnapshot};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Fans status snapshots out to the frame link and to in-process readers
/// such as the control surface.
#[derive(Clone)]
pub struct StatusReporter {
    publisher: Option<Arc<Publisher>>,
    latest: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusReporter {
    pub fn new(publisher: Option<Arc<Publisher>>) -> Self {
        let (latest, _) = watch::channel(StatusSnapshot::starting());
        Self {
            publisher,
            latest: Arc::new(latest),
        }
    }

    pub fn report(&self, snapshot: StatusSnapshot) {
        self.latest.send_replace(snapshot.clone());
        let Some(publisher) = &self.publisher else {
            return;
        };
        match publisher.publish(&ChannelMessage::from(snapshot)) {
            Ok(receivers) => debug!(receivers, "published status"),
            Err(err) => warn!(error = %err, "failed to publish status"),
        }
    }

    pub fn latest(&self) -> StatusSnapshot {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.latest.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_link::WorkerState;

    #[test]
    fn latest_tracks_reports() {
        let reporter = StatusReporter::new(None);
        assert_eq!(reporter.latest().status, WorkerState::Starting);
        let mut rx = reporter.subscribe();
        reporter.report(StatusSnapshot {
            status: WorkerState::Working,
            num_total_photos: 5,
            num_processed_photos: 1,
            num_failed_photos: 0,
        });
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().num_processed_photos, 1);
        assert_eq!(reporter.latest().num_total_photos, 5);
    }
}
