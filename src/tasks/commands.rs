use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use frame_link::{ChannelMessage, Command, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{SharedCache, lock};

pub const DISPLAYED_LOG_CAPACITY: usize = 50;

pub type SharedDisplayed = Arc<Mutex<DisplayedLog>>;

/// Most recently displayed cache files, newest first, without duplicates.
#[derive(Debug, Clone)]
pub struct DisplayedLog {
    recent: VecDeque<String>,
    capacity: usize,
}

impl Default for DisplayedLog {
    fn default() -> Self {
        Self::with_capacity(DISPLAYED_LOG_CAPACITY)
    }
}

impl DisplayedLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, file_id: &str) {
        self.remove(file_id);
        self.recent.push_front(file_id.to_string());
        self.recent.truncate(self.capacity);
    }

    pub fn remove(&mut self, file_id: &str) -> bool {
        let before = self.recent.len();
        self.recent.retain(|id| id != file_id);
        self.recent.len() != before
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }
}

/// Listens for notices from the frame side. Displayed photos are touched in
/// the cache so eviction prefers photos that have not been shown lately.
#[instrument(name = "commands", skip_all, fields(addr = %addr))]
pub async fn run(
    addr: String,
    cache: SharedCache,
    displayed: SharedDisplayed,
    cancel: CancellationToken,
) -> Result<()> {
    let mut subscription = Subscription::connect(addr.clone(), &cancel);
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscription.recv() => message,
        };
        match message {
            Some(ChannelMessage::Command(Command::DisplayedPhoto(file_id))) => {
                let touched = lock(&cache).touch(&file_id);
                lock(&displayed).record(&file_id);
                debug!(%file_id, touched, "photo displayed");
            }
            Some(other) => debug!(message = ?other, "ignoring message"),
            None => break,
        }
    }
    subscription.close().await;
    info!("command subscription closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keeps_newest_first_without_duplicates() {
        let mut log = DisplayedLog::with_capacity(3);
        for id in ["a.jpg", "b.jpg", "c.jpg", "a.jpg", "d.jpg"] {
            log.record(id);
        }
        assert_eq!(log.snapshot(), vec!["d.jpg", "a.jpg", "c.jpg"]);
        assert!(log.remove("a.jpg"));
        assert!(!log.remove("a.jpg"));
        assert_eq!(log.snapshot(), vec!["d.jpg", "c.jpg"]);
    }
}
