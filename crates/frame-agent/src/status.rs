use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use frame_link::{ChannelMessage, Command, ScreenState, StatusSnapshot, Subscription};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::control::AgentEvent;
use crate::screensaver::SaverEvent;

/// Writes `snapshot` as JSON next to `path` and renames it into place so
/// readers never see a torn file.
pub async fn write_status_file(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("failed to encode status")?;
    let file_name = path
        .file_name()
        .with_context(|| format!("status file {} has no file name", path.display()))?;
    let staging = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    tokio::fs::write(&staging, json)
        .await
        .with_context(|| format!("failed to write {}", staging.display()))?;
    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Follows the photo cache's status broadcast. Progress is logged (and
/// mirrored to `status_file`); relayed screen commands feed the screen saver.
#[instrument(name = "status", skip_all, fields(addr = %addr))]
pub async fn follow(
    addr: String,
    status_file: Option<PathBuf>,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut subscription = Subscription::connect(addr.clone(), &cancel);
    let mut last: Option<StatusSnapshot> = None;
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscription.recv() => message,
        };
        match message {
            Some(ChannelMessage::Status(snapshot)) => {
                if last.as_ref().map(|s| s.status) != Some(snapshot.status) {
                    info!(status = ?snapshot.status, "photo cache status changed");
                }
                debug!(
                    total = snapshot.num_total_photos,
                    processed = snapshot.num_processed_photos,
                    failed = snapshot.num_failed_photos,
                    "photo cache progress"
                );
                if let Some(path) = &status_file {
                    if let Err(err) = write_status_file(path, &snapshot).await {
                        warn!(error = ?err, "failed to write status file");
                    }
                }
                last = Some(snapshot);
            }
            Some(ChannelMessage::Command(Command::Screen(state))) => {
                let event = match state {
                    ScreenState::On => SaverEvent::TurnOn,
                    ScreenState::Off => SaverEvent::TurnOff,
                };
                if events.send(AgentEvent::Saver(event)).await.is_err() {
                    break;
                }
            }
            Some(other) => debug!(message = ?other, "ignoring message"),
            None => break,
        }
    }
    subscription.close().await;
    info!("status subscription closed");
    Ok(())
}
