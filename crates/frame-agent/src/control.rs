//! Local control socket. Each connection sends newline-delimited JSON
//! requests and gets one JSON line back per request.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use frame_link::ScreenState;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::screensaver::SaverEvent;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlRequest {
    Motion,
    Displayed { photo: String },
    Screen { state: ScreenState },
}

/// Everything the agent's main loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Saver(SaverEvent),
    Displayed(String),
}

impl From<ControlRequest> for AgentEvent {
    fn from(request: ControlRequest) -> Self {
        match request {
            ControlRequest::Motion => AgentEvent::Saver(SaverEvent::Motion),
            ControlRequest::Screen {
                state: ScreenState::On,
            } => AgentEvent::Saver(SaverEvent::TurnOn),
            ControlRequest::Screen {
                state: ScreenState::Off,
            } => AgentEvent::Saver(SaverEvent::TurnOff),
            ControlRequest::Displayed { photo } => AgentEvent::Displayed(photo),
        }
    }
}

pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Binds `path`, replacing a stale socket left by an earlier run.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()));
            }
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    #[instrument(name = "control", skip_all, fields(path = %self.path.display()))]
    pub async fn serve(self, events: mpsc::Sender<AgentEvent>, cancel: CancellationToken) -> Result<()> {
        info!("control socket listening");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let events = events.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, events, cancel).await {
                            debug!(error = %err, "control connection ended with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept control connection"),
            }
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(error = %err, "failed to remove control socket");
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => {
                debug!(?request, "control request");
                if events.send(request.into()).await.is_err() {
                    json!({"ok": false, "error": "agent is shutting down"})
                } else {
                    json!({"ok": true})
                }
            }
            Err(err) => {
                warn!(error = %err, "invalid control request");
                json!({"ok": false, "error": err.to_string()})
            }
        };
        let mut encoded = reply.to_string();
        encoded.push('\n');
        write.write_all(encoded.as_bytes()).await?;
    }
}
