use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Working,
    Finished,
}

/// Progress report broadcast after every acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: WorkerState,
    pub num_total_photos: u64,
    pub num_processed_photos: u64,
    pub num_failed_photos: u64,
}

impl StatusSnapshot {
    pub fn starting() -> Self {
        Self {
            status: WorkerState::Starting,
            num_total_photos: 0,
            num_processed_photos: 0,
            num_failed_photos: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenState {
    On,
    Off,
}

/// Requests flowing between the processes.
///
/// Serialized as `{"command": "screen", "params": "on"}` and
/// `{"command": "displayedPhoto", "params": "<file id>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "camelCase")]
pub enum Command {
    Screen(ScreenState),
    DisplayedPhoto(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelMessage {
    Status(StatusSnapshot),
    Command(Command),
}

impl From<StatusSnapshot> for ChannelMessage {
    fn from(snapshot: StatusSnapshot) -> Self {
        ChannelMessage::Status(snapshot)
    }
}

impl From<Command> for ChannelMessage {
    fn from(command: Command) -> Self {
        ChannelMessage::Command(command)
    }
}

pub(crate) fn encode(message: &ChannelMessage) -> Result<Bytes, LinkError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(LinkError::Encode)
}

pub(crate) fn decode(frame: &[u8]) -> Result<ChannelMessage, LinkError> {
    serde_json::from_slice(frame).map_err(LinkError::Decode)
}
