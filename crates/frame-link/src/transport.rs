use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::LinkError;
use crate::protocol::{ChannelMessage, decode, encode};

const BROADCAST_CAPACITY: usize = 64;
const SUBSCRIPTION_CAPACITY: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Fan-out side of a transport. Any number of subscribers may connect without
/// the publisher keeping track of who they are.
#[derive(Debug)]
pub struct Publisher {
    local_addr: SocketAddr,
    frames: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    pub async fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self, LinkError> {
        let label = format!("{addr:?}");
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| LinkError::Bind {
                addr: label,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (frames, _) = broadcast::channel(BROADCAST_CAPACITY);
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, frames.clone(), cancel.clone()));
        info!(%local_addr, "broadcast publisher listening");

        Ok(Self {
            local_addr,
            frames,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Queues `message` for every connected subscriber and returns how many
    /// there were. Zero subscribers is not an error.
    pub fn publish(&self, message: &ChannelMessage) -> Result<usize, LinkError> {
        let frame = encode(message)?;
        Ok(self.frames.send(frame).unwrap_or(0))
    }

    /// Stops accepting subscribers and closes every open connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "publisher accept task ended abnormally");
            }
        }
        debug!(local_addr = %self.local_addr, "publisher closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    frames: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "subscriber connected");
                    let rx = frames.subscribe();
                    connections.spawn(serve_subscriber(stream, peer, rx, cancel.clone()));
                }
                Err(err) => {
                    warn!(error = %err, "failed to accept subscriber");
                    tokio::time::sleep(INITIAL_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let mut sink = FramedWrite::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "subscriber fell behind; messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if let Err(err) = sink.send(frame).await {
            debug!(%peer, error = %err, "subscriber went away");
            return;
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

/// Receiving side of a transport. Reconnects with backoff until closed and
/// skips frames that fail to decode.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::Receiver<ChannelMessage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Starts subscribing to the publisher at `addr`. The subscription stops
    /// when `parent` is cancelled or [`Subscription::close`] is called.
    pub fn connect(addr: impl Into<String>, parent: &CancellationToken) -> Self {
        let addr = addr.into();
        let cancel = parent.child_token();
        let (tx, messages) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let task = tokio::spawn(subscribe_loop(addr, tx, cancel.clone()));
        Self {
            messages,
            cancel,
            task,
        }
    }

    /// Next message, or `None` once the subscription has stopped.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.messages.recv().await
    }

    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "subscription task ended abnormally");
        }
    }
}

async fn subscribe_loop(
    addr: String,
    tx: mpsc::Sender<ChannelMessage>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = TcpStream::connect(addr.as_str()) => connected,
        };

        match connected {
            Ok(stream) => {
                info!(%addr, "subscribed to publisher");
                backoff = INITIAL_BACKOFF;
                let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = frames.next() => next,
                    };
                    match next {
                        Some(Ok(frame)) => match decode(&frame) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!(%addr, error = %err, "discarding malformed frame"),
                        },
                        Some(Err(err)) => {
                            warn!(%addr, error = %err, "broadcast connection failed");
                            break;
                        }
                        None => {
                            debug!(%addr, "publisher closed the connection");
                            break;
                        }
                    }
                }
            }
            Err(err) => debug!(%addr, error = %err, "publisher unavailable"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
