//! The message channel boundary.
//!
//! The core reads snapshots from `workflows-in` and writes them to
//! `workflows-out`; which broker backs those names is wiring the core does
//! not prescribe. [`ChannelEmitter`] is the in-process implementation used by
//! the CLI loopback and the tests.

use async_trait::async_trait;
use snafu::prelude::*;
use tokio::sync::mpsc;

/// Logical ingress channel name.
pub const WORKFLOWS_IN: &str = "workflows-in";
/// Logical egress channel name.
pub const WORKFLOWS_OUT: &str = "workflows-out";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Channel '{channel}' is closed"))]
    Closed { channel: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sink for outgoing snapshot payloads (UTF-8 JSON).
#[async_trait]
pub trait MessageEmitter: Send + Sync {
    async fn emit(&self, payload: &str) -> Result<()>;
}

/// An emitter backed by a tokio mpsc channel.
#[derive(Clone)]
pub struct ChannelEmitter {
    channel: String,
    sender: mpsc::Sender<String>,
}

impl ChannelEmitter {
    #[must_use]
    pub fn new(channel: impl Into<String>, sender: mpsc::Sender<String>) -> Self {
        Self {
            channel: channel.into(),
            sender,
        }
    }
}

#[async_trait]
impl MessageEmitter for ChannelEmitter {
    async fn emit(&self, payload: &str) -> Result<()> {
        self.sender
            .send(payload.to_string())
            .await
            .map_err(|_| Error::Closed {
                channel: self.channel.clone(),
            })
    }
}

/// An in-process channel pair: the emitter feeds the returned receiver.
#[must_use]
pub fn loopback(channel: &str, capacity: usize) -> (ChannelEmitter, mpsc::Receiver<String>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (ChannelEmitter::new(channel, sender), receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_feeds_receiver() {
        let (emitter, mut receiver) = loopback(WORKFLOWS_OUT, 4);
        emitter.emit("{\"n\":\"wf\"}").await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), "{\"n\":\"wf\"}");
    }

    #[tokio::test]
    async fn closed_channel_reports_error() {
        let (emitter, receiver) = loopback(WORKFLOWS_OUT, 1);
        drop(receiver);
        assert!(emitter.emit("x").await.is_err());
    }
}
