//! In-process transport between the client and the remote side
//!
//! A pair of unbounded tokio channels. Messages on each direction are delivered
//! in send order, which gives the FIFO-per-transaction guarantee the client
//! relies on. Dropping the [`RemoteEndpoint`] is how the client learns that
//! its counterpart is gone.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use super::{ChildMessage, ParentMessage};
use crate::error::{IdbError, Result};

/// Outcome of a non-blocking receive
#[derive(Debug)]
pub enum Received<T> {
    Message(T),
    /// Nothing queued right now
    Empty,
    /// The other side dropped its endpoint and everything queued was consumed
    Closed,
}

/// The client's half of the channel
pub struct ClientEndpoint {
    sender: UnboundedSender<ChildMessage>,
    receiver: UnboundedReceiver<ParentMessage>,
}

/// The remote side's half of the channel
pub struct RemoteEndpoint {
    sender: UnboundedSender<ParentMessage>,
    receiver: UnboundedReceiver<ChildMessage>,
}

/// Create a connected endpoint pair
pub fn pair() -> (ClientEndpoint, RemoteEndpoint) {
    let (child_tx, child_rx) = mpsc::unbounded_channel();
    let (parent_tx, parent_rx) = mpsc::unbounded_channel();
    (
        ClientEndpoint {
            sender: child_tx,
            receiver: parent_rx,
        },
        RemoteEndpoint {
            sender: parent_tx,
            receiver: child_rx,
        },
    )
}

impl ClientEndpoint {
    /// Send a message to the remote side
    pub fn send(&self, message: ChildMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| IdbError::ChannelClosed(format!("remote side dropped: {:?}", e.0)))
    }

    /// Receive without blocking
    pub fn try_recv(&mut self) -> Received<ParentMessage> {
        match self.receiver.try_recv() {
            Ok(message) => Received::Message(message),
            Err(TryRecvError::Empty) => Received::Empty,
            Err(TryRecvError::Disconnected) => Received::Closed,
        }
    }

    /// Wait for the next message; `None` once the remote side is gone
    pub async fn recv(&mut self) -> Option<ParentMessage> {
        self.receiver.recv().await
    }

    /// Check whether the remote side has dropped its receiver
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl RemoteEndpoint {
    /// Send a message to the client
    pub fn send(&self, message: ParentMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| IdbError::ChannelClosed(format!("client dropped: {:?}", e.0)))
    }

    /// Receive one client message without blocking
    pub fn try_recv(&mut self) -> Option<ChildMessage> {
        self.receiver.try_recv().ok()
    }

    /// Take every client message queued so far
    pub fn drain(&mut self) -> Vec<ChildMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Wait for the next client message; `None` once the client is gone
    pub async fn recv(&mut self) -> Option<ChildMessage> {
        self.receiver.recv().await
    }
}
