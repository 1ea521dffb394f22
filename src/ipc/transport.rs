//! Message passing between the appliance and the user interface process

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{Error, Result};
use crate::ipc::request::{IpcReply, IpcRequest};

/// Why a reply was not handed over
#[derive(Debug)]
pub enum DeliveryFailure {
    /// The peer has not drained the previous reply; the reply comes back
    Busy(IpcReply),
    Disconnected,
}

/// Appliance side of the request/reply transport.
pub trait Transport {
    /// Non-blocking poll for the next request.
    fn poll_request(&mut self) -> Result<Option<IpcRequest>>;

    /// Offer a reply to the peer without blocking.
    fn try_deliver(&mut self, reply: IpcReply) -> std::result::Result<(), DeliveryFailure>;
}

/// Transport over flume channels.
pub struct FlumeTransport {
    requests: Receiver<IpcRequest>,
    replies: Sender<IpcReply>,
}

/// User interface side of a [`FlumeTransport`]
#[derive(Clone)]
pub struct PeerEndpoint {
    requests: Sender<IpcRequest>,
    replies: Receiver<IpcReply>,
}

/// Connect an appliance transport to a peer.
///
/// Only `reply_slots` undrained replies fit on the wire; beyond that the
/// appliance sees [`DeliveryFailure::Busy`].
pub fn pair(reply_slots: usize) -> (FlumeTransport, PeerEndpoint) {
    let (request_tx, request_rx) = flume::unbounded();
    let (reply_tx, reply_rx) = flume::bounded(reply_slots.max(1));
    (
        FlumeTransport {
            requests: request_rx,
            replies: reply_tx,
        },
        PeerEndpoint {
            requests: request_tx,
            replies: reply_rx,
        },
    )
}

impl Transport for FlumeTransport {
    fn poll_request(&mut self) -> Result<Option<IpcRequest>> {
        match self.requests.try_recv() {
            Ok(request) => Ok(Some(request)),
            // Pending requests are still drained after the peer is gone
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn try_deliver(&mut self, reply: IpcReply) -> std::result::Result<(), DeliveryFailure> {
        self.replies.try_send(reply).map_err(|e| match e {
            TrySendError::Full(reply) => DeliveryFailure::Busy(reply),
            TrySendError::Disconnected(_) => DeliveryFailure::Disconnected,
        })
    }
}

impl PeerEndpoint {
    pub fn send(&self, request: IpcRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::fault("appliance transport closed"))
    }

    pub async fn send_async(&self, request: IpcRequest) -> Result<()> {
        self.requests
            .send_async(request)
            .await
            .map_err(|_| Error::fault("appliance transport closed"))
    }

    pub fn try_recv(&self) -> Option<IpcReply> {
        self.replies.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<IpcReply> {
        self.replies.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::fault("appliance transport closed"),
        })
    }

    pub async fn recv_async(&self) -> Result<IpcReply> {
        self.replies
            .recv_async()
            .await
            .map_err(|_| Error::fault("appliance transport closed"))
    }
}
