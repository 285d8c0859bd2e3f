// Peer connection management

use crate::network::message::{Command, Message, MessageError, MessageId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;

type Pending = Arc<Mutex<HashMap<MessageId, oneshot::Sender<Message>>>>;
type KillSignal = String;

/// Default time a request waits for its response
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for peer response")]
    Timeout,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Peer killed: {0}")]
    Killed(String),
}

/// What a connection reports to its owner
#[derive(Debug)]
pub enum PeerEvent {
    /// A message that is not the response to one of our requests
    Message(PeerHandle, Message),
    Disconnected(SocketAddr),
}

/// Cloneable handle used to talk to (and kill) a connected peer
#[derive(Clone, Debug)]
pub struct PeerHandle {
    /// Remote socket address of the connection
    pub addr: SocketAddr,
    /// We dialed this peer, so `addr` is its listening address
    pub outbound: bool,
    /// Listening address an inbound peer announced about itself
    announced: Arc<OnceLock<SocketAddr>>,
    outgoing: mpsc::Sender<Message>,
    pending: Pending,
    request_timeout: Duration,
    kill: Arc<Mutex<Option<oneshot::Sender<KillSignal>>>>,
}

impl PeerHandle {
    /// Dial `addr` and start the connection tasks
    pub async fn connect(
        addr: SocketAddr,
        events: mpsc::Sender<PeerEvent>,
        request_timeout: Duration,
    ) -> Result<Self, PeerError> {
        let stream = TcpStream::connect(addr).await?;
        log::info!("Connected to peer {}", addr);
        Self::spawn(stream, true, events, request_timeout)
    }

    /// Start reader and writer tasks for an established connection
    pub fn spawn(
        stream: TcpStream,
        outbound: bool,
        events: mpsc::Sender<PeerEvent>,
        request_timeout: Duration,
    ) -> Result<Self, PeerError> {
        let addr = stream.peer_addr()?;
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Message>(64);
        let (kill, should_kill) = oneshot::channel::<KillSignal>();

        let handle = Self {
            addr,
            outbound,
            announced: Arc::new(OnceLock::new()),
            outgoing: outgoing_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_timeout,
            kill: Arc::new(Mutex::new(Some(kill))),
        };

        let my_handle = handle.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            let pending = my_handle.pending.clone();

            let result = tokio::select! {
                res = reader_task(reader, my_handle, events.clone()) => res,
                res = writer_task(writer, outgoing_rx) => res,
                res = async move {
                    let reason = should_kill.await.unwrap_or_else(|_| "handle dropped".to_string());
                    Err(PeerError::Killed(reason))
                } => res,
            };

            if let Err(e) = result {
                log::info!("Peer {} disconnected: {}", addr, e);
            }
            // waiting requests fail fast instead of running into the timeout
            pending.lock().await.clear();
            let _ = events.send(PeerEvent::Disconnected(addr)).await;
        });

        Ok(handle)
    }

    /// Send a request and wait for the matching response.
    /// A peer that does not answer in time is disconnected.
    pub async fn request(&self, command: Command) -> Result<Command, PeerError> {
        let message = Message::new(command);
        let id = message.id;
        let (callback_tx, callback_rx) = oneshot::channel::<Message>();
        self.pending.lock().await.insert(id, callback_tx);

        if self.outgoing.send(message).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(PeerError::Disconnected);
        }

        match timeout(self.request_timeout, callback_rx).await {
            Ok(Ok(response)) => Ok(response.command),
            Ok(Err(_)) => Err(PeerError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                log::warn!("Peer {} timed out, evicting", self.addr);
                self.kill("request timed out").await;
                Err(PeerError::Timeout)
            }
        }
    }

    /// Send a message without expecting a response
    pub async fn send(&self, command: Command) -> Result<(), PeerError> {
        self.send_message(Message::new(command)).await
    }

    /// Answer `request`
    pub async fn respond(&self, request: &Message, command: Command) -> Result<(), PeerError> {
        self.send_message(request.response(command)).await
    }

    async fn send_message(&self, message: Message) -> Result<(), PeerError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| PeerError::Disconnected)
    }

    /// Close the connection; further requests fail with `Disconnected`
    pub async fn kill(&self, reason: &str) {
        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(reason.to_string());
        }
    }

    /// Address other nodes can dial to reach this peer, if known
    pub fn node_address(&self) -> Option<SocketAddr> {
        if self.outbound {
            Some(self.addr)
        } else {
            self.announced.get().copied()
        }
    }

    /// Remember the listening address an inbound peer announced.
    /// Returns false if one was already recorded.
    pub fn set_announced(&self, address: SocketAddr) -> bool {
        !self.outbound && self.announced.set(address).is_ok()
    }

    /// Number of requests still waiting for a response
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

async fn reader_task(
    mut stream: OwnedReadHalf,
    my_handle: PeerHandle,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(), PeerError> {
    loop {
        let message = Message::from_stream(&mut stream).await?;
        log::debug!("Received {} from {}", message.command.code(), my_handle.addr);

        let requester = match message.response_to {
            Some(id) => my_handle.pending.lock().await.remove(&id),
            None => None,
        };
        match requester {
            Some(requester) => {
                let _ = requester.send(message);
            }
            None => {
                events
                    .send(PeerEvent::Message(my_handle.clone(), message))
                    .await
                    .map_err(|_| PeerError::Disconnected)?;
            }
        }
    }
}

async fn writer_task(
    mut stream: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Message>,
) -> Result<(), PeerError> {
    while let Some(message) = receiver.recv().await {
        message.send(&mut stream).await?;
    }
    Err(PeerError::Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Connected pair: (our handle, events of the remote side)
    async fn connected_pair(
        request_timeout: Duration,
    ) -> (PeerHandle, PeerHandle, mpsc::Receiver<PeerEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (local_events, _local_rx) = mpsc::channel(16);
        let dial = PeerHandle::connect(addr, local_events, request_timeout);
        let (accepted, (stream, _)) = tokio::join!(dial, async { listener.accept().await.unwrap() });

        let (remote_events, remote_rx) = mpsc::channel(16);
        let remote = PeerHandle::spawn(stream, false, remote_events, request_timeout).unwrap();
        (accepted.unwrap(), remote, remote_rx)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (local, _remote, mut remote_rx) = connected_pair(REQUEST_TIMEOUT).await;

        let responder = tokio::spawn(async move {
            match remote_rx.recv().await {
                Some(PeerEvent::Message(peer, message)) => {
                    assert_eq!(message.command, Command::BlockRequest { height: 3 });
                    peer.respond(&message, Command::Block { block: None }).await.unwrap();
                }
                other => panic!("unexpected event {:?}", other),
            }
        });

        let response = local.request(Command::BlockRequest { height: 3 }).await.unwrap();
        assert_eq!(response, Command::Block { block: None });
        assert_eq!(local.pending_requests().await, 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_evicts_peer() {
        let (local, _remote, _remote_rx) = connected_pair(Duration::from_millis(100)).await;

        // nobody answers on the remote side
        let result = local.request(Command::ChainInfoRequest).await;
        assert!(matches!(result, Err(PeerError::Timeout)));
        assert_eq!(local.pending_requests().await, 0);

        // the connection is gone afterwards
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(local.send(Command::ChainInfoRequest).await.is_err());
    }

    #[tokio::test]
    async fn test_announced_address() {
        let (local, remote, _remote_rx) = connected_pair(REQUEST_TIMEOUT).await;
        let listening: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        assert_eq!(local.node_address(), Some(local.addr));
        assert!(!local.set_announced(listening));

        assert_eq!(remote.node_address(), None);
        assert!(remote.set_announced(listening));
        assert!(!remote.set_announced(local.addr));
        assert_eq!(remote.node_address(), Some(listening));
    }
}
