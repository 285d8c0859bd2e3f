// Peer protocol messages and their TCP framing

use crate::core::{Block, Hash256, Transaction};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type MessageId = u64;

/// Frames larger than this are treated as a protocol violation
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// Summary a peer reports about its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub length: u64,
    pub genesis_hash: Hash256,
    pub genesis_time: u64,
}

/// Payload of a message, tagged by its wire code.
/// Codes ending in `?` are requests answered with the matching code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "data")]
pub enum Command {
    #[serde(rename = "CHAIN_INFO?")]
    ChainInfoRequest,
    #[serde(rename = "CHAIN_INFO")]
    ChainInfo(ChainInfo),
    #[serde(rename = "HAVE_THIS_BLOCK_HASH?")]
    HaveBlockRequest { hash: Hash256 },
    #[serde(rename = "HAVE_THIS_BLOCK_HASH")]
    HaveBlock { exists: bool },
    #[serde(rename = "BLOCK?")]
    BlockRequest { height: u64 },
    /// `None` when the height is beyond the responder's chain
    #[serde(rename = "BLOCK")]
    Block { block: Option<Block> },
    #[serde(rename = "NEW_BLOCK")]
    NewBlock { block: Block },
    #[serde(rename = "NEW_TRANSACTION")]
    NewTransaction { transaction: Transaction },
    /// Listening address of a node worth connecting to
    #[serde(rename = "NEW_NODE")]
    NewNode { address: SocketAddr },
}

impl Command {
    pub fn code(&self) -> &'static str {
        match self {
            Command::ChainInfoRequest => "CHAIN_INFO?",
            Command::ChainInfo(_) => "CHAIN_INFO",
            Command::HaveBlockRequest { .. } => "HAVE_THIS_BLOCK_HASH?",
            Command::HaveBlock { .. } => "HAVE_THIS_BLOCK_HASH",
            Command::BlockRequest { .. } => "BLOCK?",
            Command::Block { .. } => "BLOCK",
            Command::NewBlock { .. } => "NEW_BLOCK",
            Command::NewTransaction { .. } => "NEW_TRANSACTION",
            Command::NewNode { .. } => "NEW_NODE",
        }
    }
}

/// Message envelope: `{code, data, id, response_to}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<MessageId>,
    #[serde(flatten)]
    pub command: Command,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            id: rand::random(),
            response_to: None,
            command,
        }
    }

    /// Reply to this message
    pub fn response(&self, command: Command) -> Self {
        Self {
            id: rand::random(),
            response_to: Some(self.id),
            command,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(MessageError::FrameTooLarge(payload.len()));
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Write one length-prefixed frame
    pub async fn send<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<(), MessageError> {
        stream.write_all(&self.encode()?).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one length-prefixed frame
    pub async fn from_stream<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self, MessageError> {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(MessageError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}
