// P2P networking

mod message;
mod node;
mod peer;
mod sync;

pub use message::{ChainInfo, Command, MAX_FRAME_LEN, Message, MessageError, MessageId};
pub use node::{MAX_BLOCK_TRANSACTIONS, Node, NodeError};
pub use peer::{PeerError, PeerEvent, PeerHandle, REQUEST_TIMEOUT};
pub use sync::{ChainSource, ChainSync, ForkChoice, SyncError, SyncOutcome, chain_info};
