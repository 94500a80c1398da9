//! Client-side conversation synchronization: the in-memory conversation
//! store, the relay transport and the sync core that reconciles the two with
//! local persistence.

pub mod conversation_store;
pub mod error;
pub mod sync_core;
pub mod transport;

pub use conversation_store::{ConversationStore, Snapshot, StoreChange};
pub use error::ClientError;
pub use sync_core::{InboundPolicy, SendOutcome, SkipReason, SyncCore, SyncSettings};
pub use transport::{
    ConnectionState, InboundStream, OfflineTransport, ReconnectPolicy, TransportChannel,
    TransportError, WebSocketTransport,
};
