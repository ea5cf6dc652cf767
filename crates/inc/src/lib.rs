pub mod connection;
pub mod context;
pub mod error;
pub mod method;
pub mod operation;
pub mod server;
pub mod stream;
pub mod subscription;

pub use connection::{ChannelMode, ChannelTable, Connection, ConnectionState};
pub use context::{Context, ContextEvent, ReconnectConfig};
pub use error::IncError;
pub use method::{MethodHandler, MethodOutcome, MethodTable};
pub use operation::{OpState, Operation};
pub use server::{EncryptionRequirement, Server, ServerConfig, ServerEvent, VersionPolicy};
pub use stream::{Stream, StreamState};
pub use subscription::{SubscriptionList, glob_match};

pub use inc_communication as communication;
pub use inc_network as network;
pub use inc_timing as timing;
pub use inc_utils as utils;
pub use tracing;
