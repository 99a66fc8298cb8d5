mod connection;
mod memory;
mod model;

pub use connection::{Connection, ConnectionError, ErrorClass};
pub use memory::{CommitGate, MemoryServer};
pub use model::{
    Bookmark, ItemType, Permissions, RemoteAction, RemoteResponse, ServerItem, Share, ShareKind,
    ShareOptions,
};
