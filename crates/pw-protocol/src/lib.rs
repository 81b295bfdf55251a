//! pw-protocol: Wire types for portwarden
//!
//! This crate defines the JSON messages exchanged with the download client's
//! RPC endpoint and with the remote port-forwarding service.

pub mod error;
pub mod port;
pub mod rpc;

pub use error::ProtocolError;
pub use port::{decode_port_assignment, PortAssignment};
pub use rpc::{PortTest, RpcRequest, RpcResponse, Torrent, TorrentList, RPC_SUCCESS};
