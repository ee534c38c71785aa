use std::net::SocketAddr;

use derive_more::{From, Into};

/// Address of the connected client, set once per connection.
#[derive(From, Into, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);
