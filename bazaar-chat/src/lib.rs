//! `bazaar-chat`: Chat synchronization engine for a peer-to-peer marketplace client.

pub mod chat;
pub mod config;
pub mod crypto;
pub mod store;
pub mod transport;
