//! Shared payload definitions for peer-to-peer chat between marketplace nodes.

pub mod codec;
pub mod message;
