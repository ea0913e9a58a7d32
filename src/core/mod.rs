//! Core relay engine
//!
//! - Wire framing and field codecs for the two packet formats
//! - Session stream cipher
//! - Channels (socket + format + optional cipher)
//! - The bidirectional relay pump
//! - Interception hooks

pub mod channel;
pub mod cipher;
pub mod hooks;
pub mod protocol;
pub mod relay;

pub use channel::Channel;
pub use cipher::Rc4;
pub use hooks::{HookChain, KeyInstaller, PacketHook, PacketLogger};
pub use protocol::{Packet, PacketFormat, PacketReader, PacketWriter};
pub use relay::{Relay, WeldHandle};
