//! Interception hooks.
//!
//! Hooks get first refusal on every relayed frame: observe it, rewrite it
//! in place, or drop it. Protocol-specific control handling (the cipher key
//! exchange) and generic observation (logging) stay separate hooks composed
//! into an ordered chain.

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;

use crate::core::channel::Channel;
use crate::core::cipher::Rc4;
use crate::core::protocol::{PacketFormat, PacketReader, KEY_EXCHANGE_ID};
use crate::error::Result;
use crate::logger::log;

/// Extension point for packet interception.
///
/// The direction predicates are checked before the handler runs, so an
/// uninterested hook costs nothing on the hot path. Returning `Ok(true)`
/// drops the frame; the frame may also be rewritten in place and forwarded.
#[async_trait]
pub trait PacketHook: Send + Sync {
    fn intercepts_outbound(&self) -> bool {
        false
    }

    fn intercepts_inbound(&self) -> bool {
        false
    }

    async fn on_outbound(
        &self,
        frame: &mut BytesMut,
        source: &Channel,
        destination: &Channel,
    ) -> Result<bool> {
        let _ = (frame, source, destination);
        Ok(false)
    }

    async fn on_inbound(
        &self,
        frame: &mut BytesMut,
        source: &Channel,
        destination: &Channel,
    ) -> Result<bool> {
        let _ = (frame, source, destination);
        Ok(false)
    }
}

/// Ordered hook pipeline; the first hook to drop a frame wins and the rest
/// are not consulted.
#[derive(Default, Clone)]
pub struct HookChain {
    hooks: Vec<Arc<dyn PacketHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: Arc<dyn PacketHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Whether any hook wants to see frames travelling in `direction`.
    pub fn intercepts(&self, direction: PacketFormat) -> bool {
        self.hooks.iter().any(|h| match direction {
            PacketFormat::Outbound => h.intercepts_outbound(),
            PacketFormat::Inbound => h.intercepts_inbound(),
        })
    }

    /// Run the chain over one frame. Returns whether the frame is dropped.
    pub async fn dispatch(
        &self,
        direction: PacketFormat,
        frame: &mut BytesMut,
        source: &Channel,
        destination: &Channel,
    ) -> Result<bool> {
        for hook in &self.hooks {
            let dropped = match direction {
                PacketFormat::Outbound if hook.intercepts_outbound() => {
                    hook.on_outbound(frame, source, destination).await?
                }
                PacketFormat::Inbound if hook.intercepts_inbound() => {
                    hook.on_inbound(frame, source, destination).await?
                }
                _ => false,
            };
            if dropped {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Passive observer: logs every frame, never drops.
pub struct PacketLogger;

impl PacketLogger {
    fn log_frame(&self, direction: PacketFormat, frame: &[u8]) {
        match PacketReader::new(direction, frame) {
            Ok(reader) => {
                log::trace!(
                    direction = %direction,
                    id = reader.id(),
                    len = reader.frame_len(),
                    frame = %printable(frame),
                    "Packet"
                );
            }
            Err(_) => {
                log::warn!(
                    direction = %direction,
                    len = frame.len(),
                    "Unparseable frame observed"
                );
            }
        }
    }
}

#[async_trait]
impl PacketHook for PacketLogger {
    fn intercepts_outbound(&self) -> bool {
        true
    }

    fn intercepts_inbound(&self) -> bool {
        true
    }

    async fn on_outbound(
        &self,
        frame: &mut BytesMut,
        _source: &Channel,
        _destination: &Channel,
    ) -> Result<bool> {
        self.log_frame(PacketFormat::Outbound, frame);
        Ok(false)
    }

    async fn on_inbound(
        &self,
        frame: &mut BytesMut,
        _source: &Channel,
        _destination: &Channel,
    ) -> Result<bool> {
        self.log_frame(PacketFormat::Inbound, frame);
        Ok(false)
    }
}

/// Render a frame for logs: low control bytes become `[n]`, the rest is
/// shown as UTF-8 (lossily).
fn printable(frame: &[u8]) -> String {
    let mut out = String::with_capacity(frame.len());
    for &b in frame {
        if b <= 13 {
            out.push_str(&format!("[{}]", b));
        } else {
            match b {
                0x20..=0x7E => out.push(b as char),
                _ => out.push('.'),
            }
        }
    }
    out
}

/// Installs the session cipher when the client performs its key exchange.
///
/// The reserved control packet carries the shared secret as a hex string;
/// it is consumed here and never forwarded to the real server.
pub struct KeyInstaller;

#[async_trait]
impl PacketHook for KeyInstaller {
    fn intercepts_outbound(&self) -> bool {
        true
    }

    async fn on_outbound(
        &self,
        frame: &mut BytesMut,
        source: &Channel,
        destination: &Channel,
    ) -> Result<bool> {
        let mut reader = PacketReader::new(source.format(), frame)?;
        if reader.id() != KEY_EXCHANGE_ID {
            return Ok(false);
        }

        let shared_secret = reader.read_utf8()?;
        let cipher = Rc4::from_shared_secret_hex(&shared_secret)?;
        destination.install_cipher(cipher).await;

        log::info!(
            peer = destination.peer(),
            key_len = shared_secret.len().div_ceil(2),
            "Session cipher installed"
        );
        Ok(true)
    }
}
