//! The bidirectional packet pump.
//!
//! A `Relay` pairs the accepted client channel with the established server
//! channel and runs one pump per direction. Each pump is a reader task
//! feeding a bounded queue drained by a single forwarding consumer, so
//! packets within a direction stay in order while slow hook processing
//! never stalls the socket read.

use bytes::BytesMut;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionContext;
use crate::core::channel::Channel;
use crate::core::hooks::HookChain;
use crate::core::protocol::PacketFormat;
use crate::logger::log;

/// Frames buffered per direction between receive and forward
const FORWARD_QUEUE_DEPTH: usize = 32;

/// Handle to a running (or finished) pump
pub type WeldHandle = Shared<BoxFuture<'static, ()>>;

/// A live session: two channels, a hook chain, and the pump welding them.
pub struct Relay {
    pub local: Arc<Channel>,
    pub remote: Arc<Channel>,
    hooks: Arc<HookChain>,
    pub context: ConnectionContext,
    weld: Mutex<Option<WeldHandle>>,
}

impl Relay {
    pub fn new(
        local: Arc<Channel>,
        remote: Arc<Channel>,
        hooks: HookChain,
        context: ConnectionContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            hooks: Arc::new(hooks),
            context,
            weld: Mutex::new(None),
        })
    }

    /// Alive iff both ends still are.
    pub fn is_connected(&self) -> bool {
        self.local.is_connected() && self.remote.is_connected()
    }

    pub fn is_disposed(&self) -> bool {
        self.local.is_disposed() || self.remote.is_disposed()
    }

    /// Start both pumps. Idempotent: while a pump is running, re-invoking
    /// returns the existing handle; once it has finished, a new invocation
    /// starts a fresh pump. The handle resolves when the session ends.
    pub fn attach(self: &Arc<Self>, cancel: CancellationToken) -> WeldHandle {
        let mut weld = self.weld.lock().unwrap();
        if let Some(existing) = weld.as_ref() {
            if existing.peek().is_none() {
                return existing.clone();
            }
        }

        let this = Arc::clone(self);
        let handle: WeldHandle = async move {
            // Either pump finishing tears the session down; the shared
            // token unwinds the other direction's blocked IO.
            let weld_cancel = cancel.child_token();

            let outbound = {
                let this = Arc::clone(&this);
                let weld_cancel = weld_cancel.clone();
                async move {
                    this.pump(
                        Arc::clone(&this.local),
                        Arc::clone(&this.remote),
                        PacketFormat::Outbound,
                        weld_cancel.clone(),
                    )
                    .await;
                    weld_cancel.cancel();
                }
            };
            let inbound = {
                let this = Arc::clone(&this);
                let weld_cancel = weld_cancel.clone();
                async move {
                    this.pump(
                        Arc::clone(&this.remote),
                        Arc::clone(&this.local),
                        PacketFormat::Inbound,
                        weld_cancel.clone(),
                    )
                    .await;
                    weld_cancel.cancel();
                }
            };

            tokio::join!(outbound, inbound);
            this.disconnect();
        }
        .boxed()
        .shared();

        // Drive the pump independently of whoever holds the handle
        tokio::spawn(handle.clone());

        *weld = Some(handle.clone());
        handle
    }

    /// Idempotent teardown of both ends; aborts in-flight socket operations.
    pub fn disconnect(&self) {
        if !self.local.is_disposed() {
            self.local.dispose();
        }
        if !self.remote.is_disposed() {
            self.remote.dispose();
        }
    }

    /// One direction: receive frames from `source`, pass each through the
    /// hook chain, forward survivors to `destination` in receive order.
    async fn pump(
        &self,
        source: Arc<Channel>,
        destination: Arc<Channel>,
        direction: PacketFormat,
        cancel: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::channel::<BytesMut>(FORWARD_QUEUE_DEPTH);
        let pump_cancel = cancel.child_token();

        let reader = {
            let source = Arc::clone(&source);
            let cancel = pump_cancel.clone();
            async move {
                loop {
                    match source.receive_packet(&cancel).await {
                        Ok(frame) => {
                            if tx.send(BytesMut::from(&frame[..])).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            if !e.is_benign() {
                                log::warn!(direction = %direction, error = %e, "Receive failed");
                            }
                            break;
                        }
                    }
                }
                // tx drops here; the forwarder drains what is queued
            }
        };

        let forwarder = {
            let hooks = Arc::clone(&self.hooks);
            let cancel = pump_cancel.clone();
            async move {
                while let Some(mut frame) = rx.recv().await {
                    let dropped = if hooks.intercepts(direction) {
                        match hooks
                            .dispatch(direction, &mut frame, &source, &destination)
                            .await
                        {
                            Ok(dropped) => dropped,
                            Err(e) => {
                                log::warn!(direction = %direction, error = %e, "Hook failed");
                                break;
                            }
                        }
                    } else {
                        false
                    };

                    if !dropped && destination.send_packet(&frame, &cancel).await.is_err() {
                        break;
                    }
                }
                // Unblock the reader if it is still parked on the socket
                cancel.cancel();
            }
        };

        tokio::join!(reader, forwarder);
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.disconnect();
    }
}
