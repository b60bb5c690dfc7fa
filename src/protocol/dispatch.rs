//! Message Dispatch
//!
//! One `MessageHandler` implementation exists per unit role (coordinator,
//! laser unit, finish unit); which one runs is decided once at startup by
//! configuration. `run_receiver` is the shared decode loop between the radio
//! hand-off queue and the handler: it validates each frame and silently drops
//! anything that fails, with a trace-level log only. Invalid frames never get
//! a response; on an unauthenticated link that would only invite
//! amplification.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use super::message::Message;
use super::transport::{Datagram, LinkAddr};

/// Role-specific message handling seam.
pub trait MessageHandler: Send + Sync {
    /// Dispatch one validated message from `from`.
    fn handle_message(&self, from: LinkAddr, msg: Message) -> impl Future<Output = ()> + Send;
}

/// Drain the receive queue, decoding and dispatching until the radio side
/// closes the channel.
pub async fn run_receiver<H: MessageHandler>(handler: Arc<H>, mut rx: mpsc::Receiver<Datagram>) {
    while let Some(dgram) = rx.recv().await {
        match Message::decode(&dgram.bytes) {
            Ok(msg) => handler.handle_message(dgram.from, msg).await,
            Err(err) => {
                trace!(from = %dgram.from, %err, "dropping invalid frame");
            }
        }
    }
}
