//! In-Process Broadcast Domain
//!
//! Simulates the single-hop radio mesh for tests and the demo binary: every
//! attached radio has an address and a channel, and a frame reaches exactly
//! the radios tuned to the sender's channel (all of them for broadcast, one
//! for unicast). There is no delivery guarantee; a full receive queue drops
//! the frame, just like a busy radio.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use super::transport::{
    rx_channel, Datagram, LinkAddr, Transport, TransportError, MAX_CHANNEL, MIN_CHANNEL,
};

struct HubNode {
    addr: LinkAddr,
    channel: Arc<AtomicU8>,
    tx: mpsc::Sender<Datagram>,
}

/// Shared broadcast domain. Attach one radio per simulated unit.
pub struct Hub {
    nodes: Mutex<Vec<HubNode>>,
}

impl Hub {
    /// Create an empty domain.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(Vec::new()),
        })
    }

    /// Attach a radio at `addr`, initially tuned to `channel`.
    ///
    /// Returns the radio handle and the receive side of its frame queue.
    pub fn attach(
        self: &Arc<Self>,
        addr: LinkAddr,
        channel: u8,
    ) -> (HubRadio, mpsc::Receiver<Datagram>) {
        let (tx, rx) = rx_channel();
        let channel = Arc::new(AtomicU8::new(channel));
        self.nodes.lock().expect("hub lock").push(HubNode {
            addr,
            channel: channel.clone(),
            tx,
        });
        (
            HubRadio {
                hub: self.clone(),
                addr,
                channel,
            },
            rx,
        )
    }
}

/// One simulated radio attached to a [`Hub`].
pub struct HubRadio {
    hub: Arc<Hub>,
    addr: LinkAddr,
    channel: Arc<AtomicU8>,
}

impl Transport for HubRadio {
    fn send(&self, dest: LinkAddr, frame: &[u8]) -> Result<(), TransportError> {
        let channel = self.channel.load(Ordering::SeqCst);
        let nodes = self.hub.nodes.lock().expect("hub lock");
        for node in nodes.iter() {
            if node.addr == self.addr {
                continue;
            }
            if node.channel.load(Ordering::SeqCst) != channel {
                continue;
            }
            if !dest.is_broadcast() && node.addr != dest {
                continue;
            }
            // Non-blocking hand-off; a full queue loses the frame.
            if node.tx.try_send(Datagram {
                from: self.addr,
                bytes: frame.to_vec(),
            }).is_err() {
                trace!(to = %node.addr, "receive queue full, frame dropped");
            }
        }
        Ok(())
    }

    fn set_channel(&self, channel: u8) -> Result<(), TransportError> {
        if !(MIN_CHANNEL..=MAX_CHANNEL).contains(&channel) {
            return Err(TransportError::InvalidChannel(channel));
        }
        self.channel.store(channel, Ordering::SeqCst);
        Ok(())
    }

    fn channel(&self) -> u8 {
        self.channel.load(Ordering::SeqCst)
    }

    fn add_peer(&self, _addr: LinkAddr) -> Result<(), TransportError> {
        // The hub keeps no peer table; association is implicit.
        Ok(())
    }

    fn remove_peer(&self, _addr: LinkAddr) -> Result<(), TransportError> {
        Ok(())
    }

    fn local_addr(&self) -> LinkAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> LinkAddr {
        LinkAddr([n; 6])
    }

    #[tokio::test]
    async fn broadcast_reaches_same_channel_only() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.attach(addr(1), 6);
        let (_b, mut rx_b) = hub.attach(addr(2), 6);
        let (_c, mut rx_c) = hub.attach(addr(3), 11);

        a.send(LinkAddr::BROADCAST, b"hello").unwrap();

        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.from, addr(1));
        assert_eq!(got.bytes, b"hello");
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn unicast_filters_on_destination() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.attach(addr(1), 1);
        let (_b, mut rx_b) = hub.attach(addr(2), 1);
        let (_c, mut rx_c) = hub.attach(addr(3), 1);

        a.send(addr(3), b"direct").unwrap();

        assert!(rx_b.try_recv().is_err());
        assert_eq!(rx_c.recv().await.unwrap().bytes, b"direct");
    }

    #[tokio::test]
    async fn retuning_moves_a_radio_between_domains() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.attach(addr(1), 1);
        let (b, mut rx_b) = hub.attach(addr(2), 13);

        a.send(LinkAddr::BROADCAST, b"one").unwrap();
        assert!(rx_b.try_recv().is_err());

        b.set_channel(1).unwrap();
        a.send(LinkAddr::BROADCAST, b"two").unwrap();
        assert_eq!(rx_b.recv().await.unwrap().bytes, b"two");
    }

    #[test]
    fn channel_range_enforced() {
        let hub = Hub::new();
        let (a, _rx) = hub.attach(addr(1), 1);
        assert!(matches!(
            a.set_channel(0),
            Err(TransportError::InvalidChannel(0))
        ));
        assert!(matches!(
            a.set_channel(14),
            Err(TransportError::InvalidChannel(14))
        ));
        assert!(a.set_channel(13).is_ok());
    }
}
