use std::time::Duration;

use crossbeam_channel::Sender;

use crate::mailbox::{Inbound, Mailbox};
use crate::{
    Envelope, Message, MessageTag, ProcessTopology, Rank, ReceiveFilter, Transport,
    TransportError,
};

/// In-memory topology: every rank is an endpoint, typically driven by its
/// own thread. Messages are moved, not encoded.
pub struct LocalFabric;

impl LocalFabric {
    /// One endpoint per rank, in rank order.
    ///
    /// Panics if `size` is zero.
    pub fn new(size: u32) -> Vec<FabricEndpoint> {
        assert!(size > 0, "fabric needs at least one rank");
        let (mailboxes, senders): (Vec<Mailbox>, Vec<Sender<Inbound>>) = (0..size)
            .map(|_| Mailbox::new(size as usize - 1))
            .unzip();

        mailboxes
            .into_iter()
            .enumerate()
            .map(|(rank, mailbox)| {
                let peers = senders
                    .iter()
                    .enumerate()
                    .map(|(peer, sender)| (peer != rank).then(|| sender.clone()))
                    .collect();
                FabricEndpoint {
                    topology: ProcessTopology::new(Rank(rank as u32), size)
                        .expect("rank below fabric size"),
                    peers,
                    mailbox,
                }
            })
            .collect()
    }
}

pub struct FabricEndpoint {
    topology: ProcessTopology,
    peers: Vec<Option<Sender<Inbound>>>,
    mailbox: Mailbox,
}

impl Transport for FabricEndpoint {
    fn topology(&self) -> ProcessTopology {
        self.topology
    }

    fn send(
        &self,
        dest: Rank,
        frame_id: u64,
        tag: MessageTag,
        message: Message,
    ) -> Result<(), TransportError> {
        let Some(Some(peer)) = self.peers.get(dest.0 as usize) else {
            return Err(TransportError::UnknownRank(dest));
        };
        peer.send(Inbound::Envelope(Envelope {
            source: self.topology.self_rank(),
            frame_id,
            tag,
            message,
        }))
        .map_err(|_| TransportError::PeerClosed(dest))
    }

    fn recv(
        &self,
        filter: ReceiveFilter,
        timeout: Option<Duration>,
    ) -> Result<Envelope, TransportError> {
        self.mailbox.recv(filter, timeout)
    }
}

impl Drop for FabricEndpoint {
    fn drop(&mut self) {
        let rank = self.topology.self_rank();
        for peer in self.peers.iter().flatten() {
            let _ = peer.send(Inbound::Closed(rank));
        }
    }
}
