use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::{Envelope, Rank, ReceiveFilter, TransportError};

/// What a link delivers into a mailbox.
#[derive(Debug)]
pub(crate) enum Inbound {
    Envelope(Envelope),
    /// The peer's link ended cleanly. Everything it sent arrived before this.
    Closed(Rank),
    /// The peer's link broke, the error is fatal to whoever receives next.
    Failed(Rank, TransportError),
}

/// Incoming side of one process.
///
/// Links push into an unbounded channel in arrival order. A receive takes
/// the oldest envelope matching its filter and parks everything else in
/// `pending`, so per-source ordering is preserved for later receives.
pub(crate) struct Mailbox {
    inbound: Receiver<Inbound>,
    state: Mutex<MailboxState>,
    peer_count: usize,
}

#[derive(Default)]
struct MailboxState {
    pending: VecDeque<Envelope>,
    /// Closed peers, with the last frame their closure was reported for.
    closed: BTreeMap<Rank, Option<u64>>,
}

impl Mailbox {
    pub(crate) fn new(peer_count: usize) -> (Self, Sender<Inbound>) {
        let (sender, inbound) = unbounded();
        (
            Self {
                inbound,
                state: Mutex::new(MailboxState::default()),
                peer_count,
            },
            sender,
        )
    }

    pub(crate) fn recv(
        &self,
        filter: ReceiveFilter,
        timeout: Option<Duration>,
    ) -> Result<Envelope, TransportError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        // Held across the blocking wait: concurrent receivers of one process
        // are served one at a time, and each sees the buffer consistently.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.drop_stale(filter.frame_id);
        if let Some(position) = state.pending.iter().position(|envelope| filter.matches(envelope))
            && let Some(envelope) = state.pending.remove(position)
        {
            return Ok(envelope);
        }

        loop {
            state.check_reachable(&filter, self.peer_count)?;
            let inbound = match deadline {
                None => self
                    .inbound
                    .recv()
                    .map_err(|_| TransportError::AllPeersClosed)?,
                Some(deadline) => match self.inbound.recv_deadline(deadline) {
                    Ok(inbound) => inbound,
                    Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(TransportError::AllPeersClosed);
                    }
                },
            };
            match inbound {
                Inbound::Envelope(envelope) if filter.matches(&envelope) => return Ok(envelope),
                Inbound::Envelope(envelope) if envelope.frame_id < filter.frame_id => {
                    log::debug!(
                        "discarding {:?} from {} of finished frame {}",
                        envelope.message.kind(),
                        envelope.source,
                        envelope.frame_id
                    );
                }
                Inbound::Envelope(envelope) => {
                    log::trace!(
                        "buffering {:?} from {} ({}) while waiting for {filter:?}",
                        envelope.message.kind(),
                        envelope.source,
                        envelope.tag
                    );
                    state.pending.push_back(envelope);
                }
                Inbound::Closed(rank) => {
                    log::debug!("{rank} closed its link");
                    state.closed.entry(rank).or_insert(None);
                }
                Inbound::Failed(rank, error) => {
                    log::warn!("link to {rank} failed: {error}");
                    state.closed.entry(rank).or_insert(None);
                    return Err(error);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}

impl MailboxState {
    /// Frame ids only grow, nothing will ever ask for an older frame again.
    fn drop_stale(&mut self, frame_id: u64) {
        let before = self.pending.len();
        self.pending.retain(|envelope| envelope.frame_id >= frame_id);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            log::debug!("dropped {dropped} buffered envelopes of frames before {frame_id}");
        }
    }

    fn check_reachable(
        &mut self,
        filter: &ReceiveFilter,
        peer_count: usize,
    ) -> Result<(), TransportError> {
        if let Some(source) = filter.source
            && self.closed.contains_key(&source)
        {
            return Err(TransportError::PeerClosed(source));
        }
        if peer_count > 0 && self.closed.len() >= peer_count {
            return Err(TransportError::AllPeersClosed);
        }
        if filter.report_closed
            && let Some((rank, reported)) = self
                .closed
                .iter_mut()
                .find(|(_, reported)| **reported != Some(filter.frame_id))
        {
            *reported = Some(filter.frame_id);
            return Err(TransportError::PeerClosed(*rank));
        }
        Ok(())
    }
}
