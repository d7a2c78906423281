use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::codec::{read_message, write_message};
use crate::mailbox::{Inbound, Mailbox};
use crate::{
    COORDINATOR_RANK, Envelope, Message, MessageTag, ProcessTopology, Rank, ReceiveFilter,
    Transport, TransportError,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Star topology over TCP: the coordinator holds one connection per worker,
/// workers only talk to the coordinator.
///
/// Each connection gets a reader thread feeding the mailbox and a buffered
/// writer that is flushed on every send.
pub struct TcpTransport {
    topology: ProcessTopology,
    links: HashMap<Rank, Mutex<BufWriter<TcpStream>>>,
    mailbox: Mailbox,
}

impl TcpTransport {
    /// Accepts `size - 1` workers on `listener`. Each must introduce itself
    /// with a `Hello` naming a distinct worker rank and the same `size`.
    ///
    /// Connections that fail the handshake are dropped and accepting goes
    /// on. Fails once `accept_timeout` elapses with workers still missing.
    pub fn coordinator(
        listener: TcpListener,
        size: u32,
        accept_timeout: Duration,
    ) -> Result<Self, TransportError> {
        Self::coordinator_watching(listener, size, accept_timeout, || Ok(()))
    }

    /// Like [`TcpTransport::coordinator`], calling `watch` between accept
    /// attempts. An `Err` from `watch` stops waiting for workers.
    pub fn coordinator_watching<F>(
        listener: TcpListener,
        size: u32,
        accept_timeout: Duration,
        mut watch: F,
    ) -> Result<Self, TransportError>
    where
        F: FnMut() -> Result<(), String>,
    {
        let topology = ProcessTopology::new(COORDINATOR_RANK, size)?;
        let worker_count = topology.worker_count() as usize;
        let (mailbox, inbound) = Mailbox::new(worker_count);
        let mut links = HashMap::with_capacity(worker_count);
        let deadline = Instant::now() + accept_timeout;

        listener.set_nonblocking(true)?;
        while links.len() < worker_count {
            watch().map_err(TransportError::AcceptAborted)?;
            let (stream, peer_addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::AcceptTimeout {
                            joined: links.len(),
                            expected: worker_count,
                        });
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            let handshake_timeout = deadline
                .saturating_duration_since(Instant::now())
                .clamp(MIN_HANDSHAKE_TIMEOUT, HANDSHAKE_TIMEOUT);
            match handshake(&stream, size, handshake_timeout, &links) {
                Ok((rank, reader)) => {
                    log::info!("{rank} joined from {peer_addr}");
                    spawn_reader(rank, reader, inbound.clone())?;
                    links.insert(rank, Mutex::new(BufWriter::new(stream)));
                }
                Err(error) => log::warn!("dropping connection from {peer_addr}: {error}"),
            }
        }

        Ok(Self {
            topology,
            links,
            mailbox,
        })
    }

    /// Connects to the coordinator at `addr`, retrying until
    /// `connect_timeout` has elapsed.
    pub fn worker(
        addr: SocketAddr,
        rank: Rank,
        size: u32,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let topology = ProcessTopology::new(rank, size)?;
        if topology.is_coordinator() {
            return Err(TransportError::Handshake(
                "the coordinator rank cannot join as a worker".to_owned(),
            ));
        }
        let stream = connect_with_retry(addr, connect_timeout)?;
        stream.set_nodelay(true)?;
        let mut writer = BufWriter::new(stream.try_clone()?);
        write_message(&mut writer, 0, MessageTag::CONTROL, &Message::Hello { rank, size })?;
        writer.flush()?;

        let (mailbox, inbound) = Mailbox::new(1);
        spawn_reader(COORDINATOR_RANK, BufReader::new(stream), inbound)?;
        log::info!("{rank} connected to coordinator at {addr}");

        let mut links = HashMap::with_capacity(1);
        links.insert(COORDINATOR_RANK, Mutex::new(writer));
        Ok(Self {
            topology,
            links,
            mailbox,
        })
    }
}

impl Transport for TcpTransport {
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
        let link = self.links.get(&dest).ok_or(TransportError::UnknownRank(dest))?;
        let mut writer = link.lock().unwrap_or_else(PoisonError::into_inner);
        write_message(&mut *writer, frame_id, tag, &message)?;
        writer.flush()?;
        Ok(())
    }

    fn recv(
        &self,
        filter: ReceiveFilter,
        timeout: Option<Duration>,
    ) -> Result<Envelope, TransportError> {
        self.mailbox.recv(filter, timeout)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        // Half-close so the peer reads everything already written, then EOF.
        for (rank, link) in &self.links {
            let mut writer = link.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(error) = writer.flush() {
                log::warn!("final flush to {rank} failed: {error}");
            }
            let _ = writer.get_ref().shutdown(Shutdown::Write);
        }
    }
}

/// Reads the opening `Hello` of a freshly accepted worker connection.
fn handshake(
    stream: &TcpStream,
    size: u32,
    timeout: Duration,
    links: &HashMap<Rank, Mutex<BufWriter<TcpStream>>>,
) -> Result<(Rank, BufReader<TcpStream>), TransportError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let rank = match read_message(&mut reader)? {
        Some(hello) => match hello.message {
            Message::Hello {
                rank,
                size: peer_size,
            } if peer_size == size => rank,
            Message::Hello {
                size: peer_size, ..
            } => {
                return Err(TransportError::Handshake(format!(
                    "peer believes the topology has {peer_size} processes, not {size}"
                )));
            }
            other => {
                return Err(TransportError::Handshake(format!(
                    "peer opened with {:?} instead of Hello",
                    other.kind()
                )));
            }
        },
        None => {
            return Err(TransportError::Handshake(
                "peer closed before saying hello".to_owned(),
            ));
        }
    };
    if rank == COORDINATOR_RANK || rank.0 >= size {
        return Err(TransportError::Handshake(format!(
            "peer claims {rank}, outside workers 1..{size}"
        )));
    }
    if links.contains_key(&rank) {
        return Err(TransportError::Handshake(format!(
            "peer claims {rank}, which already joined"
        )));
    }
    stream.set_read_timeout(None)?;
    Ok((rank, reader))
}

fn connect_with_retry(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let deadline = Instant::now() + connect_timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(error) if Instant::now() < deadline => {
                log::debug!("coordinator at {addr} not reachable yet: {error}");
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn spawn_reader(
    peer: Rank,
    mut reader: BufReader<TcpStream>,
    inbound: Sender<Inbound>,
) -> Result<(), TransportError> {
    thread::Builder::new()
        .name(format!("tile_farm_link_{}", peer.0))
        .spawn(move || {
            loop {
                let delivered = match read_message(&mut reader) {
                    Ok(Some(wire)) => inbound.send(Inbound::Envelope(Envelope {
                        source: peer,
                        frame_id: wire.frame_id,
                        tag: wire.tag,
                        message: wire.message,
                    })),
                    Ok(None) => {
                        let _ = inbound.send(Inbound::Closed(peer));
                        return;
                    }
                    Err(error) => {
                        let _ = inbound.send(Inbound::Failed(peer, error));
                        return;
                    }
                };
                if delivered.is_err() {
                    // Mailbox is gone, nobody listens anymore.
                    return;
                }
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::TileIndex;

    fn loopback() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        (listener, addr)
    }

    #[test]
    fn coordinator_and_workers_exchange_messages() {
        let (listener, addr) = loopback();
        let connect_timeout = Duration::from_secs(5);

        thread::scope(|scope| {
            let workers: Vec<_> = (1..=2)
                .map(|raw| {
                    scope.spawn(move || {
                        let worker = TcpTransport::worker(addr, Rank(raw), 3, connect_timeout)
                            .expect("worker connects");
                        worker
                            .send(
                                COORDINATOR_RANK,
                                1,
                                MessageTag(raw),
                                Message::FrameJoin { pullers: raw },
                            )
                            .expect("join");
                        let grant = worker
                            .recv(ReceiveFilter::any(1), Some(connect_timeout))
                            .expect("grant");
                        assert_eq!(grant.source, COORDINATOR_RANK);
                        grant.message
                    })
                })
                .collect();

            let coordinator =
                TcpTransport::coordinator(listener, 3, connect_timeout).expect("coordinator");
            for _ in 0..2 {
                let join = coordinator
                    .recv(ReceiveFilter::any(1), Some(connect_timeout))
                    .expect("join arrives");
                assert_eq!(
                    join.message,
                    Message::FrameJoin {
                        pullers: join.source.0
                    }
                );
                assert_eq!(join.tag, MessageTag(join.source.0));
                coordinator
                    .send(
                        join.source,
                        1,
                        MessageTag::CONTROL,
                        Message::TileGrant {
                            index: Some(TileIndex(join.source.0)),
                        },
                    )
                    .expect("grant");
            }

            for (worker, handle) in workers.into_iter().enumerate() {
                let message = handle.join().expect("worker thread");
                assert_eq!(
                    message,
                    Message::TileGrant {
                        index: Some(TileIndex(worker as u32 + 1)),
                    }
                );
            }
        });
    }

    #[test]
    fn mismatched_worker_is_turned_away() {
        let (listener, addr) = loopback();
        thread::scope(|scope| {
            scope.spawn(move || {
                let _ = TcpTransport::worker(addr, Rank(1), 5, Duration::from_secs(5));
            });
            let result = TcpTransport::coordinator(listener, 2, Duration::from_millis(300));
            assert_eq!(
                result.err(),
                Some(TransportError::AcceptTimeout {
                    joined: 0,
                    expected: 1,
                })
            );
        });
    }

    #[test]
    fn coordinator_gives_up_when_nobody_connects() {
        let (listener, _addr) = loopback();
        let started = Instant::now();
        let result = TcpTransport::coordinator(listener, 3, Duration::from_millis(150));
        assert_eq!(
            result.err(),
            Some(TransportError::AcceptTimeout {
                joined: 0,
                expected: 2,
            })
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stray_connection_does_not_stop_the_coordinator() {
        let (listener, addr) = loopback();
        thread::scope(|scope| {
            scope.spawn(move || {
                let mut stray = TcpStream::connect(addr).expect("stray connects");
                stray.write_all(b"GET / HTTP/1.1\r\n\r\n").expect("stray writes");
                drop(stray);
                let worker = TcpTransport::worker(addr, Rank(1), 2, Duration::from_secs(5))
                    .expect("worker connects");
                worker
                    .send(COORDINATOR_RANK, 0, MessageTag::CONTROL, Message::TileRequest)
                    .expect("request");
            });
            let coordinator = TcpTransport::coordinator(listener, 2, Duration::from_secs(5))
                .expect("real worker joins");
            let request = coordinator
                .recv(ReceiveFilter::any(0), Some(Duration::from_secs(5)))
                .expect("request arrives");
            assert_eq!(request.source, Rank(1));
        });
    }

    #[test]
    fn watcher_can_stop_the_wait() {
        let (listener, _addr) = loopback();
        let mut polls = 0;
        let result = TcpTransport::coordinator_watching(listener, 2, Duration::from_secs(30), || {
            polls += 1;
            if polls > 3 {
                Err("worker exited".to_owned())
            } else {
                Ok(())
            }
        });
        assert_eq!(
            result.err(),
            Some(TransportError::AcceptAborted("worker exited".to_owned()))
        );
    }

    #[test]
    fn worker_gives_up_after_connect_timeout() {
        let (listener, addr) = loopback();
        drop(listener);
        let result = TcpTransport::worker(addr, Rank(1), 2, Duration::from_millis(120));
        assert!(matches!(result, Err(TransportError::Io { .. })));
    }
}
