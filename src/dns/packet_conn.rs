//! DNS packet channel
//!
//! Turns a UDP socket talking to a recursive resolver into a lossy packet
//! channel to the tunnel server.
//!
//! Upstream, every query carries at most one packet:
//!
//! ```text
//! client id (8) | 224+n | n random bytes | [len (1) | packet]
//! ```
//!
//! base32-encoded into the labels of a TXT query under the tunnel domain.
//! Downstream, a TXT answer carries zero or more packets, each prefixed with a
//! 2-byte big-endian length. The server can only answer queries, so the
//! client keeps polling with empty queries, backing off while idle.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use data_encoding::BASE32_NOPAD;
use log::{debug, trace, warn};
use rand::RngCore;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use super::message::{decode_txt, DnsMessage, RR_TYPE_TXT};
use super::{DnsError, DomainName, Result, MAX_LABEL_LEN};
use crate::transport::PacketConn;

/// Depth of the incoming and outgoing packet queues
pub const QUEUE_SIZE: usize = 128;

/// Random padding bytes in data-carrying queries
pub const NUM_PADDING: usize = 3;

/// Random padding bytes in otherwise empty polling queries; at most 31 since
/// padding prefixes start at 224
pub const NUM_PADDING_FOR_POLL: usize = 8;

/// Length bytes at or above this value mark padding, so packets must be
/// shorter
const PADDING_PREFIX: u8 = 224;

const INIT_POLL_DELAY: Duration = Duration::from_millis(500);
const MAX_POLL_DELAY: Duration = Duration::from_secs(10);
const POLL_DELAY_MULTIPLIER: u32 = 2;

/// Maximum outstanding poll permits granted by received packets
const POLL_LIMIT: usize = 16;

const MAX_RESPONSE_SIZE: usize = 4096;

/// Identifies this client's session to the server across queries
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub [u8; 8]);

impl ClientId {
    pub fn random() -> Self {
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Build the query name carrying `packet` (empty for a poll).
pub fn encode_query_name(
    client_id: &ClientId,
    packet: &[u8],
    domain: &DomainName,
) -> Result<DomainName> {
    if packet.len() >= PADDING_PREFIX as usize {
        return Err(DnsError::PacketTooLarge(
            packet.len(),
            PADDING_PREFIX as usize - 1,
        ));
    }

    let num_padding = if packet.is_empty() {
        NUM_PADDING_FOR_POLL
    } else {
        NUM_PADDING
    };

    let mut decoded = BytesMut::with_capacity(8 + 1 + num_padding + 1 + packet.len());
    decoded.put_slice(&client_id.0);
    decoded.put_u8(PADDING_PREFIX + num_padding as u8);
    let mut padding = [0u8; NUM_PADDING_FOR_POLL];
    rand::thread_rng().fill_bytes(&mut padding[..num_padding]);
    decoded.put_slice(&padding[..num_padding]);
    if !packet.is_empty() {
        decoded.put_u8(packet.len() as u8);
        decoded.put_slice(packet);
    }

    let encoded = BASE32_NOPAD.encode(&decoded).to_ascii_lowercase();
    let labels = encoded
        .as_bytes()
        .chunks(MAX_LABEL_LEN)
        .map(|chunk| chunk.to_vec())
        .collect();

    domain.with_prefix(labels)
}

/// Extract the downstream payload of a response, or `None` if the response
/// does not carry tunnel data for `domain`.
pub fn response_payload(response: &DnsMessage, domain: &DomainName) -> Option<Vec<u8>> {
    if !response.is_response() || response.rcode() != 0 {
        return None;
    }
    if response.answers.len() != 1 {
        return None;
    }
    let answer = &response.answers[0];
    answer.name.trim_suffix(domain)?;
    if answer.rtype != RR_TYPE_TXT {
        return None;
    }
    decode_txt(&answer.rdata).ok()
}

/// Split a downstream payload into its length-prefixed packets. A truncated
/// trailing packet is discarded.
pub fn split_packets(payload: &[u8]) -> Vec<Bytes> {
    let mut packets = Vec::new();
    let mut rest = payload;
    while rest.len() >= 2 {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            break;
        }
        packets.push(Bytes::copy_from_slice(&rest[..len]));
        rest = &rest[len..];
    }
    packets
}

/// Packet channel over DNS queries and responses
pub struct DnsPacketConn {
    client_id: ClientId,
    mtu: usize,
    outgoing: mpsc::Sender<Bytes>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DnsPacketConn {
    /// Start exchanging queries with `remote` over `socket`. Packets up to
    /// `mtu` bytes are accepted by `send`.
    pub fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        domain: DomainName,
        mtu: usize,
    ) -> Arc<Self> {
        let client_id = ClientId::random();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(QUEUE_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel(QUEUE_SIZE);
        let (poll_tx, poll_rx) = mpsc::channel(POLL_LIMIT);

        debug!(
            "DNS transport client {} → resolver {} for domain {}",
            client_id, remote, domain
        );

        let send_task = tokio::spawn(send_loop(
            Arc::clone(&socket),
            remote,
            domain.clone(),
            client_id,
            outgoing_rx,
            poll_rx,
        ));
        let recv_task = tokio::spawn(recv_loop(socket, domain, incoming_tx, poll_tx));

        Arc::new(Self {
            client_id,
            mtu: mtu.min(PADDING_PREFIX as usize - 1),
            outgoing: outgoing_tx,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            tasks: Mutex::new(vec![send_task, recv_task]),
            closed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "DNS transport closed")
    }
}

#[async_trait]
impl PacketConn for DnsPacketConn {
    async fn send(&self, packet: Bytes) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        if packet.len() > self.mtu {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                DnsError::PacketTooLarge(packet.len(), self.mtu),
            ));
        }
        match self.outgoing.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // the ordered transport above retransmits
                trace!("DNS transport outgoing queue full, dropping packet");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Self::closed_error()),
        }
    }

    async fn recv(&self) -> io::Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(Self::closed_error)
    }

    fn max_packet_size(&self) -> usize {
        self.mtu
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
        debug!("DNS transport client {} closed", self.client_id);
        Ok(())
    }
}

impl Drop for DnsPacketConn {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    domain: DomainName,
    client_id: ClientId,
    mut outgoing: mpsc::Receiver<Bytes>,
    mut poll_permits: mpsc::Receiver<()>,
) {
    let mut poll_delay = INIT_POLL_DELAY;
    let mut poll_deadline = Instant::now() + poll_delay;

    loop {
        let mut poll_timer_expired = false;

        // data first; poll only when nothing is queued
        let packet = match outgoing.try_recv() {
            Ok(packet) => Some(packet),
            Err(mpsc::error::TryRecvError::Disconnected) => return,
            Err(mpsc::error::TryRecvError::Empty) => {
                tokio::select! {
                    packet = outgoing.recv() => match packet {
                        Some(packet) => Some(packet),
                        None => return,
                    },
                    Some(()) = poll_permits.recv() => None,
                    _ = sleep_until(poll_deadline) => {
                        poll_timer_expired = true;
                        None
                    }
                }
            }
        };

        if packet.is_some() {
            // a data-carrying query displaces one pending poll
            let _ = poll_permits.try_recv();
        }

        if poll_timer_expired {
            poll_delay = (poll_delay * POLL_DELAY_MULTIPLIER).min(MAX_POLL_DELAY);
        } else {
            poll_delay = INIT_POLL_DELAY;
        }
        poll_deadline = Instant::now() + poll_delay;

        let payload = packet.unwrap_or_default();
        let name = match encode_query_name(&client_id, &payload, &domain) {
            Ok(name) => name,
            Err(e) => {
                warn!("DNS transport: dropping packet: {}", e);
                continue;
            }
        };
        let query = DnsMessage::new_txt_query(rand::random(), name).to_bytes();

        if let Err(e) = socket.send_to(&query, remote).await {
            // transient network errors must not kill the session
            debug!("DNS transport send to {}: {}", remote, e);
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    domain: DomainName,
    incoming: mpsc::Sender<Bytes>,
    poll_permits: mpsc::Sender<()>,
) {
    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];

    loop {
        let n = match socket.recv_from(&mut buf).await {
            Ok((n, _from)) => n,
            Err(e) => {
                debug!("DNS transport receive: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let response = match DnsMessage::parse(&buf[..n]) {
            Ok(response) => response,
            Err(e) => {
                debug!("DNS transport: cannot parse response: {}", e);
                continue;
            }
        };

        let Some(payload) = response_payload(&response, &domain) else {
            continue;
        };

        let packets = split_packets(&payload);
        let any = !packets.is_empty();
        for packet in packets {
            match incoming.try_send(packet) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("DNS transport incoming queue full, dropping packet");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }

        // more data is likely waiting on the server; poll again soon
        if any {
            let _ = poll_permits.try_send(());
        }
    }
}
