//! UDP socket layer managing incoming/outgoing requests and responses.

mod inflight_requests;

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    messages::{ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific, VERSION},
    Id,
};

use super::config::{Config, DEFAULT_PORT};
use inflight_requests::{backoff, InflightRequest, InflightRequests};

/// Largest payload of a UDP datagram over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;
/// Datagrams waiting for the processing thread before new ones are dropped.
const INBOUND_QUEUE_SIZE: usize = 1024;
/// How often the I/O thread checks whether the socket was dropped.
const IO_THREAD_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// The maximum duration to block waiting for an inbound datagram.
/// Lower values increases CPU usage, but reduces latency of commands and timers.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A UdpSocket wrapper that formats and correlates DHT requests and responses.
///
/// Datagrams are received on a dedicated I/O thread and handed over through a bounded channel.
#[derive(Debug)]
pub struct KrpcSocket {
    next_tid: u32,
    socket: UdpSocket,
    local_addr: SocketAddr,
    inbound: flume::Receiver<(Vec<u8>, SocketAddr)>,
    running: Arc<AtomicBool>,
    inflight_requests: InflightRequests,
    /// Requests that failed to send, reported on the next [Self::tick].
    failed_to_send: Vec<FailedRequest>,
    request_timeout: Duration,
    max_retries: u8,
}

#[derive(Debug, Clone, PartialEq)]
/// A request that was retransmitted [Config::max_retries] times without response,
/// or could not be sent at all.
pub struct FailedRequest {
    pub transaction_id: u32,
    pub to: SocketAddr,
    pub node_id: Option<Id>,
}

impl KrpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let bind_address = config.bind_address;

        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddr::new(bind_address, port))?
        } else {
            match UdpSocket::bind(SocketAddr::new(bind_address, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::new(bind_address, 0)),
            }?
        };

        let local_addr = socket.local_addr()?;

        let receiver = socket.try_clone()?;
        receiver.set_read_timeout(Some(IO_THREAD_READ_TIMEOUT))?;

        let (sender, inbound) = flume::bounded(INBOUND_QUEUE_SIZE);
        let running = Arc::new(AtomicBool::new(true));

        let io_running = running.clone();
        thread::Builder::new()
            .name(format!("kadnode-io-{}", local_addr.port()))
            .spawn(move || run_io(receiver, sender, io_running))?;

        Ok(Self {
            next_tid: 0,
            socket,
            local_addr,
            inbound,
            running,
            inflight_requests: InflightRequests::new(),
            failed_to_send: vec![],
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
        })
    }

    #[cfg(test)]
    pub(crate) fn client() -> Result<Self, std::io::Error> {
        Self::new(&Config {
            bind_address: std::net::Ipv4Addr::LOCALHOST.into(),
            port: Some(0),
            ..Default::default()
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns true if this transaction_id is still inflight.
    pub fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight_requests.contains(transaction_id)
    }

    /// Returns true if a request to this address is awaiting a response.
    pub fn awaiting(&self, address: SocketAddr) -> bool {
        self.inflight_requests.contains_address(&address)
    }

    /// Number of requests awaiting a response.
    pub fn inflight_count(&self) -> usize {
        self.inflight_requests.len()
    }

    /// Returns true if this request couldn't be sent at all, and wasn't reported yet.
    pub fn send_failed(&self, transaction_id: u32) -> bool {
        self.failed_to_send
            .iter()
            .any(|request| request.transaction_id == transaction_id)
    }

    // === Public Methods ===

    /// Send a request to the given address and return the transaction_id.
    ///
    /// If the request can't be sent, it is reported as failed on the next [Self::tick],
    /// see [Self::send_failed].
    pub fn request(
        &mut self,
        address: SocketAddr,
        node_id: Option<Id>,
        request: RequestSpecific,
    ) -> u32 {
        let transaction_id = self.tid();

        let message = Message {
            transaction_id,
            version: Some(VERSION),
            message_type: MessageType::Request(request),
        };

        let failed = FailedRequest {
            transaction_id,
            to: address,
            node_id,
        };

        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(?error, "Error encoding request message");
                self.failed_to_send.push(failed);
                return transaction_id;
            }
        };

        if let Err(error) = self.send_bytes(&bytes, address) {
            debug!(?error, ?address, "Error sending request message");
            self.failed_to_send.push(failed);
            return transaction_id;
        }

        trace!(context = "socket_message_sending", ?message);

        let now = Instant::now();
        self.inflight_requests.add(InflightRequest {
            transaction_id,
            to: address,
            node_id,
            bytes: bytes.into(),
            attempts: 0,
            deadline: now + self.request_timeout,
        });

        transaction_id
    }

    /// Send a response to the given address.
    pub fn response(&mut self, address: SocketAddr, transaction_id: u32, response: ResponseSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION),
            message_type: MessageType::Response(response),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddr, transaction_id: u32, error: ErrorSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION),
            message_type: MessageType::Error(error),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Forget an inflight request, a late response to it will be dropped.
    pub fn cancel(&mut self, transaction_id: u32) {
        self.inflight_requests.cancel(transaction_id);
    }

    /// Retransmit requests past their deadline, and return the ones that failed permanently.
    pub fn tick(&mut self) -> Vec<FailedRequest> {
        let (retry, failed) = self.inflight_requests.expired(
            Instant::now(),
            self.request_timeout,
            self.max_retries,
        );

        for request in retry {
            trace!(
                context = "socket_retransmit",
                tid = request.transaction_id,
                to = ?request.to,
                attempt = request.attempts,
                next_timeout = ?backoff(self.request_timeout, request.attempts),
            );

            if let Err(error) = self.send_bytes(&request.bytes, request.to) {
                debug!(?error, to = ?request.to, "Error retransmitting request");
            }
        }

        let mut failed_requests = std::mem::take(&mut self.failed_to_send);

        failed_requests.extend(failed.into_iter().map(|request| FailedRequest {
            transaction_id: request.transaction_id,
            to: request.to,
            node_id: request.node_id,
        }));

        failed_requests
    }

    /// Receives a single krpc message, waiting up to [MAX_THREAD_BLOCK_DURATION].
    ///
    /// Requests are always returned, responses and errors only if they match an inflight request.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddr)> {
        let (bytes, from) = self.inbound.recv_timeout(MAX_THREAD_BLOCK_DURATION).ok()?;

        self.handle_datagram(&bytes, from)
    }

    /// Same as [Self::recv_from] without blocking.
    pub fn try_recv_from(&mut self) -> Option<(Message, SocketAddr)> {
        loop {
            let (bytes, from) = self.inbound.try_recv().ok()?;

            if let Some(message) = self.handle_datagram(&bytes, from) {
                return Some(message);
            }
        }
    }

    // === Private Methods ===

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Option<(Message, SocketAddr)> {
        if from.port() == 0 {
            trace!(
                context = "socket_validation",
                message = "Response from port 0"
            );
            return None;
        }

        match Message::from_bytes(bytes) {
            Ok(message) => {
                let should_return = match message.message_type {
                    MessageType::Request(_) => {
                        trace!(
                            context = "socket_message_receiving",
                            ?message,
                            ?from,
                            "Received request message"
                        );
                        true
                    }
                    MessageType::Response(_) | MessageType::Error(_) => {
                        trace!(
                            context = "socket_message_receiving",
                            ?message,
                            ?from,
                            "Received response message"
                        );
                        self.is_expected_response(&message, &from)
                    }
                };

                if should_return {
                    return Some((message, from));
                }
            }
            Err(error) => {
                debug!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid message."
                );
            }
        }

        None
    }

    fn is_expected_response(&mut self, message: &Message, from: &SocketAddr) -> bool {
        if self
            .inflight_requests
            .remove(message.transaction_id, from)
            .is_some()
        {
            return true;
        }

        trace!(
            context = "socket_validation",
            tid = message.transaction_id,
            ?from,
            message = "Unexpected or duplicate response"
        );

        false
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    /// Send a raw dht message
    fn send(&mut self, address: SocketAddr, message: Message) -> Result<(), SendMessageError> {
        self.send_bytes(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", message = ?message);
        Ok(())
    }

    fn send_bytes(&self, bytes: &[u8], address: SocketAddr) -> Result<(), SendMessageError> {
        // No route between address families on a socket bound to one of them.
        if address.is_ipv4() != self.local_addr.is_ipv4() {
            return Err(SendMessageError::NetworkUnreachable);
        }

        self.socket.send_to(bytes, address)?;
        Ok(())
    }
}

impl Drop for KrpcSocket {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Receive datagrams until the socket is dropped.
fn run_io(socket: UdpSocket, sender: flume::Sender<(Vec<u8>, SocketAddr)>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((amt, from)) => match sender.try_send((buf[..amt].to_vec(), from)) {
                Ok(_) => {}
                Err(flume::TrySendError::Full(_)) => {
                    trace!(context = "socket_error", ?from, "Inbound queue full, dropping datagram");
                }
                Err(flume::TrySendError::Disconnected(_)) => break,
            },
            Err(ref e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
            }
        }
    }

    trace!(context = "socket_io_thread", "Shutting down I/O thread");
}

#[derive(thiserror::Error, Debug)]
/// Errors sending a message.
pub enum SendMessageError {
    /// Errors related to encoding DHT messages.
    #[error("Failed to encode packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(std::io::Error),
}

impl From<std::io::Error> for SendMessageError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::AddrNotAvailable
            | ErrorKind::NetworkDown => SendMessageError::NetworkUnreachable,
            _ => SendMessageError::IO(error),
        }
    }
}
