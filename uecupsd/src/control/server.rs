//! CUPS control transport
//!
//! A thin SCTP driver (via `sctp-proto`, SCTP over UDP) for the
//! control channel. The transport preserves message boundaries and
//! reports graceful shutdown, which is the framing contract the
//! control channel assumes: every received message is one complete
//! JSON PDU, every PDU is sent as one message on the single CUPS
//! stream.
//!
//! `sctp-proto` is sans-io: the server owns the UDP socket, feeds
//! received datagrams into the protocol state and pushes whatever
//! output falls due. One [`CupsServer::poll`] call performs one such
//! step and hands the resulting control events straight back to the
//! caller; there is no queue between the transport and the control
//! task.

use bytes::Bytes;
use sctp_proto::{
    Association, AssociationEvent, AssociationHandle, DatagramEvent, Endpoint, EndpointConfig,
    Event, Payload, PayloadProtocolIdentifier, ServerConfig, Transmit, TransportConfig,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, info, warn};

/// The one stream carrying CUPS PDUs in each direction.
const CUPS_STREAM: u16 = 0;

/// Upper bound on a single JSON PDU; commands are a few hundred bytes.
const MAX_PDU_SIZE: u32 = 8192;

/// Receive buffer for SCTP-over-UDP datagrams.
const RECV_BUF_SIZE: usize = 65536;

/// Transport errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// No connected client with this ID
    #[error("client not found: {0}")]
    ClientNotFound(u64),
    /// The association refused the outgoing PDU
    #[error("send error: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Control-channel activity produced by one poll step.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A control client connected
    ClientConnected {
        /// Client ID
        client_id: u64,
        /// Remote address
        remote_addr: SocketAddr,
    },
    /// A control client disconnected (shutdown or association loss)
    ClientClosed {
        /// Client ID
        client_id: u64,
        /// Transport-level reason
        reason: String,
    },
    /// One complete PDU arrived
    Pdu {
        /// Originating client
        client_id: u64,
        /// The PDU bytes
        data: Bytes,
    },
}

/// One accepted control connection.
struct Client {
    id: u64,
    assoc: Association,
}

/// SCTP control-channel server.
pub struct CupsServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    endpoint: Endpoint,
    clients: HashMap<AssociationHandle, Client>,
    by_id: HashMap<u64, AssociationHandle>,
    next_id: u64,
    /// Datagrams owed to the socket, from any association or the
    /// endpoint itself.
    outbox: Vec<Transmit>,
}

impl CupsServer {
    /// Bind the control channel.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        info!("CUPS control channel listening on {} (SCTP over UDP)", local_addr);

        // One stream per direction is all the PDU protocol needs.
        let transport = TransportConfig::default()
            .with_max_num_inbound_streams(1)
            .with_max_num_outbound_streams(1)
            .with_max_message_size(MAX_PDU_SIZE);
        let mut server_config = ServerConfig::new();
        server_config.transport = Arc::new(transport);

        let endpoint = Endpoint::new(
            Arc::new(EndpointConfig::new()),
            Some(Arc::new(server_config)),
        );

        Ok(Self {
            socket,
            local_addr,
            endpoint,
            clients: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            outbox: Vec::new(),
        })
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get number of connected clients
    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Wait up to `wait` for channel activity and return the control
    /// events it produced. A timeout fires due association timers
    /// (retransmits, heartbeats) instead and returns an empty list.
    pub async fn poll(&mut self, wait: Duration) -> Result<Vec<ControlEvent>> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                let received =
                    self.endpoint
                        .handle(Instant::now(), from, None, None, Bytes::from(buf));
                match received {
                    Some((handle, DatagramEvent::NewAssociation(assoc))) => {
                        self.accept(handle, assoc, from, &mut events);
                    }
                    Some((handle, DatagramEvent::AssociationEvent(event))) => {
                        self.drive(handle, Some(event), &mut events);
                    }
                    None => {}
                }
            }
            Ok(Err(e)) => return Err(ServerError::Io(e)),
            Err(_) => self.service_timers(&mut events),
        }

        self.flush().await?;
        Ok(events)
    }

    /// Register a fresh association.
    fn accept(
        &mut self,
        handle: AssociationHandle,
        assoc: Association,
        remote_addr: SocketAddr,
        events: &mut Vec<ControlEvent>,
    ) {
        let client_id = self.next_id;
        self.next_id += 1;

        info!(client = client_id, remote = %remote_addr, "accepted CUPS connection");
        self.clients.insert(handle, Client {
            id: client_id,
            assoc,
        });
        self.by_id.insert(client_id, handle);

        events.push(ControlEvent::ClientConnected {
            client_id,
            remote_addr,
        });
        self.drive(handle, None, events);
    }

    /// Feed one transport event (if any) into an association and
    /// collect whatever PDUs, state changes and outgoing datagrams
    /// fall out of it.
    fn drive(
        &mut self,
        handle: AssociationHandle,
        event: Option<AssociationEvent>,
        events: &mut Vec<ControlEvent>,
    ) {
        let Some(client) = self.clients.get_mut(&handle) else {
            return;
        };
        if let Some(event) = event {
            client.assoc.handle_event(event);
        }

        let mut lost = None;
        while let Some(ev) = client.assoc.poll() {
            match ev {
                Event::Connected => {
                    debug!(client = client.id, "association established");
                }
                Event::AssociationLost { reason } => {
                    lost = Some(reason.to_string());
                }
                Event::Stream(_) | Event::DatagramReceived => {
                    // Message-oriented delivery: every readable chunk
                    // set is one complete PDU.
                    while let Some(mut stream) = client.assoc.accept_stream() {
                        if let Ok(Some(chunks)) = stream.read() {
                            let mut pdu = vec![0u8; chunks.len()];
                            if !pdu.is_empty() && chunks.read(&mut pdu).is_ok() {
                                events.push(ControlEvent::Pdu {
                                    client_id: client.id,
                                    data: Bytes::from(pdu),
                                });
                            }
                        }
                    }
                }
            }
        }

        while let Some(transmit) = client.assoc.poll_transmit(Instant::now()) {
            self.outbox.push(transmit);
        }

        if let Some(reason) = lost {
            let client_id = client.id;
            self.clients.remove(&handle);
            self.by_id.remove(&client_id);
            warn!(client = client_id, reason = %reason, "CUPS connection lost");
            events.push(ControlEvent::ClientClosed { client_id, reason });
        }
    }

    /// Fire due association timers while the socket is idle. Timer
    /// expiry can kill an association, so the affected clients are
    /// driven like any other activity.
    fn service_timers(&mut self, events: &mut Vec<ControlEvent>) {
        let now = Instant::now();
        let due: Vec<AssociationHandle> = self
            .clients
            .iter_mut()
            .filter_map(|(handle, client)| {
                let fired = client.assoc.poll_timeout().is_some_and(|t| now >= t);
                if fired {
                    client.assoc.handle_timeout(now);
                    Some(*handle)
                } else {
                    None
                }
            })
            .collect();

        for handle in due {
            self.drive(handle, None, events);
        }
    }

    /// Push queued protocol output onto the socket.
    async fn flush(&mut self) -> Result<()> {
        while let Some(transmit) = self.endpoint.poll_transmit() {
            self.outbox.push(transmit);
        }
        for transmit in self.outbox.drain(..) {
            // RawEncode is the only payload kind queued for output.
            if let Payload::RawEncode(chunks) = &transmit.payload {
                for chunk in chunks {
                    self.socket.send_to(chunk, transmit.remote).await?;
                }
            }
        }
        Ok(())
    }

    /// Send one PDU to a client as a single message on the CUPS stream.
    pub async fn send(&mut self, client_id: u64, data: &[u8]) -> Result<()> {
        let handle = *self
            .by_id
            .get(&client_id)
            .ok_or(ServerError::ClientNotFound(client_id))?;
        let client = self
            .clients
            .get_mut(&handle)
            .ok_or(ServerError::ClientNotFound(client_id))?;

        let ppi = PayloadProtocolIdentifier::Unknown;
        let mut stream = client
            .assoc
            .open_stream(CUPS_STREAM, ppi)
            .map_err(|e| ServerError::Send(e.to_string()))?;
        stream
            .write_with_ppi(data, ppi)
            .map_err(|e| ServerError::Send(e.to_string()))?;

        debug!(client = client_id, len = data.len(), "queued PDU");
        while let Some(transmit) = client.assoc.poll_transmit(Instant::now()) {
            self.outbox.push(transmit);
        }
        self.flush().await
    }

    /// Close every association on shutdown.
    pub fn stop(&mut self) {
        info!("stopping CUPS control channel on {}", self.local_addr);
        for (_, mut client) in self.clients.drain() {
            let _ = client.assoc.close();
        }
        self.by_id.clear();
    }
}
