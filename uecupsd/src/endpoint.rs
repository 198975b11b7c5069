//! GTP endpoint decap worker (downlink, GTP→TUN)
//!
//! One worker task per endpoint reads datagrams from the UDP socket in
//! a tight loop. Malformed headers and TEID lookup misses are logged
//! and dropped; fatal socket errors and short TUN writes terminate the
//! process, which prefers crashing over corrupting the data path.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use uecups_gtp::Gtp1Header;

use crate::registry::Registry;

/// Receive buffer: an MTU-bounded user packet plus the GTP1-U header.
const MAX_UDP_PACKET: usize = 65535;

/// Bind the endpoint's UDP socket.
///
/// The socket is created with the blocking std API so endpoint
/// creation can run under the registry writer lock, then handed to the
/// tokio reactor.
pub(crate) fn bind_socket(bind_addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(bind_addr)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Spawn the decap worker for one endpoint.
pub(crate) fn spawn_decap_worker(
    registry: Arc<Registry>,
    name: String,
    bind_addr: SocketAddr,
    socket: Arc<UdpSocket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_UDP_PACKET + Gtp1Header::SIZE];

        loop {
            // 1) read one GTP packet from the UDP socket
            let nread = match socket.recv_from(&mut buf).await {
                Ok((n, _src)) => n,
                Err(e) => {
                    error!(endpoint = %name, error = %e, "fatal error reading from UDP socket");
                    std::process::exit(1);
                }
            };

            // 2) validate the GTP1-U header
            let header = match Gtp1Header::decode(&buf[..nread]) {
                Ok(h) => h,
                Err(e) => {
                    warn!(endpoint = %name, error = %e, "dropping GTP packet");
                    continue;
                }
            };

            // 3) look up the tunnel by (TEID, this endpoint); snapshot
            // the TUN handle under the reader lock
            let Some(tun) = registry.downlink_tun(bind_addr, header.teid) else {
                warn!(
                    endpoint = %name,
                    teid = format_args!("{:#010x}", header.teid),
                    "no tunnel for TEID, dropping packet"
                );
                continue;
            };

            // 4) write the inner payload to the TUN device
            let payload = header.payload(&buf[..nread]);
            match tun.send(payload).await {
                Ok(written) if written == payload.len() => {
                    trace!(
                        endpoint = %name,
                        teid = format_args!("{:#010x}", header.teid),
                        len = payload.len(),
                        "forwarded downlink packet"
                    );
                }
                Ok(written) => {
                    error!(
                        endpoint = %name,
                        written,
                        expected = payload.len(),
                        "short write to TUN device"
                    );
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(endpoint = %name, error = %e, "error writing to TUN device");
                    std::process::exit(1);
                }
            }
        }
    })
}
