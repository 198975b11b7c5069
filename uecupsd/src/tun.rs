//! TUN device handling and encap worker (uplink, TUN→GTP)
//!
//! Device allocation optionally happens inside a named network
//! namespace; the namespace switch is scoped by a guard and contains no
//! await point. One worker task per device reads whole L3 frames into a
//! buffer that reserves headroom for the GTP1-U header, so the header
//! is built in place and the packet sent with a single `send_to`.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};
use tun_rs::{AsyncDevice, DeviceBuilder};

use uecups_gtp::Gtp1Header;

use crate::netns::{self, NetnsError};
use crate::registry::{Registry, TunId};

/// Per-frame read buffer; larger than any configured MTU.
const TUN_RECV_BUFFER_SIZE: usize = 8000;

/// TUN device errors
#[derive(Debug, Error)]
pub enum TunError {
    /// Device allocation failed
    #[error("failed to create TUN device '{name}': {reason}")]
    CreateFailed {
        /// Requested device name
        name: String,
        /// Error text from the TUN layer
        reason: String,
    },
    /// Namespace entry/restore failed
    #[error(transparent)]
    Netns(#[from] NetnsError),
}

/// Allocate a TUN device, optionally inside a named namespace.
///
/// The namespace is entered before the device is opened and restored
/// when the guard drops, on every exit path.
pub(crate) fn open_device(
    name: &str,
    netns_name: Option<&str>,
    mtu: u16,
) -> Result<AsyncDevice, TunError> {
    let _ns_guard = match netns_name {
        Some(ns) => Some(netns::enter(ns)?),
        None => None,
    };

    let device = DeviceBuilder::new()
        .name(name)
        .mtu(mtu)
        .build_async()
        .map_err(|e| TunError::CreateFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    info!(tun = %name, netns = ?netns_name, mtu, "TUN device opened");
    Ok(device)
}

/// Spawn the encap worker for one TUN device.
pub(crate) fn spawn_encap_worker(
    registry: Arc<Registry>,
    tun_id: TunId,
    name: String,
    device: Arc<AsyncDevice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; Gtp1Header::SIZE + TUN_RECV_BUFFER_SIZE];

        loop {
            // 1) read one L3 frame, keeping headroom for the header
            let nread = match device.recv(&mut buf[Gtp1Header::SIZE..]).await {
                Ok(0) => {
                    info!(tun = %name, "TUN device closed (EOF)");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!(tun = %name, error = %e, "fatal error reading from TUN device");
                    std::process::exit(1);
                }
            };

            // 2) the single tunnel bound to this device
            let Some(path) = registry.uplink_path(tun_id) else {
                warn!(tun = %name, "no tunnel bound to TUN device, dropping frame");
                continue;
            };

            // 3) build the GTP1-U header in the reserved prefix
            let header = match Gtp1Header::g_pdu(path.tx_teid, nread) {
                Ok(h) => h,
                Err(e) => {
                    warn!(tun = %name, error = %e, "dropping oversized frame");
                    continue;
                }
            };
            header.write_into(&mut buf);

            // 4) send through the tunnel's endpoint socket
            let packet = &buf[..Gtp1Header::SIZE + nread];
            match path.socket.send_to(packet, path.remote).await {
                Ok(sent) if sent == packet.len() => {
                    trace!(
                        tun = %name,
                        teid = format_args!("{:#010x}", path.tx_teid),
                        len = nread,
                        "forwarded uplink frame"
                    );
                }
                Ok(sent) => {
                    warn!(
                        tun = %name,
                        sent,
                        expected = packet.len(),
                        "short send, dropping frame"
                    );
                }
                Err(e) => {
                    warn!(tun = %name, error = %e, "send failed, dropping frame");
                }
            }
        }
    })
}
