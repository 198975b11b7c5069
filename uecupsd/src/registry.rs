//! Tunnel registry
//!
//! Holds the three entity tables (GTP endpoints, TUN devices, tunnels)
//! with their lookup indexes and reference counts behind one
//! process-wide multi-reader/single-writer lock.
//!
//! Structural mutations (create/destroy/reset) happen only on the
//! control task. Worker tasks take the reader side per packet, snapshot
//! the handle they need and release the lock before any I/O; the
//! refcount invariants guarantee the snapshot stays valid for the
//! write that follows.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tun_rs::AsyncDevice;

use crate::endpoint;
use crate::tun::{self, TunError};

/// Registry handle of a GTP endpoint.
pub type EndpointId = u64;
/// Registry handle of a TUN device.
pub type TunId = u64;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A tunnel with the same (local endpoint, rx TEID) pair exists
    #[error("tunnel already exists: {local}, rx_teid={rx_teid:#x}")]
    AlreadyExists {
        /// Local endpoint bind address
        local: SocketAddr,
        /// Receive TEID
        rx_teid: u32,
    },
    /// No tunnel with the given (local endpoint, rx TEID) pair
    #[error("tunnel not found: {local}, rx_teid={rx_teid:#x}")]
    TunnelNotFound {
        /// Local endpoint bind address
        local: SocketAddr,
        /// Receive TEID
        rx_teid: u32,
    },
    /// UDP socket creation/bind failed
    #[error("cannot bind GTP endpoint {addr}: {source}")]
    Socket {
        /// Requested bind address
        addr: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },
    /// TUN device creation failed
    #[error(transparent)]
    Tun(#[from] TunError),
}

/// Parameters of one tunnel, as carried by `create_tun`.
#[derive(Debug, Clone)]
pub struct TunnelParams {
    /// Local GTP endpoint bind address
    pub local_udp: SocketAddr,
    /// Remote GTP endpoint uplink traffic is sent to
    pub remote_udp: SocketAddr,
    /// L3 address assigned to the UE
    pub user_addr: IpAddr,
    /// TEID selecting this tunnel on the local endpoint
    pub rx_teid: u32,
    /// TEID placed in encapsulated uplink packets
    pub tx_teid: u32,
    /// TUN device name
    pub tun_name: String,
    /// Network namespace of the TUN device
    pub tun_netns_name: Option<String>,
}

/// A UDP socket bound to a local GTP address, shared by the tunnels
/// that use it and read by one decap worker.
pub struct GtpEndpoint {
    /// Registry handle
    pub id: EndpointId,
    /// Display name, `"ip:port"` of the bind address
    pub name: String,
    /// Requested bind address (full-address equality key)
    pub bind_addr: SocketAddr,
    /// The bound socket
    pub socket: Arc<UdpSocket>,
    /// Number of live tunnels referencing this endpoint
    pub use_count: usize,
    worker: JoinHandle<()>,
}

/// A TUN device, optionally inside a network namespace, read by one
/// encap worker.
pub struct TunDevice {
    /// Registry handle
    pub id: TunId,
    /// Kernel device name
    pub name: String,
    /// Namespace the device was opened in
    pub netns_name: Option<String>,
    /// The open device
    pub device: Arc<AsyncDevice>,
    /// Number of live tunnels referencing this device
    pub use_count: usize,
    worker: Option<JoinHandle<()>>,
}

impl TunDevice {
    /// Wrap an already-open device.
    ///
    /// Used by [`Registry::tun_find_or_create`] after allocating the
    /// device in the target namespace, and by tests that inject a
    /// datagram-socket-backed device.
    pub fn new(
        name: impl Into<String>,
        netns_name: Option<String>,
        device: AsyncDevice,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            netns_name,
            device: Arc::new(device),
            use_count: 0,
            worker: None,
        }
    }
}

/// The binding between `(local endpoint, rx TEID)` and
/// `(TUN device, user addr, remote endpoint, tx TEID)`.
pub struct GtpTunnel {
    /// Owned reference to the endpoint
    pub endpoint_id: EndpointId,
    /// Owned reference to the TUN device
    pub tun_id: TunId,
    /// Local endpoint bind address (half of the tunnel key)
    pub local_udp: SocketAddr,
    /// Remote UDP endpoint for uplink
    pub remote_udp: SocketAddr,
    /// Address assigned to the UE
    pub user_addr: IpAddr,
    /// Receive TEID (half of the tunnel key)
    pub rx_teid: u32,
    /// Transmit TEID
    pub tx_teid: u32,
}

/// Snapshot handed to the encap worker for one uplink frame.
pub struct UplinkPath {
    /// Endpoint socket to send through
    pub socket: Arc<UdpSocket>,
    /// Destination of the encapsulated packet
    pub remote: SocketAddr,
    /// TEID to place in the header
    pub tx_teid: u32,
}

#[derive(Default)]
struct RegistryInner {
    endpoints: HashMap<EndpointId, GtpEndpoint>,
    endpoint_by_addr: HashMap<SocketAddr, EndpointId>,
    tun_devices: HashMap<TunId, TunDevice>,
    tun_by_key: HashMap<(String, Option<String>), TunId>,
    tunnels: HashMap<(SocketAddr, u32), GtpTunnel>,
    next_endpoint_id: EndpointId,
    next_tun_id: TunId,
}

impl RegistryInner {
    /// Drop one endpoint reference; tear the endpoint down at zero.
    fn release_endpoint(&mut self, id: EndpointId) {
        let Some(ep) = self.endpoints.get_mut(&id) else {
            return;
        };
        ep.use_count -= 1;
        if ep.use_count == 0 {
            if let Some(ep) = self.endpoints.remove(&id) {
                self.endpoint_by_addr.remove(&ep.bind_addr);
                ep.worker.abort();
                info!(endpoint = %ep.name, "destroying GTP endpoint");
            }
        } else {
            debug!(endpoint = %ep.name, use_count = ep.use_count, "released endpoint reference");
        }
    }

    /// Drop one TUN reference; tear the device down at zero.
    fn release_tun(&mut self, id: TunId) {
        let Some(dev) = self.tun_devices.get_mut(&id) else {
            return;
        };
        dev.use_count -= 1;
        if dev.use_count == 0 {
            if let Some(dev) = self.tun_devices.remove(&id) {
                self.tun_by_key
                    .remove(&(dev.name.clone(), dev.netns_name.clone()));
                if let Some(worker) = dev.worker {
                    worker.abort();
                }
                info!(tun = %dev.name, "destroying TUN device");
            }
        } else {
            debug!(tun = %dev.name, use_count = dev.use_count, "released TUN reference");
        }
    }

    /// Unlink one tunnel and release its entity references.
    fn unlink_tunnel(&mut self, key: (SocketAddr, u32)) -> bool {
        let Some(t) = self.tunnels.remove(&key) else {
            return false;
        };
        info!(
            local = %t.local_udp,
            rx_teid = format_args!("{:#x}", t.rx_teid),
            "destroying tunnel"
        );
        self.release_endpoint(t.endpoint_id);
        self.release_tun(t.tun_id);
        true
    }
}

/// The tunnel registry. Shared as `Arc<Registry>` between the control
/// task (writer) and the data-plane workers (readers).
pub struct Registry {
    inner: RwLock<RegistryInner>,
    tun_mtu: u16,
}

impl Registry {
    /// Create an empty registry. `tun_mtu` is applied to TUN devices
    /// the registry allocates.
    pub fn new(tun_mtu: u16) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(RegistryInner::default()),
            tun_mtu,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the endpoint bound to `bind_addr` and take a reference on
    /// it, or bind a new socket and spawn its decap worker.
    ///
    /// Control-task only, like every structural mutation.
    pub fn endpoint_find_or_create(
        self: &Arc<Self>,
        bind_addr: SocketAddr,
    ) -> Result<EndpointId, RegistryError> {
        let mut inner = self.write();

        if let Some(&id) = inner.endpoint_by_addr.get(&bind_addr) {
            if let Some(ep) = inner.endpoints.get_mut(&id) {
                ep.use_count += 1;
                debug!(endpoint = %ep.name, use_count = ep.use_count, "reusing endpoint");
                return Ok(id);
            }
        }

        let socket = endpoint::bind_socket(bind_addr)
            .map_err(|e| RegistryError::Socket {
                addr: bind_addr,
                source: e,
            })?;
        let socket = Arc::new(socket);
        let name = bind_addr.to_string();

        let id = inner.next_endpoint_id;
        inner.next_endpoint_id += 1;

        let worker = endpoint::spawn_decap_worker(
            Arc::clone(self),
            name.clone(),
            bind_addr,
            Arc::clone(&socket),
        );

        info!(endpoint = %name, "created GTP endpoint");
        inner.endpoints.insert(
            id,
            GtpEndpoint {
                id,
                name,
                bind_addr,
                socket,
                use_count: 1,
                worker,
            },
        );
        inner.endpoint_by_addr.insert(bind_addr, id);

        Ok(id)
    }

    /// Find the TUN device `(name, netns)` and take a reference on it,
    /// or allocate the device inside the namespace and spawn its encap
    /// worker.
    pub fn tun_find_or_create(
        self: &Arc<Self>,
        name: &str,
        netns_name: Option<&str>,
    ) -> Result<TunId, RegistryError> {
        {
            let mut inner = self.write();
            let key = (name.to_string(), netns_name.map(str::to_string));
            if let Some(&id) = inner.tun_by_key.get(&key) {
                if let Some(dev) = inner.tun_devices.get_mut(&id) {
                    dev.use_count += 1;
                    debug!(tun = %dev.name, use_count = dev.use_count, "reusing TUN device");
                    return Ok(id);
                }
            }
        }

        // Device allocation enters the target namespace; keep it
        // outside the lock scope (it is still control-task only, so no
        // competing writer can interleave).
        let device = tun::open_device(name, netns_name, self.tun_mtu)?;
        let dev = TunDevice::new(name, netns_name.map(str::to_string), device);
        let id = self.tun_register(dev);

        let mut inner = self.write();
        if let Some(dev) = inner.tun_devices.get_mut(&id) {
            dev.use_count += 1;
        }
        Ok(id)
    }

    /// Insert an already-open TUN device and spawn its encap worker.
    /// The device starts unreferenced; tunnels take references through
    /// [`Registry::tunnel_create`].
    pub fn tun_register(self: &Arc<Self>, mut dev: TunDevice) -> TunId {
        let mut inner = self.write();
        let id = inner.next_tun_id;
        inner.next_tun_id += 1;
        dev.id = id;
        dev.worker = Some(tun::spawn_encap_worker(
            Arc::clone(self),
            id,
            dev.name.clone(),
            Arc::clone(&dev.device),
        ));
        info!(tun = %dev.name, netns = ?dev.netns_name, "registered TUN device");
        inner
            .tun_by_key
            .insert((dev.name.clone(), dev.netns_name.clone()), id);
        inner.tun_devices.insert(id, dev);
        id
    }

    /// Create a tunnel: acquire endpoint and TUN references, then
    /// insert under the `(local endpoint, rx TEID)` uniqueness check.
    /// A duplicate pair is an error, not an idempotent no-op; the
    /// freshly acquired references are released before failing.
    pub fn tunnel_create(self: &Arc<Self>, params: TunnelParams) -> Result<(), RegistryError> {
        let endpoint_id = self.endpoint_find_or_create(params.local_udp)?;
        let tun_id = match self.tun_find_or_create(
            &params.tun_name,
            params.tun_netns_name.as_deref(),
        ) {
            Ok(id) => id,
            Err(e) => {
                self.write().release_endpoint(endpoint_id);
                return Err(e);
            }
        };

        let mut inner = self.write();
        let key = (params.local_udp, params.rx_teid);
        if inner.tunnels.contains_key(&key) {
            inner.release_endpoint(endpoint_id);
            inner.release_tun(tun_id);
            return Err(RegistryError::AlreadyExists {
                local: params.local_udp,
                rx_teid: params.rx_teid,
            });
        }

        info!(
            local = %params.local_udp,
            rx_teid = format_args!("{:#x}", params.rx_teid),
            tx_teid = format_args!("{:#x}", params.tx_teid),
            remote = %params.remote_udp,
            user_addr = %params.user_addr,
            tun = %params.tun_name,
            "created tunnel"
        );
        inner.tunnels.insert(
            key,
            GtpTunnel {
                endpoint_id,
                tun_id,
                local_udp: params.local_udp,
                remote_udp: params.remote_udp,
                user_addr: params.user_addr,
                rx_teid: params.rx_teid,
                tx_teid: params.tx_teid,
            },
        );
        Ok(())
    }

    /// Destroy the tunnel identified by `(local endpoint, rx TEID)`.
    /// Releasing its references may cascade into endpoint/TUN teardown.
    pub fn tunnel_destroy(&self, local: SocketAddr, rx_teid: u32) -> Result<(), RegistryError> {
        let mut inner = self.write();
        if inner.unlink_tunnel((local, rx_teid)) {
            Ok(())
        } else {
            Err(RegistryError::TunnelNotFound { local, rx_teid })
        }
    }

    /// Destroy every tunnel. The endpoint and TUN lists drain through
    /// the refcount cascade.
    pub fn reset_all(&self) {
        let mut inner = self.write();
        let keys: Vec<(SocketAddr, u32)> = inner.tunnels.keys().copied().collect();
        for key in keys {
            inner.unlink_tunnel(key);
        }
    }

    /// Downlink lookup: the TUN device of the tunnel selected by this
    /// endpoint's bind address and the received TEID. Snapshot taken
    /// under the reader lock; the caller performs the write after the
    /// lock is released.
    pub fn downlink_tun(&self, local_bind: SocketAddr, teid: u32) -> Option<Arc<AsyncDevice>> {
        let inner = self.read();
        let tunnel = inner.tunnels.get(&(local_bind, teid))?;
        inner
            .tun_devices
            .get(&tunnel.tun_id)
            .map(|dev| Arc::clone(&dev.device))
    }

    /// Uplink lookup: socket, remote address and tx TEID of the tunnel
    /// bound to this TUN device (one active tunnel per device).
    pub fn uplink_path(&self, tun_id: TunId) -> Option<UplinkPath> {
        let inner = self.read();
        let tunnel = inner.tunnels.values().find(|t| t.tun_id == tun_id)?;
        let ep = inner.endpoints.get(&tunnel.endpoint_id)?;
        Some(UplinkPath {
            socket: Arc::clone(&ep.socket),
            remote: tunnel.remote_udp,
            tx_teid: tunnel.tx_teid,
        })
    }

    /// Whether any registered TUN device is bound to the named
    /// namespace (used to resolve `start_program`'s netns).
    pub fn tun_binds_netns(&self, netns_name: &str) -> bool {
        self.read()
            .tun_devices
            .values()
            .any(|dev| dev.netns_name.as_deref() == Some(netns_name))
    }

    /// Number of live endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.read().endpoints.len()
    }

    /// Number of live TUN devices.
    pub fn tun_count(&self) -> usize {
        self.read().tun_devices.len()
    }

    /// Number of live tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.read().tunnels.len()
    }

    /// Reference count of the endpoint bound to `addr`, if any.
    pub fn endpoint_use_count(&self, addr: &SocketAddr) -> Option<usize> {
        let inner = self.read();
        let id = inner.endpoint_by_addr.get(addr)?;
        inner.endpoints.get(id).map(|ep| ep.use_count)
    }

    /// Reference count of the TUN device `(name, netns)`, if any.
    pub fn tun_use_count(&self, name: &str, netns_name: Option<&str>) -> Option<usize> {
        let inner = self.read();
        let key = (name.to_string(), netns_name.map(str::to_string));
        let id = inner.tun_by_key.get(&key)?;
        inner.tun_devices.get(id).map(|dev| dev.use_count)
    }

    /// Whether a tunnel with this key exists.
    pub fn has_tunnel(&self, local: SocketAddr, rx_teid: u32) -> bool {
        self.read().tunnels.contains_key(&(local, rx_teid))
    }

    /// Verify the refcount invariant: every entity's `use_count`
    /// equals the number of tunnels referencing it.
    pub fn refcounts_consistent(&self) -> bool {
        let inner = self.read();
        let ep_ok = inner.endpoints.values().all(|ep| {
            ep.use_count
                == inner
                    .tunnels
                    .values()
                    .filter(|t| t.endpoint_id == ep.id)
                    .count()
        });
        let tun_ok = inner.tun_devices.values().all(|dev| {
            dev.use_count
                == inner
                    .tunnels
                    .values()
                    .filter(|t| t.tun_id == dev.id)
                    .count()
        });
        ep_ok && tun_ok
    }

    /// Human-readable state dump for the SIGUSR1 diagnostic report.
    pub fn diagnostic_report(&self) -> String {
        let inner = self.read();
        let mut report = format!(
            "registry: {} endpoint(s), {} tun device(s), {} tunnel(s)\n",
            inner.endpoints.len(),
            inner.tun_devices.len(),
            inner.tunnels.len()
        );
        for ep in inner.endpoints.values() {
            report.push_str(&format!(
                "  endpoint {} use_count={}\n",
                ep.name, ep.use_count
            ));
        }
        for dev in inner.tun_devices.values() {
            report.push_str(&format!(
                "  tun {} netns={} use_count={}\n",
                dev.name,
                dev.netns_name.as_deref().unwrap_or("-"),
                dev.use_count
            ));
        }
        for t in inner.tunnels.values() {
            report.push_str(&format!(
                "  tunnel {} rx_teid={:#x} tx_teid={:#x} remote={} user={}\n",
                t.local_udp, t.rx_teid, t.tx_teid, t.remote_udp, t.user_addr
            ));
        }
        report
    }
}
