//! uecupsd user-plane daemon library
//!
//! Terminates GTP-U tunnels on the network side and bridges each to a
//! TUN device, optionally inside a network namespace, driven by a
//! JSON-over-SCTP control channel.

pub mod config_loader;
pub mod control;
mod endpoint;
pub mod netns;
pub mod registry;
pub mod supervisor;
pub mod tun;

pub use config_loader::{
    load_and_validate_daemon_config, load_daemon_config, validate_daemon_config, ConfigError,
};
pub use control::server::{ControlEvent, CupsServer, ServerError};
pub use control::ControlTask;
pub use registry::{
    EndpointId, GtpEndpoint, GtpTunnel, Registry, RegistryError, TunDevice, TunId, TunnelParams,
    UplinkPath,
};
pub use supervisor::{ChildExit, Supervisor, SupervisorError};
pub use tun::TunError;
