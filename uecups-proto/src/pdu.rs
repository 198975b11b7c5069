//! PDU types and address codecs
//!
//! IP addresses travel as hex strings (8 chars for IPv4, 32 for IPv6);
//! ports are host-order JSON integers. The `Port` key is capitalised
//! on the wire.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// PDU schema errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// Hex string does not decode
    #[error("invalid hex address: {0}")]
    InvalidHex(String),
    /// Decoded address has the wrong number of bytes for its type
    #[error("address length {got} does not match {expected} bytes for {addr_type}")]
    AddrLengthMismatch {
        /// Declared address type
        addr_type: AddrType,
        /// Expected byte count
        expected: usize,
        /// Decoded byte count
        got: usize,
    },
}

/// Address family selector used throughout the PDU schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrType {
    /// IPv4, 4 address bytes (8 hex chars)
    #[serde(rename = "IPV4")]
    Ipv4,
    /// IPv6, 16 address bytes (32 hex chars)
    #[serde(rename = "IPV6")]
    Ipv6,
}

impl std::fmt::Display for AddrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrType::Ipv4 => write!(f, "IPV4"),
            AddrType::Ipv6 => write!(f, "IPV6"),
        }
    }
}

/// Decode a hex address string against its declared type.
pub fn parse_addr(addr_type: AddrType, ip_hex: &str) -> Result<IpAddr, ProtoError> {
    let bytes = hex::decode(ip_hex).map_err(|_| ProtoError::InvalidHex(ip_hex.to_string()))?;
    match addr_type {
        AddrType::Ipv4 => {
            let octets: [u8; 4] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ProtoError::AddrLengthMismatch {
                        addr_type,
                        expected: 4,
                        got: bytes.len(),
                    })?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AddrType::Ipv6 => {
            let octets: [u8; 16] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ProtoError::AddrLengthMismatch {
                        addr_type,
                        expected: 16,
                        got: bytes.len(),
                    })?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

/// Encode an address into its wire hex form.
pub fn format_addr(addr: &IpAddr) -> (AddrType, String) {
    match addr {
        IpAddr::V4(a) => (AddrType::Ipv4, hex::encode(a.octets())),
        IpAddr::V6(a) => (AddrType::Ipv6, hex::encode(a.octets())),
    }
}

/// A GTP endpoint on the wire: `{"addr_type":"IPV4","ip":"7f000001","Port":2152}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Address family of `ip`
    pub addr_type: AddrType,
    /// Hex-encoded address bytes
    pub ip: String,
    /// UDP port, host order
    #[serde(rename = "Port")]
    pub port: u16,
}

impl EndpointSpec {
    /// Resolve the spec into a socket address.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, ProtoError> {
        let ip = parse_addr(self.addr_type, &self.ip)?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Build a spec from a socket address.
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let (addr_type, ip) = format_addr(&addr.ip());
        Self {
            addr_type,
            ip,
            port: addr.port(),
        }
    }
}

/// `create_tun` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTun {
    /// TEID used when encapsulating uplink traffic
    pub tx_teid: u32,
    /// TEID selecting this tunnel on the local endpoint
    pub rx_teid: u32,
    /// Address family of `user_addr`
    pub user_addr_type: AddrType,
    /// Hex-encoded address assigned to the UE
    pub user_addr: String,
    /// Local GTP endpoint to bind (or reuse)
    pub local_gtp_ep: EndpointSpec,
    /// Remote GTP endpoint uplink traffic is sent to
    pub remote_gtp_ep: EndpointSpec,
    /// TUN device carrying the subscriber side
    pub tun_dev_name: String,
    /// Network namespace the TUN device lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_netns_name: Option<String>,
}

impl CreateTun {
    /// Resolve the UE address field.
    pub fn user_addr(&self) -> Result<IpAddr, ProtoError> {
        parse_addr(self.user_addr_type, &self.user_addr)
    }
}

/// `destroy_tun` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyTun {
    /// Endpoint the tunnel was created on
    pub local_gtp_ep: EndpointSpec,
    /// TEID selecting the tunnel
    pub rx_teid: u32,
}

/// `start_program` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProgram {
    /// Shell command line to execute
    pub command: String,
    /// Additional `"K=V"` environment entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Vec<String>>,
    /// User to drop privileges to before exec
    pub run_as_user: String,
    /// Namespace to run in, resolved via the TUN device bound to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_netns_name: Option<String>,
}

/// Client-to-daemon command PDUs, externally tagged by command name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CupsRequest {
    /// Create a tunnel (and its endpoint/TUN as needed)
    #[serde(rename = "create_tun")]
    CreateTun(CreateTun),
    /// Destroy one tunnel
    #[serde(rename = "destroy_tun")]
    DestroyTun(DestroyTun),
    /// Fork/exec a helper inside a tunnel's namespace
    #[serde(rename = "start_program")]
    StartProgram(StartProgram),
    /// Drop every tunnel and kill every subprocess
    #[serde(rename = "reset_all_state")]
    ResetAllState {},
}

impl CupsRequest {
    /// The wire command key, also used to derive `<command>_res`.
    pub fn command(&self) -> &'static str {
        match self {
            CupsRequest::CreateTun(_) => "create_tun",
            CupsRequest::DestroyTun(_) => "destroy_tun",
            CupsRequest::StartProgram(_) => "start_program",
            CupsRequest::ResetAllState {} => "reset_all_state",
        }
    }
}

/// Result codes visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Success
    #[serde(rename = "OK")]
    Ok,
    /// Malformed request, failed parse or failed exec
    #[serde(rename = "ERR_INVALID_DATA")]
    ErrInvalidData,
    /// Missing tunnel/namespace, or failed tunnel allocation
    #[serde(rename = "ERR_NOT_FOUND")]
    ErrNotFound,
}

/// Daemon-to-client PDUs: command responses plus the unsolicited
/// program termination indication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CupsResponse {
    /// Response to `create_tun`
    #[serde(rename = "create_tun_res")]
    CreateTunRes {
        /// Outcome
        result: ResultCode,
    },
    /// Response to `destroy_tun`
    #[serde(rename = "destroy_tun_res")]
    DestroyTunRes {
        /// Outcome
        result: ResultCode,
    },
    /// Response to `start_program`
    #[serde(rename = "start_program_res")]
    StartProgramRes {
        /// Outcome
        result: ResultCode,
        /// Child pid on success, 0 otherwise
        pid: i32,
    },
    /// Response to `reset_all_state`
    #[serde(rename = "reset_all_state_res")]
    ResetAllStateRes {
        /// Outcome
        result: ResultCode,
    },
    /// Unsolicited: a child started by this client terminated
    #[serde(rename = "program_term_ind")]
    ProgramTermInd {
        /// Pid of the terminated child
        pid: i32,
        /// Exit status (128 + signo when signalled)
        exit_code: i32,
    },
}

impl CupsResponse {
    /// Serialize to the wire form.
    pub fn encode(&self) -> Vec<u8> {
        // Responses are a closed enum of serializable structs.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl ResultCode {
    /// The wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::ErrInvalidData => "ERR_INVALID_DATA",
            ResultCode::ErrNotFound => "ERR_NOT_FOUND",
        }
    }
}

/// Generic `{"<command>_res":{"result":...}}` built from a command
/// name, used when a request fails before it is fully understood.
pub fn generic_result(command: &str, result: ResultCode) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    body.insert(
        "result".to_string(),
        serde_json::Value::String(result.as_str().to_string()),
    );
    let mut outer = serde_json::Map::new();
    outer.insert(format!("{command}_res"), serde_json::Value::Object(body));
    serde_json::Value::Object(outer)
}
