//! CUPS control-channel PDU schema
//!
//! JSON message types exchanged between the user-plane daemon and its
//! control-plane peer. Each PDU is one JSON object with exactly one
//! key selecting the command (externally tagged), carried in a single
//! message of the reliable control transport.
//!
//! # Example
//!
//! ```
//! use uecups_proto::{CupsRequest, CupsResponse, ResultCode};
//!
//! let pdu = br#"{"destroy_tun":{"local_gtp_ep":
//!     {"addr_type":"IPV4","ip":"7f000001","Port":2152},"rx_teid":2}}"#;
//! let req: CupsRequest = serde_json::from_slice(pdu).unwrap();
//! assert!(matches!(req, CupsRequest::DestroyTun(_)));
//!
//! let res = CupsResponse::DestroyTunRes { result: ResultCode::Ok };
//! assert_eq!(
//!     serde_json::to_string(&res).unwrap(),
//!     r#"{"destroy_tun_res":{"result":"OK"}}"#
//! );
//! ```

pub mod pdu;

pub use pdu::{
    format_addr, generic_result, parse_addr, AddrType, CreateTun, CupsRequest, CupsResponse,
    DestroyTun, EndpointSpec, ProtoError, ResultCode, StartProgram,
};
