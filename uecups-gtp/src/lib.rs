//! GTP-U (GPRS Tunneling Protocol - User Plane) wire codec
//!
//! Implements the fixed 8-byte GTP1-U header used on the data plane:
//! no sequence numbers, no N-PDU numbers, no extension headers. Only
//! T-PDU (G-PDU) messages are generated or accepted.
//!
//! # Example
//!
//! ```
//! use uecups_gtp::Gtp1Header;
//!
//! let packet = Gtp1Header::encode_packet(0x12345678, b"user data");
//! let header = Gtp1Header::decode(&packet).unwrap();
//! assert_eq!(header.teid, 0x12345678);
//! assert_eq!(header.payload(&packet), b"user data");
//! ```

pub mod codec;

pub use codec::{Gtp1Header, GtpError, GTP1_FLAGS, GTP1_MSGTYPE_TPDU, GTP1U_PORT};
