//! Command handlers
//!
//! Each handler consumes one parsed PDU and produces exactly one
//! response. Parse failures answer `ERR_INVALID_DATA`; registry
//! lookups that miss answer `ERR_NOT_FOUND`. A failed tunnel
//! allocation also answers `ERR_NOT_FOUND`, which is what the wire
//! protocol has always carried for that case.

use std::sync::Arc;

use tracing::{info, warn};

use uecups_proto::{
    generic_result, CreateTun, CupsRequest, CupsResponse, DestroyTun, ProtoError, ResultCode,
    StartProgram,
};

use crate::registry::{Registry, TunnelParams};
use crate::supervisor::Supervisor;

/// Parse and dispatch one received PDU.
///
/// Returns the serialized response, or `None` for PDUs that cannot be
/// answered: malformed JSON carries no command name to build the
/// `<command>_res` envelope from, so it is logged and dropped.
pub fn handle_pdu(
    registry: &Arc<Registry>,
    supervisor: &mut Supervisor,
    client_id: u64,
    data: &[u8],
) -> Option<Vec<u8>> {
    let value: serde_json::Value = match serde_json::from_slice(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(client_id, error = %e, "error decoding JSON PDU");
            return None;
        }
    };

    // One JSON object, exactly one key selecting the command.
    let command = match value.as_object() {
        Some(obj) if obj.len() == 1 => obj.keys().next().cloned(),
        _ => None,
    };
    let Some(command) = command else {
        warn!(client_id, "PDU is not an object with exactly one command key");
        return None;
    };

    let request: CupsRequest = match serde_json::from_value(value) {
        Ok(req) => req,
        Err(e) => {
            warn!(client_id, command = %command, error = %e, "error handling command");
            let res = generic_result(&command, ResultCode::ErrInvalidData);
            return Some(res.to_string().into_bytes());
        }
    };

    let response = match request {
        CupsRequest::CreateTun(ctun) => handle_create_tun(registry, &ctun),
        CupsRequest::DestroyTun(dtun) => handle_destroy_tun(registry, &dtun),
        CupsRequest::StartProgram(sprog) => {
            handle_start_program(registry, supervisor, client_id, &sprog)
        }
        CupsRequest::ResetAllState {} => handle_reset_all_state(registry, supervisor),
    };
    Some(response.encode())
}

fn tunnel_params(ctun: &CreateTun) -> Result<TunnelParams, ProtoError> {
    Ok(TunnelParams {
        local_udp: ctun.local_gtp_ep.to_socket_addr()?,
        remote_udp: ctun.remote_gtp_ep.to_socket_addr()?,
        user_addr: ctun.user_addr()?,
        rx_teid: ctun.rx_teid,
        tx_teid: ctun.tx_teid,
        tun_name: ctun.tun_dev_name.clone(),
        tun_netns_name: ctun.tun_netns_name.clone(),
    })
}

/// `create_tun`: acquire (or create) the endpoint and TUN device and
/// bind the tunnel.
pub fn handle_create_tun(registry: &Arc<Registry>, ctun: &CreateTun) -> CupsResponse {
    let params = match tunnel_params(ctun) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed create_tun");
            return CupsResponse::CreateTunRes {
                result: ResultCode::ErrInvalidData,
            };
        }
    };

    match registry.tunnel_create(params) {
        Ok(()) => CupsResponse::CreateTunRes {
            result: ResultCode::Ok,
        },
        Err(e) => {
            warn!(error = %e, "failed to allocate tunnel");
            CupsResponse::CreateTunRes {
                result: ResultCode::ErrNotFound,
            }
        }
    }
}

/// `destroy_tun`: unlink the tunnel keyed by `(local endpoint, rx TEID)`.
pub fn handle_destroy_tun(registry: &Arc<Registry>, dtun: &DestroyTun) -> CupsResponse {
    let local = match dtun.local_gtp_ep.to_socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "malformed destroy_tun");
            return CupsResponse::DestroyTunRes {
                result: ResultCode::ErrInvalidData,
            };
        }
    };

    match registry.tunnel_destroy(local, dtun.rx_teid) {
        Ok(()) => CupsResponse::DestroyTunRes {
            result: ResultCode::Ok,
        },
        Err(e) => {
            warn!(error = %e, "failed to destroy tunnel");
            CupsResponse::DestroyTunRes {
                result: ResultCode::ErrNotFound,
            }
        }
    }
}

/// `start_program`: fork/exec a helper, optionally inside the
/// namespace of the TUN device that binds it.
pub fn handle_start_program(
    registry: &Arc<Registry>,
    supervisor: &mut Supervisor,
    client_id: u64,
    sprog: &StartProgram,
) -> CupsResponse {
    if let Some(netns) = &sprog.tun_netns_name {
        if !registry.tun_binds_netns(netns) {
            warn!(netns = %netns, "start_program: no TUN device binds namespace");
            return CupsResponse::StartProgramRes {
                result: ResultCode::ErrInvalidData,
                pid: 0,
            };
        }
    }

    match supervisor.start_program(client_id, sprog) {
        Ok(pid) => CupsResponse::StartProgramRes {
            result: ResultCode::Ok,
            pid: pid as i32,
        },
        Err(e) => {
            warn!(error = %e, "start_program failed");
            CupsResponse::StartProgramRes {
                result: ResultCode::ErrInvalidData,
                pid: 0,
            }
        }
    }
}

/// `reset_all_state`: drop every tunnel, kill every subprocess.
pub fn handle_reset_all_state(
    registry: &Arc<Registry>,
    supervisor: &mut Supervisor,
) -> CupsResponse {
    registry.reset_all();
    let killed = supervisor.kill_all();
    info!(killed, "reset all state");
    CupsResponse::ResetAllStateRes {
        result: ResultCode::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_tun;

    fn setup() -> (Arc<Registry>, Supervisor) {
        let registry = Registry::new(1400);
        let (supervisor, exit_rx) = Supervisor::new();
        // None of these tests spawn children; the receiver side is not
        // needed.
        drop(exit_rx);
        (registry, supervisor)
    }

    fn dispatch(
        registry: &Arc<Registry>,
        supervisor: &mut Supervisor,
        pdu: &str,
    ) -> Option<String> {
        handle_pdu(registry, supervisor, 1, pdu.as_bytes())
            .map(|bytes| String::from_utf8(bytes).unwrap())
    }

    fn create_tun_pdu(port: u16, rx_teid: u32) -> String {
        format!(
            concat!(
                r#"{{"create_tun":{{"tx_teid":1,"rx_teid":{rx},"user_addr_type":"IPV4","#,
                r#""user_addr":"0a000001","local_gtp_ep":{{"addr_type":"IPV4","#,
                r#""ip":"7f000001","Port":{port}}},"remote_gtp_ep":{{"addr_type":"IPV4","#,
                r#""ip":"7f000002","Port":2152}},"tun_dev_name":"tun0"}}}}"#
            ),
            rx = rx_teid,
            port = port
        )
    }

    #[tokio::test]
    async fn test_create_then_destroy() {
        let (registry, mut supervisor) = setup();
        let (dev, _peer) = fake_tun("tun0");
        registry.tun_register(dev);

        let res = dispatch(&registry, &mut supervisor, &create_tun_pdu(21530, 2)).unwrap();
        assert_eq!(res, r#"{"create_tun_res":{"result":"OK"}}"#);
        assert_eq!(registry.tunnel_count(), 1);

        let destroy = concat!(
            r#"{"destroy_tun":{"local_gtp_ep":{"addr_type":"IPV4","#,
            r#""ip":"7f000001","Port":21530},"rx_teid":2}}"#
        );
        let res = dispatch(&registry, &mut supervisor, destroy).unwrap();
        assert_eq!(res, r#"{"destroy_tun_res":{"result":"OK"}}"#);
        assert_eq!(registry.tunnel_count(), 0);
        assert_eq!(registry.endpoint_count(), 0);
        assert_eq!(registry.tun_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_create_reports_not_found() {
        let (registry, mut supervisor) = setup();
        let (dev, _peer) = fake_tun("tun0");
        registry.tun_register(dev);

        let pdu = create_tun_pdu(21531, 2);
        let res = dispatch(&registry, &mut supervisor, &pdu).unwrap();
        assert_eq!(res, r#"{"create_tun_res":{"result":"OK"}}"#);

        // Exact legacy mapping: a duplicate is ERR_NOT_FOUND, not
        // ERR_INVALID_DATA.
        let res = dispatch(&registry, &mut supervisor, &pdu).unwrap();
        assert_eq!(res, r#"{"create_tun_res":{"result":"ERR_NOT_FOUND"}}"#);
        assert_eq!(registry.tunnel_count(), 1);
        assert!(registry.refcounts_consistent());
    }

    #[tokio::test]
    async fn test_destroy_nonexistent_reports_not_found() {
        let (registry, mut supervisor) = setup();
        let destroy = concat!(
            r#"{"destroy_tun":{"local_gtp_ep":{"addr_type":"IPV4","#,
            r#""ip":"7f000001","Port":21532},"rx_teid":9}}"#
        );
        let res = dispatch(&registry, &mut supervisor, destroy).unwrap();
        assert_eq!(res, r#"{"destroy_tun_res":{"result":"ERR_NOT_FOUND"}}"#);
    }

    #[tokio::test]
    async fn test_create_tun_bad_hex_is_invalid_data() {
        let (registry, mut supervisor) = setup();
        // 3-byte user address for IPV4
        let pdu = concat!(
            r#"{"create_tun":{"tx_teid":1,"rx_teid":2,"user_addr_type":"IPV4","#,
            r#""user_addr":"0a0000","local_gtp_ep":{"addr_type":"IPV4","#,
            r#""ip":"7f000001","Port":21533},"remote_gtp_ep":{"addr_type":"IPV4","#,
            r#""ip":"7f000002","Port":2152},"tun_dev_name":"tun0"}}"#
        );
        let res = dispatch(&registry, &mut supervisor, pdu).unwrap();
        assert_eq!(res, r#"{"create_tun_res":{"result":"ERR_INVALID_DATA"}}"#);
        assert_eq!(registry.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_field_is_invalid_data() {
        let (registry, mut supervisor) = setup();
        let res = dispatch(
            &registry,
            &mut supervisor,
            r#"{"create_tun":{"tx_teid":1,"rx_teid":2}}"#,
        )
        .unwrap();
        assert_eq!(res, r#"{"create_tun_res":{"result":"ERR_INVALID_DATA"}}"#);
    }

    #[tokio::test]
    async fn test_unknown_command_is_invalid_data() {
        let (registry, mut supervisor) = setup();
        let res = dispatch(&registry, &mut supervisor, r#"{"frobnicate":{}}"#).unwrap();
        assert_eq!(res, r#"{"frobnicate_res":{"result":"ERR_INVALID_DATA"}}"#);
    }

    #[tokio::test]
    async fn test_malformed_json_is_dropped() {
        let (registry, mut supervisor) = setup();
        assert!(dispatch(&registry, &mut supervisor, "{not json").is_none());
        assert!(dispatch(&registry, &mut supervisor, r#""just a string""#).is_none());
        assert!(dispatch(&registry, &mut supervisor, "{}").is_none());
    }

    #[tokio::test]
    async fn test_start_program_unknown_netns() {
        let (registry, mut supervisor) = setup();
        let pdu = concat!(
            r#"{"start_program":{"command":"/bin/true","run_as_user":"nobody","#,
            r#""tun_netns_name":"no-such-ns"}}"#
        );
        let res = dispatch(&registry, &mut supervisor, pdu).unwrap();
        assert_eq!(
            res,
            r#"{"start_program_res":{"result":"ERR_INVALID_DATA","pid":0}}"#
        );
    }

    #[tokio::test]
    async fn test_reset_all_state() {
        let (registry, mut supervisor) = setup();
        let (dev, _peer) = fake_tun("tun0");
        registry.tun_register(dev);

        for (port, teid) in [(21535u16, 2u32), (21536, 3), (21537, 4)] {
            let res = dispatch(&registry, &mut supervisor, &create_tun_pdu(port, teid)).unwrap();
            assert_eq!(res, r#"{"create_tun_res":{"result":"OK"}}"#);
        }
        assert_eq!(registry.tunnel_count(), 3);

        let res = dispatch(&registry, &mut supervisor, r#"{"reset_all_state":{}}"#).unwrap();
        assert_eq!(res, r#"{"reset_all_state_res":{"result":"OK"}}"#);
        assert_eq!(registry.tunnel_count(), 0);
        assert_eq!(registry.endpoint_count(), 0);
        assert_eq!(registry.tun_count(), 0);
    }
}
