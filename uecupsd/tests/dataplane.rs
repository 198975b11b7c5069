//! Data-plane integration tests
//!
//! Drive the daemon end to end: commands through the handler layer,
//! GTP packets through real loopback UDP sockets, and the subscriber
//! side through TUN devices backed by datagram socket pairs (so no
//! privileges are needed).

use std::net::UdpSocket;
use std::os::unix::net::UnixDatagram;
use std::os::unix::prelude::IntoRawFd;
use std::sync::Arc;
use std::time::Duration;

use tun_rs::AsyncDevice;

use uecups_gtp::Gtp1Header;
use uecupsd::control::handlers::handle_pdu;
use uecupsd::{Registry, Supervisor, TunDevice};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE_TIMEOUT: Duration = Duration::from_millis(300);

/// A TUN device backed by one end of a datagram socket pair. The
/// returned socket plays the kernel side of the device.
fn fake_tun(name: &str) -> (TunDevice, UnixDatagram) {
    let (near, far) = UnixDatagram::pair().expect("socketpair");
    near.set_nonblocking(true).expect("nonblocking");
    let fd = near.into_raw_fd();
    // SAFETY: the fd is owned, valid and nonblocking; ownership
    // transfers to the device.
    let device = unsafe { AsyncDevice::from_fd(fd) }.expect("wrap fd");
    (TunDevice::new(name, None, device), far)
}

fn dispatch(registry: &Arc<Registry>, supervisor: &mut Supervisor, pdu: &str) -> String {
    let response = handle_pdu(registry, supervisor, 1, pdu.as_bytes()).expect("response");
    String::from_utf8(response).expect("utf8 response")
}

fn expect_silence(far: &UnixDatagram) {
    let mut buf = [0u8; 2048];
    far.set_read_timeout(Some(SILENCE_TIMEOUT)).unwrap();
    match far.recv(&mut buf) {
        Ok(n) => panic!("unexpected {} bytes forwarded to TUN", n),
        Err(e) => assert!(
            matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "unexpected error: {e}"
        ),
    }
}

/// Scenarios: create + downlink traffic, uplink, malformed-packet
/// survival, destroy + silent drop. Uses the canonical create_tun PDU
/// with the local endpoint on 127.0.0.1:2152 and the remote peer on
/// 127.0.0.2:2152.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_create_traffic_and_destroy() {
    let registry = Registry::new(1400);
    let (mut supervisor, _exit_rx) = Supervisor::new();
    let (dev, far) = fake_tun("tun0");
    registry.tun_register(dev);

    // The remote GTP peer; 127.0.0.2 is loopback-local on Linux.
    let remote_peer = UdpSocket::bind("127.0.0.2:2152").expect("bind remote peer");
    remote_peer.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

    let create = concat!(
        r#"{"create_tun":{"tx_teid":1,"rx_teid":2,"user_addr_type":"IPV4","#,
        r#""user_addr":"0a000001","local_gtp_ep":{"addr_type":"IPV4","#,
        r#""ip":"7f000001","Port":2152},"remote_gtp_ep":{"addr_type":"IPV4","#,
        r#""ip":"7f000002","Port":2152},"tun_dev_name":"tun0"}}"#
    );
    assert_eq!(
        dispatch(&registry, &mut supervisor, create),
        r#"{"create_tun_res":{"result":"OK"}}"#
    );
    assert_eq!(registry.tunnel_count(), 1);
    assert!(registry.refcounts_consistent());

    // Downlink: a GTP1-U packet with TEID=2 injected at the local
    // endpoint yields exactly its payload on the TUN side.
    let injector = UdpSocket::bind("127.0.0.1:0").expect("bind injector");
    let payload = b"downlink-payload-P";
    let packet = Gtp1Header::encode_packet(2, payload);
    injector.send_to(&packet, "127.0.0.1:2152").unwrap();

    let mut buf = [0u8; 2048];
    far.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    let n = far.recv(&mut buf).expect("payload on TUN side");
    assert_eq!(&buf[..n], payload);

    // A malformed header (bad flags) is dropped and the worker
    // survives: the next valid packet still arrives.
    let mut bad = packet.to_vec();
    bad[0] = 0x32;
    injector.send_to(&bad, "127.0.0.1:2152").unwrap();
    injector.send_to(&packet, "127.0.0.1:2152").unwrap();
    let n = far.recv(&mut buf).expect("worker survived malformed packet");
    assert_eq!(&buf[..n], payload);

    // A TEID with no tunnel is dropped as well.
    let orphan = Gtp1Header::encode_packet(0x9999, payload);
    injector.send_to(&orphan, "127.0.0.1:2152").unwrap();
    expect_silence(&far);

    // Uplink: an L3 frame written on the TUN side appears at the
    // remote peer as a GTP1-U packet with TEID=1.
    let frame = b"uplink-frame-P";
    far.send(frame).expect("write frame to TUN side");

    let n = remote_peer.recv(&mut buf).expect("packet at remote peer");
    assert_eq!(n, Gtp1Header::SIZE + frame.len());
    assert_eq!(buf[0], 0x30);
    assert_eq!(buf[1], 0xFF);
    let header = Gtp1Header::decode(&buf[..n]).expect("valid GTP header");
    assert_eq!(header.teid, 1);
    assert_eq!(header.length as usize, frame.len());
    assert_eq!(header.payload(&buf[..n]), frame);

    // Destroy; subsequent injection is silently dropped.
    let destroy = concat!(
        r#"{"destroy_tun":{"local_gtp_ep":{"addr_type":"IPV4","#,
        r#""ip":"7f000001","Port":2152},"rx_teid":2}}"#
    );
    assert_eq!(
        dispatch(&registry, &mut supervisor, destroy),
        r#"{"destroy_tun_res":{"result":"OK"}}"#
    );
    assert_eq!(registry.tunnel_count(), 0);
    assert_eq!(registry.endpoint_count(), 0);
    assert_eq!(registry.tun_count(), 0);

    injector.send_to(&packet, "127.0.0.1:2152").unwrap();
    expect_silence(&far);
}

/// Duplicate-create: running the same create twice answers
/// ERR_NOT_FOUND the second time and leaves a single tunnel.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_duplicate_create() {
    let registry = Registry::new(1400);
    let (mut supervisor, _exit_rx) = Supervisor::new();
    let (dev, _far) = fake_tun("tun1");
    registry.tun_register(dev);

    let create = concat!(
        r#"{"create_tun":{"tx_teid":1,"rx_teid":2,"user_addr_type":"IPV4","#,
        r#""user_addr":"0a000001","local_gtp_ep":{"addr_type":"IPV4","#,
        r#""ip":"7f000001","Port":23004},"remote_gtp_ep":{"addr_type":"IPV4","#,
        r#""ip":"7f000002","Port":2152},"tun_dev_name":"tun1"}}"#
    );
    assert_eq!(
        dispatch(&registry, &mut supervisor, create),
        r#"{"create_tun_res":{"result":"OK"}}"#
    );
    assert_eq!(
        dispatch(&registry, &mut supervisor, create),
        r#"{"create_tun_res":{"result":"ERR_NOT_FOUND"}}"#
    );
    assert_eq!(registry.tunnel_count(), 1);
    assert!(registry.refcounts_consistent());
}

/// Reset: after N successful creates, reset_all_state empties all
/// three entity lists and answers OK.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_reset_all_state() {
    let registry = Registry::new(1400);
    let (mut supervisor, _exit_rx) = Supervisor::new();
    let (dev, _far) = fake_tun("tun2");
    registry.tun_register(dev);

    for rx_teid in 2..=5u32 {
        let create = format!(
            concat!(
                r#"{{"create_tun":{{"tx_teid":1,"rx_teid":{rx},"user_addr_type":"IPV4","#,
                r#""user_addr":"0a000001","local_gtp_ep":{{"addr_type":"IPV4","#,
                r#""ip":"7f000001","Port":23005}},"remote_gtp_ep":{{"addr_type":"IPV4","#,
                r#""ip":"7f000002","Port":2152}},"tun_dev_name":"tun2"}}}}"#
            ),
            rx = rx_teid
        );
        assert_eq!(
            dispatch(&registry, &mut supervisor, &create),
            r#"{"create_tun_res":{"result":"OK"}}"#
        );
    }
    assert_eq!(registry.tunnel_count(), 4);
    assert_eq!(registry.endpoint_count(), 1);
    assert_eq!(registry.tun_count(), 1);

    assert_eq!(
        dispatch(&registry, &mut supervisor, r#"{"reset_all_state":{}}"#),
        r#"{"reset_all_state_res":{"result":"OK"}}"#
    );
    assert_eq!(registry.tunnel_count(), 0);
    assert_eq!(registry.endpoint_count(), 0);
    assert_eq!(registry.tun_count(), 0);
}

/// Per-tunnel ordering: back-to-back downlink packets come out of the
/// TUN side in the order they entered the endpoint socket.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downlink_preserves_order() {
    let registry = Registry::new(1400);
    let (mut supervisor, _exit_rx) = Supervisor::new();
    let (dev, far) = fake_tun("tun3");
    registry.tun_register(dev);

    let create = concat!(
        r#"{"create_tun":{"tx_teid":1,"rx_teid":2,"user_addr_type":"IPV4","#,
        r#""user_addr":"0a000001","local_gtp_ep":{"addr_type":"IPV4","#,
        r#""ip":"7f000001","Port":23006},"remote_gtp_ep":{"addr_type":"IPV4","#,
        r#""ip":"7f000002","Port":2152},"tun_dev_name":"tun3"}}"#
    );
    assert_eq!(
        dispatch(&registry, &mut supervisor, create),
        r#"{"create_tun_res":{"result":"OK"}}"#
    );

    let injector = UdpSocket::bind("127.0.0.1:0").unwrap();
    for i in 0..10u8 {
        let packet = Gtp1Header::encode_packet(2, &[i; 4]);
        injector.send_to(&packet, "127.0.0.1:23006").unwrap();
    }

    far.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    let mut buf = [0u8; 2048];
    for i in 0..10u8 {
        let n = far.recv(&mut buf).expect("ordered payload");
        assert_eq!(&buf[..n], &[i; 4]);
    }
}
