//! End-to-end scenarios through the mock transport: plain tunneling,
//! tunneling inside a secure session, and KNX Data Secure payloads carried
//! over the tunnel.

use std::net::SocketAddr;
use std::time::Duration;

use knx_secure::addressing::{
    Address, GroupAddress, IndividualAddress, SerialNumber,
};
use knx_secure::cemi::{CemiFrame, LData};
use knx_secure::net::mock_transport::MockTransport;
use knx_secure::protocol::constants::{CemiMessageCode, Priority, ServiceType};
use knx_secure::protocol::frame::{build_frame, KnxnetIpFrame};
use knx_secure::protocol::secure_session::SecureSession;
use knx_secure::protocol::services::{
    ConnectionHeader, Hpai, TunnelingAck, TunnelingRequest,
};
use knx_secure::protocol::tunnel::TunnelConnection;
use knx_secure::secure::{SecureApplicationLayer, SecureOutcome, SecurityContext};

const KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    0x0F,
];

fn server() -> SocketAddr {
    "192.168.1.10:3671".parse().unwrap()
}

fn connect_response(channel: u8) -> Vec<u8> {
    let mut body = vec![channel, 0x00];
    let mut hpai = [0u8; 8];
    Hpai::nat().encode(&mut hpai).unwrap();
    body.extend_from_slice(&hpai);
    body.extend_from_slice(&[0x04, 0x04, 0x11, 0x0A]);
    build_frame(ServiceType::ConnectResponse, &body)
}

fn group_layer(serial: [u8; 6]) -> SecureApplicationLayer {
    let mut ctx = SecurityContext::new();
    ctx.add_group_key("1/0/1".parse().unwrap(), KEY);
    SecureApplicationLayer::new(ctx, SerialNumber::new(serial))
}

#[test]
fn parse_ldata_indication_scenario() {
    // 29 00 BC E0 11 01 0A 01 01 00 81
    let bytes = [
        0x29u8, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x01, 0x01, 0x00, 0x81,
    ];
    let frame = CemiFrame::parse(&bytes).unwrap();
    assert_eq!(frame.code(), CemiMessageCode::LDataInd);

    let ldata = frame.as_ldata().unwrap();
    assert_eq!(ldata.additional_info().len(), 0);
    assert_eq!(ldata.priority(), Priority::Low);
    assert_eq!(ldata.hop_count(), 6);
    assert_eq!(ldata.source(), IndividualAddress::new(1, 1, 1).unwrap());
    assert_eq!(
        ldata.destination_group().unwrap(),
        GroupAddress::new(1, 2, 1).unwrap()
    );
    assert_eq!(ldata.tpdu(), &[0x00, 0x81]);

    assert_eq!(frame.emit(), bytes.to_vec());
}

#[test]
fn group_address_format_scenario() {
    // raw 0x120A formats as 2/2/10 in the default 3-level style
    let addr = GroupAddress::from(0x120Au16);
    assert_eq!(addr.to_string_3level().as_str(), "2/2/10");
    let parsed: GroupAddress = "2/2/10".parse().unwrap();
    assert_eq!(parsed.raw(), 0x120A);
}

#[tokio::test]
async fn secured_indication_through_tunnel() {
    let src = IndividualAddress::new(1, 1, 7).unwrap();
    let group: GroupAddress = "1/0/1".parse().unwrap();
    let dst = Address::Group(group);

    // the remote device secures a group write
    let mut remote = group_layer([0, 0, 0, 0, 0, 2]);
    let secured_tpdu = remote
        .secure_data(src, dst, 0x00, &[0x00, 0x81], false, true)
        .unwrap()
        .expect("group key configured");

    let indication = LData::builder(CemiMessageCode::LDataInd, src, group)
        .tpdu(&secured_tpdu)
        .build()
        .unwrap();
    let request =
        TunnelingRequest::new(ConnectionHeader::new(7, 0), &CemiFrame::from(indication).emit())
            .build();

    // tunnel receives the indication and acks it
    let mut mock = MockTransport::new();
    mock.add_response(connect_response(7));
    mock.add_response(request);
    let mut tunnel = TunnelConnection::new(mock, server());
    tunnel.connect().await.unwrap();

    let frame = tunnel
        .receive(Duration::from_millis(50))
        .await
        .unwrap()
        .expect("indication");
    let ldata = frame.as_ldata().unwrap();
    assert!(SecureApplicationLayer::is_secured(ldata.tpdu()));

    // the local secure layer recovers the plain APDU
    let mut local = group_layer([0, 0, 0, 0, 0, 1]);
    let outcome = local
        .extract(ldata.source(), ldata.destination(), ldata.tpdu())
        .unwrap();
    assert_eq!(outcome, SecureOutcome::Data(vec![0x00, 0x81]));
    assert_eq!(local.last_valid_sequence(src, false), 1);
}

#[tokio::test]
async fn tunnel_inside_secure_session() {
    let serial = SerialNumber::new([0, 0, 0, 0, 0, 9]);
    // both ends of the wire session share id and key
    let client_session = SecureSession::new(0x0001, KEY, serial);
    let mut server_session = SecureSession::new(0x0001, KEY, serial);

    let wrapped_response = server_session.wrap(&connect_response(3), 0).unwrap();

    let mut mock = MockTransport::new();
    mock.add_response(wrapped_response);
    let mut tunnel = TunnelConnection::with_session(mock, server(), client_session);
    tunnel.connect().await.unwrap();
    assert_eq!(tunnel.channel_id(), 3);

    // everything the client sent left inside a secure wrapper
    let cemi = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x01, 0x01, 0x00, 0x81];
    let wrapped_ack = server_session
        .wrap(&TunnelingAck::ok(3, 0).build(), 0)
        .unwrap();
    tunnel.transport_mut().add_response(wrapped_ack);
    tunnel.send_cemi(&cemi).await.unwrap();

    for (data, _) in tunnel.transport_mut().sent_packets() {
        let frame = KnxnetIpFrame::parse(data).unwrap();
        assert_eq!(frame.service_type(), ServiceType::SecureWrapper);
    }
}

#[test]
fn sync_then_data_between_two_devices() {
    let a_addr = IndividualAddress::new(1, 1, 1).unwrap();
    let b_addr = IndividualAddress::new(1, 1, 2).unwrap();
    let b_serial = SerialNumber::new([0, 0, 0, 0, 0, 0xB]);

    let mut ctx_a = SecurityContext::new();
    ctx_a.add_tool_key(b_addr, KEY);
    let mut a = SecureApplicationLayer::new(ctx_a, SerialNumber::new([0, 0, 0, 0, 0, 0xA]));

    let mut ctx_b = SecurityContext::new();
    ctx_b.add_tool_key(a_addr, KEY);
    let mut b = SecureApplicationLayer::new(ctx_b, b_serial);

    // A challenges B
    let (req, mut synced) = a.sync_request(a_addr, b_addr, b_serial, true).unwrap();
    let SecureOutcome::SyncResponse(res) =
        b.extract(a_addr, Address::Individual(b_addr), &req).unwrap()
    else {
        panic!("expected sync.res");
    };
    assert_eq!(
        a.extract(b_addr, Address::Individual(a_addr), &res).unwrap(),
        SecureOutcome::Synced
    );
    assert!(synced.try_recv().is_ok());

    // A's first secured payload is accepted by B, replay is not
    let secured = a
        .secure_data(a_addr, Address::Individual(b_addr), 0, &[0x00, 0x80], true, true)
        .unwrap()
        .unwrap();
    assert_eq!(
        b.extract(a_addr, Address::Individual(b_addr), &secured).unwrap(),
        SecureOutcome::Data(vec![0x00, 0x80])
    );
    let err = b
        .extract(a_addr, Address::Individual(b_addr), &secured)
        .unwrap_err();
    assert!(matches!(err, knx_secure::KnxError::Secure(_)));
    assert_eq!(b.failure_counters().seq_errors, 1);
}
