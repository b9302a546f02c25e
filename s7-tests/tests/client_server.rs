use std::{
    net::TcpListener,
    thread,
    time::{Duration, Instant},
};

use chrono::{NaiveDate, TimeDelta};
use s7_client::client::{Client, ClientConfig, ClientState};
use s7_protocol::{
    error::{ErrorCode, S7Error},
    types::{AddressSpec, Area, BlockType, CpuStatus, DataItem, WordLen},
    wire,
};
use s7_server::{
    event::{DATA_WRITE, PDU_INCOMING},
    server::Server,
};
use s7_tests::{builder, connect, free_port, start};

fn db_server() -> Server {
    let server = builder().build();
    server
        .register_area(Area::DB, 1, (1..=50).collect())
        .unwrap();
    start(server)
}

#[test]
fn read_registered_data_block() {
    let server = db_server();
    let mut client = connect(&server);
    assert_eq!(client.db_read(1, 10, 4).unwrap(), vec![11, 12, 13, 14]);
    assert_eq!(client.get_pdu_length(), 480);
}

#[test]
fn write_then_read() {
    let server = db_server();
    let mut client = connect(&server);
    client.db_write(1, 10, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
    assert_eq!(client.db_read(1, 10, 4).unwrap(), vec![0xAA, 0xBB, 0xCC, 0xDD]);
    let stored = server
        .with_area(Area::DB, 1, |data| data[9..15].to_vec())
        .unwrap();
    assert_eq!(stored, vec![10, 0xAA, 0xBB, 0xCC, 0xDD, 15]);
}

#[test]
fn real_round_trip() {
    let mut buffer = [0u8; 4];
    wire::set_real(&mut buffer, 0, 3.14159).unwrap();
    assert!((wire::get_real(&buffer, 0).unwrap() - 3.14159).abs() < 1e-5);
}

#[test]
fn connect_to_closed_port_fails_fast() {
    let mut client = Client::with_config(ClientConfig {
        port: free_port(),
        ..ClientConfig::default()
    });
    let started = Instant::now();
    match client.connect_to("127.0.0.1", 0, 2) {
        Err(S7Error::Connection(code)) => assert_eq!(code, ErrorCode::TCP_CONNECTION_FAILED),
        other => panic!("expected connection error, got {:?}", other),
    }
    assert!(started.elapsed() < client.config().timeouts.connect);
    assert!(!client.connected());
    assert_eq!(client.state(), ClientState::Created);
}

#[test]
fn peer_closing_during_handshake_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });
    let mut client = Client::with_config(ClientConfig {
        port,
        ..ClientConfig::default()
    });
    match client.connect_to("127.0.0.1", 0, 2) {
        Err(S7Error::Connection(_)) => {}
        other => panic!("expected connection error, got {:?}", other),
    }
    peer.join().unwrap();
    assert!(!client.connected());
    assert_eq!(client.state(), ClientState::Created);
}

#[test]
fn start_beyond_the_address_field_is_refused() {
    let server = db_server();
    let mut client = connect(&server);
    server.clear_events();
    match client.db_read(1, 0x20_0000, 4) {
        Err(S7Error::Client(code)) => assert_eq!(code, ErrorCode::INVALID_PARAMS),
        other => panic!("expected invalid params, got {:?}", other),
    }
    match client.db_write(1, 0x1F_FFFE, &[1, 2, 3, 4]) {
        Err(S7Error::Client(code)) => assert_eq!(code, ErrorCode::INVALID_PARAMS),
        other => panic!("expected invalid params, got {:?}", other),
    }
    let mut items = vec![
        DataItem::read(AddressSpec::new(Area::DB, 1, 0, WordLen::Byte, 1)),
        DataItem::read(AddressSpec::new(Area::DB, 1, 0x20_0000, WordLen::Byte, 1)),
    ];
    match client.read_multi_vars(&mut items) {
        Err(S7Error::Client(code)) => assert_eq!(code, ErrorCode::INVALID_PARAMS),
        other => panic!("expected invalid params, got {:?}", other),
    }
    assert!(server.pick_event().is_none());
    assert_eq!(client.db_read(1, 0, 4).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn too_many_items_are_refused_locally() {
    let server = db_server();
    let mut client = connect(&server);
    server.clear_events();
    let mut items: Vec<DataItem> = (0..21)
        .map(|i| DataItem::read(AddressSpec::new(Area::DB, 1, i, WordLen::Byte, 1)))
        .collect();
    assert_eq!(
        client.read_multi_vars(&mut items),
        Err(S7Error::Client(ErrorCode::TOO_MANY_ITEMS))
    );
    thread::sleep(Duration::from_millis(50));
    assert!(std::iter::from_fn(|| server.pick_event()).all(|event| event.code != PDU_INCOMING));
    assert!(client.connected());
}

#[test]
fn multi_var_items_fail_independently() {
    let server = db_server();
    server.register_area(Area::MK, 0, vec![0; 16]).unwrap();
    let mut client = connect(&server);

    let mut writes = vec![
        DataItem::write(AddressSpec::new(Area::MK, 0, 2, WordLen::Word, 1), vec![0x12, 0x34]),
        DataItem::write(AddressSpec::new(Area::DB, 9, 0, WordLen::Byte, 1), vec![0xFF]),
        DataItem::write(AddressSpec::new(Area::DB, 1, 8 * 5 + 7, WordLen::Bit, 1), vec![1]),
    ];
    client.write_multi_vars(&mut writes).unwrap();
    assert_eq!(writes[0].result, Ok(()));
    assert_eq!(writes[1].result.as_ref().unwrap_err().code(), ErrorCode::ITEM_NOT_AVAILABLE);
    assert_eq!(writes[2].result, Ok(()));

    let mut reads = vec![
        DataItem::read(AddressSpec::new(Area::MK, 0, 2, WordLen::Word, 1)),
        DataItem::read(AddressSpec::new(Area::DB, 1, 100, WordLen::Byte, 1)),
        DataItem::read(AddressSpec::new(Area::DB, 1, 5, WordLen::Byte, 1)),
    ];
    client.read_multi_vars(&mut reads).unwrap();
    assert_eq!(reads[0].data, vec![0x12, 0x34]);
    assert_eq!(reads[1].result.as_ref().unwrap_err().code(), ErrorCode::ADDRESS_OUT_OF_RANGE);
    assert_eq!(reads[2].data, vec![6 | 0x80]);
}

#[test]
fn counters_and_timers() {
    let server = builder().build();
    server.register_area(Area::CT, 0, vec![0; 20]).unwrap();
    server.register_area(Area::TM, 0, vec![0; 20]).unwrap();
    let server = start(server);
    let mut client = connect(&server);

    client.ct_write(3, &[0x01, 0x23, 0x04, 0x56]).unwrap();
    assert_eq!(client.ct_read(3, 2).unwrap(), vec![0x01, 0x23, 0x04, 0x56]);
    let stored = server.with_area(Area::CT, 0, |data| data[6..10].to_vec()).unwrap();
    assert_eq!(stored, vec![0x01, 0x23, 0x04, 0x56]);

    client.tm_write(0, &[0x10, 0x20]).unwrap();
    assert_eq!(client.tm_read(0, 1).unwrap(), vec![0x10, 0x20]);
    assert_eq!(
        client.ct_write(0, &[0x01]),
        Err(S7Error::Client(ErrorCode::INVALID_PARAMS))
    );
}

#[test]
fn unregistered_area_is_reported() {
    let server = db_server();
    let mut client = connect(&server);
    let err = client.mb_read(0, 4).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ITEM_NOT_AVAILABLE);
    assert!(client.connected());
    assert_eq!(client.last_error().map(S7Error::code), Some(ErrorCode::ITEM_NOT_AVAILABLE));
}

#[test]
fn reads_past_the_end_are_zero_padded() {
    let server = db_server();
    let mut client = connect(&server);
    assert_eq!(client.db_read(1, 48, 4).unwrap(), vec![49, 50, 0, 0]);
    client.db_write(1, 49, &[0xEE, 0xEF]).unwrap();
    let last = server.with_area(Area::DB, 1, |data| (data.len(), data[49])).unwrap();
    assert_eq!(last, (50, 0xEE));
}

#[test]
fn system_status_lists() {
    let server = start(builder().max_pdu(120).build());
    let mut client = connect(&server);
    assert_eq!(client.get_pdu_length(), 120);

    let ids = client.read_szl_list().unwrap();
    assert_eq!(ids, vec![0x0000, 0x0011, 0x001C, 0x0424]);

    // 246 bytes of component identification need three parts at this PDU length.
    let info = client.get_cpu_info().unwrap();
    assert_eq!(info, server.config().cpu_info);

    let order_code = client.get_order_code().unwrap();
    assert!(order_code.code.starts_with("6ES7 315-2EH14-0AB0"));
    assert_eq!((order_code.v1, order_code.v2, order_code.v3), (3, 2, 6));

    assert_eq!(
        client.read_szl(0x0132, 4).unwrap_err().code(),
        ErrorCode::ITEM_NOT_AVAILABLE
    );
}

#[test]
fn cpu_control() {
    let server = db_server();
    let mut client = connect(&server);
    assert_eq!(client.get_cpu_state().unwrap(), CpuStatus::Run);
    assert_eq!(client.plc_hot_start().unwrap_err().code(), ErrorCode::ALREADY_RUN);

    client.plc_stop().unwrap();
    assert_eq!(client.get_cpu_state().unwrap(), CpuStatus::Stop);
    assert_eq!(server.status().1, CpuStatus::Stop);
    assert_eq!(client.plc_stop().unwrap_err().code(), ErrorCode::ALREADY_STOP);

    client.plc_cold_start().unwrap();
    assert_eq!(client.get_cpu_state().unwrap(), CpuStatus::Run);
}

#[test]
fn clock_and_password() {
    let server = db_server();
    let mut client = connect(&server);
    let value = NaiveDate::from_ymd_opt(2021, 7, 14)
        .unwrap()
        .and_hms_milli_opt(8, 30, 0, 0)
        .unwrap();
    client.set_plc_datetime(value).unwrap();
    let read = client.get_plc_datetime().unwrap();
    let drift = read.signed_duration_since(value);
    assert!(drift >= TimeDelta::zero() && drift < TimeDelta::seconds(5), "{}", drift);
    client.set_plc_system_datetime().unwrap();

    assert_eq!(
        client.clear_session_password().unwrap_err().code(),
        ErrorCode::NO_PASSWORD_TO_SET_OR_CLEAR
    );
    client.set_session_password("pass").unwrap();
    client.clear_session_password().unwrap();
    assert_eq!(
        client.set_session_password("far too long").unwrap_err().code(),
        ErrorCode::INVALID_PARAMS
    );
}

#[test]
fn blocks() {
    let server = db_server();
    server.register_area(Area::DB, 3, vec![7; 300]).unwrap();
    let mut client = connect(&server);

    let list = client.list_blocks().unwrap();
    assert_eq!(list.get(BlockType::DB), 2);
    assert_eq!(client.list_blocks_of_type(BlockType::DB).unwrap(), vec![1, 3]);
    assert!(client.list_blocks_of_type(BlockType::OB).unwrap().is_empty());

    assert_eq!(client.get_block_info(BlockType::DB, 1).unwrap().size, 50);
    assert_eq!(
        client.get_block_info(BlockType::DB, 2).unwrap_err().code(),
        ErrorCode::ITEM_NOT_AVAILABLE
    );
    assert_eq!(client.db_get(3).unwrap(), vec![7; 300]);
    assert_eq!(
        client.get_block_info(BlockType::FC, 1).unwrap_err().code(),
        ErrorCode::INVALID_BLOCK_TYPE
    );
}

#[test]
fn disconnect_is_idempotent() {
    let server = db_server();
    let mut client = connect(&server);
    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);
    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(client.db_read(1, 0, 1).unwrap_err().code(), ErrorCode::TCP_NOT_CONNECTED);

    client.connect().unwrap();
    assert_eq!(client.db_read(1, 0, 1).unwrap(), vec![1]);

    let mut fresh = Client::new();
    fresh.disconnect();
    assert_eq!(fresh.state(), ClientState::Disconnected);
    fresh.disconnect();
    assert_eq!(fresh.state(), ClientState::Disconnected);
}

#[test]
fn server_tracks_clients() {
    let server = db_server();
    let first = connect(&server);
    let mut second = connect(&server);
    assert_eq!(server.status().2, 2);
    drop(first);
    second.db_write(1, 0, &[0]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.status().2 != 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.status().2, 1);
    let codes: Vec<u32> = std::iter::from_fn(|| server.pick_event())
        .map(|event| event.code)
        .collect();
    assert!(codes.contains(&DATA_WRITE));

    server.stop();
    assert_eq!(server.status().2, 0);
    assert!(second.db_read(1, 0, 1).is_err());
}

#[test]
fn clients_beyond_the_limit_are_refused() {
    let server = builder().max_clients(1).build();
    server.register_area(Area::DB, 1, vec![0; 4]).unwrap();
    let server = start(server);
    let _first = connect(&server);

    let mut second = Client::with_config(ClientConfig {
        port: server.local_addr().unwrap().port(),
        ..ClientConfig::default()
    });
    assert!(second.connect_to("127.0.0.1", 0, 2).is_err());
    assert_eq!(server.status().2, 1);
}
