use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use s7_client::partner::{Partner, PartnerConfig, PartnerStatus};
use s7_protocol::error::S7Error;
use s7_tests::free_port;

fn linked_pair() -> (Partner, Partner) {
    let port = free_port();
    let passive = Partner::with_config(
        false,
        PartnerConfig {
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_address: "127.0.0.1".to_string(),
            local_port: port,
            local_tsap: 0x1002,
            remote_tsap: 0x1001,
            ..PartnerConfig::default()
        },
    );
    let active = Partner::with_config(
        true,
        PartnerConfig {
            remote_address: "127.0.0.1".to_string(),
            remote_port: port,
            local_tsap: 0x1001,
            remote_tsap: 0x1002,
            ..PartnerConfig::default()
        },
    );
    passive.start().unwrap();
    active.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while passive.status() != PartnerStatus::Linked && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(passive.status(), PartnerStatus::Linked);
    assert_eq!(active.status(), PartnerStatus::Linked);
    (passive, active)
}

#[test]
fn request_and_reply() {
    let (passive, active) = linked_pair();

    let (tx, rx) = mpsc::channel();
    passive.set_recv_callback(Some(Arc::new(move |result: &Result<Vec<u8>, S7Error>| {
        let _ = tx.send(result.clone());
    })));
    passive.as_b_recv().unwrap();

    let request: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
    active.b_send(&request).unwrap();
    let received = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(received, request);
    assert_eq!(
        passive.wait_as_b_recv_completion(Duration::from_secs(1)).unwrap(),
        request
    );

    let replier = thread::spawn(move || {
        passive.b_send(b"done").unwrap();
        passive
    });
    assert_eq!(active.b_recv().unwrap(), b"done".to_vec());
    let passive = replier.join().unwrap();

    assert_eq!(active.stats().bytes_sent, 1000);
    assert_eq!(active.stats().bytes_recv, 4);
    assert_eq!(passive.stats().bytes_recv, 1000);
    assert_eq!(passive.stats().bytes_sent, 4);
}

#[test]
fn send_callback_reports_completion() {
    let (passive, active) = linked_pair();
    let (tx, rx) = mpsc::channel();
    active.set_send_callback(Some(Arc::new(move |result: &Result<(), S7Error>| {
        let _ = tx.send(result.is_ok());
    })));

    let receiver = thread::spawn(move || passive.b_recv());
    active.as_b_send(b"batch 42".to_vec()).unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(receiver.join().unwrap().unwrap(), b"batch 42".to_vec());
    assert_eq!(active.check_as_b_send_completion(), Some(Ok(())));
}

#[test]
fn peer_from_another_address_is_refused() {
    let port = free_port();
    let passive = Partner::with_config(
        false,
        PartnerConfig {
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_address: "10.1.2.3".to_string(),
            local_port: port,
            ..PartnerConfig::default()
        },
    );
    passive.start().unwrap();
    let active = Partner::with_config(
        true,
        PartnerConfig {
            remote_port: port,
            ping_timeout: Duration::from_millis(300),
            recv_timeout: Duration::from_millis(300),
            ..PartnerConfig::default()
        },
    );
    active.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(passive.status(), PartnerStatus::Running);
    assert_ne!(active.status(), PartnerStatus::Linked);
    passive.stop();
    assert_eq!(passive.status(), PartnerStatus::Stopped);
}
