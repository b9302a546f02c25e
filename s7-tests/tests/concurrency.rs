use std::thread;

use s7_protocol::types::Area;
use s7_tests::{builder, connect, start};

#[test]
fn clients_write_their_own_blocks_in_parallel() {
    let server = builder().build();
    for db in 1..=4 {
        server.register_area(Area::DB, db, vec![0; 64]).unwrap();
    }
    let server = start(server);

    thread::scope(|scope| {
        for db in 1..=4u16 {
            let server = &server;
            scope.spawn(move || {
                let mut client = connect(server);
                for round in 0..20u8 {
                    let payload = vec![db as u8 * 16 + round % 16; 64];
                    client.db_write(db, 0, &payload).unwrap();
                    assert_eq!(client.db_read(db, 0, 64).unwrap(), payload);
                }
            });
        }
    });

    for db in 1..=4u16 {
        let last = db as u8 * 16 + 19 % 16;
        let data = server.with_area(Area::DB, db, |data| data.to_vec()).unwrap();
        assert_eq!(data, vec![last; 64]);
    }
}

#[test]
fn writes_to_one_area_never_interleave() {
    let server = builder().build();
    server.register_area(Area::DB, 1, vec![0; 200]).unwrap();
    let server = start(server);

    thread::scope(|scope| {
        for writer in 1..=3u8 {
            let server = &server;
            scope.spawn(move || {
                let mut client = connect(server);
                for _ in 0..20 {
                    client.db_write(1, 0, &[writer; 200]).unwrap();
                    let seen = client.db_read(1, 0, 200).unwrap();
                    assert!(seen.iter().all(|byte| *byte == seen[0]), "torn read {:?}", seen);
                }
            });
        }
    });

    let data = server.with_area(Area::DB, 1, |data| data.to_vec()).unwrap();
    assert!((1..=3).contains(&data[0]));
    assert!(data.iter().all(|byte| *byte == data[0]));
}
