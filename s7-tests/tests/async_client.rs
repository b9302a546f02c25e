use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use s7_client::async_client::AsyncClient;
use s7_protocol::{
    error::{ErrorCode, S7Error},
    types::{Area, WordLen},
};
use s7_tests::{builder, connect, start};

#[test]
fn background_write_then_read() {
    let server = builder().build();
    server.register_area(Area::DB, 3, vec![0; 32]).unwrap();
    let server = start(server);
    let client = AsyncClient::new(connect(&server));

    let (tx, rx) = mpsc::channel();
    client.set_as_callback(Some(Arc::new(move |result: &Result<Vec<u8>, S7Error>| {
        let _ = tx.send(result.clone());
    })));

    client.as_db_write(3, 4, vec![1, 2, 3, 4]).unwrap();
    assert_eq!(client.wait_as_completion(Duration::from_secs(5)), Ok(Vec::new()));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(Vec::new()));

    client.as_read_area(Area::DB, 3, 2, 4, WordLen::Word).unwrap();
    let expected = vec![0, 0, 1, 2, 3, 4, 0, 0];
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(expected.clone()));
    assert_eq!(client.check_as_completion(), Some(Ok(expected)));
}

#[test]
fn second_job_is_refused_while_the_first_runs() {
    let server = builder().build();
    server.register_area(Area::DB, 1, vec![7; 8]).unwrap();
    let server = start(server);
    let client = AsyncClient::new(connect(&server));

    // The worker cannot take the client while this closure holds it.
    let refused = client
        .with_client(|_| {
            client.as_db_read(1, 0, 8).unwrap();
            client.as_db_read(1, 0, 8)
        })
        .unwrap();
    match refused {
        Err(S7Error::Client(code)) => assert_eq!(code, ErrorCode::JOB_PENDING),
        other => panic!("expected a pending job, got {:?}", other),
    }
    assert_eq!(client.wait_as_completion(Duration::from_secs(5)), Ok(vec![7; 8]));
    assert_eq!(client.with_client(|client| client.connected()), Ok(true));
}
