//! The client against a scripted PLC that answers system status lists in parts.
use futures_util::{SinkExt, StreamExt};
use s7_client::client::{Client, ClientConfig};
use s7_protocol::{
    codec::tokio::TpktCodec,
    error::{ErrorCode, S7Error},
    frame::Frame,
    pdu::{self, Pdu},
    types::SzlRecord,
    userdata::{self, GROUP_SZL, SUB_READ_SZL, UserData, UserDataParams},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

type Plc = Framed<TcpStream, TpktCodec>;

async fn next_pdu(plc: &mut Plc) -> Pdu {
    match plc.next().await {
        Some(Ok(Frame::Data(raw))) => Pdu::decode(&raw).unwrap(),
        other => panic!("expected a data frame, got {:?}", other),
    }
}

async fn reply(plc: &mut Plc, pdu: Pdu) {
    plc.send(Frame::Data(pdu.encode())).await.unwrap();
}

/// Accepts one client, runs the handshake and the PDU negotiation.
async fn accept(listener: &TcpListener) -> Plc {
    let (stream, _) = listener.accept().await.unwrap();
    let mut plc = Framed::new(stream, TpktCodec::default());
    match plc.next().await {
        Some(Ok(Frame::ConnectionRequest(request))) => {
            assert_eq!(request.called_tsap, Some(0x0102));
            plc.send(Frame::ConnectionConfirm(request.confirm(0x4400)))
                .await
                .unwrap();
        }
        other => panic!("expected a connection request, got {:?}", other),
    }
    let setup = next_pdu(&mut plc).await;
    reply(&mut plc, pdu::setup_communication_response(&setup, 240)).await;
    plc
}

async fn connected_client(listener: &TcpListener) -> (Plc, tokio::task::JoinHandle<Client>) {
    let port = listener.local_addr().unwrap().port();
    let client = tokio::task::spawn_blocking(move || {
        let mut client = Client::with_config(ClientConfig {
            port,
            ..ClientConfig::default()
        });
        client.connect_to("127.0.0.1", 0, 2).unwrap();
        client
    });
    let plc = accept(listener).await;
    (plc, client)
}

#[tokio::test(flavor = "multi_thread")]
async fn szl_answer_in_three_parts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut plc, client) = connected_client(&listener).await;
    let mut client = client.await.unwrap();
    assert_eq!(client.get_pdu_length(), 240);

    let records: Vec<u8> = (0..84u8).collect();
    let payload = userdata::szl_payload(0x0011, 0x0000, 28, &records);
    let reader = tokio::task::spawn_blocking(move || client.read_szl(0x0011, 0x0000));

    let first = next_pdu(&mut plc).await;
    let request = UserData::decode(&first).unwrap();
    assert_eq!((request.params.group, request.params.subfunction), (GROUP_SZL, SUB_READ_SZL));
    assert_eq!(userdata::parse_szl_request(&request.payload).unwrap(), (0x0011, 0x0000));

    let parts: Vec<&[u8]> = payload.chunks(40).collect();
    assert_eq!(parts.len(), 3);
    let mut reference = first.reference;
    for (index, part) in parts.iter().enumerate() {
        let last = index + 1 == parts.len();
        let params = UserDataParams::response(&request.params, 0x21, !last, 0);
        reply(&mut plc, userdata::response(reference, params, part)).await;
        if !last {
            let next = next_pdu(&mut plc).await;
            let continuation = UserData::decode(&next).unwrap();
            assert!(continuation.params.continuation);
            assert_eq!(continuation.params.sequence, 0x21);
            reference = next.reference;
        }
    }

    let record = reader.await.unwrap().unwrap();
    assert_eq!(
        record,
        SzlRecord {
            id: 0x0011,
            index: 0x0000,
            record_len: 28,
            record_count: 3,
            data: records,
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_szl_is_a_plc_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut plc, client) = connected_client(&listener).await;
    let mut client = client.await.unwrap();
    let reader = tokio::task::spawn_blocking(move || client.read_szl(0x0132, 0x0004));

    let request = next_pdu(&mut plc).await;
    let params = UserData::decode(&request).unwrap().params;
    reply(
        &mut plc,
        userdata::response(
            request.reference,
            UserDataParams::response(&params, 0, false, 0xD209),
            &[],
        ),
    )
    .await;

    match reader.await.unwrap() {
        Err(S7Error::Plc { raw, code }) => {
            assert_eq!(raw, 0xD209);
            assert_eq!(code, ErrorCode::ITEM_NOT_AVAILABLE);
        }
        other => panic!("expected a PLC error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn answer_for_another_request_is_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut plc, client) = connected_client(&listener).await;
    let mut client = client.await.unwrap();
    let reader = tokio::task::spawn_blocking(move || client.read_szl(0x0424, 0x0000));

    let request = next_pdu(&mut plc).await;
    let params = UserData::decode(&request).unwrap().params;
    let payload = userdata::szl_payload(0x0424, 0x0000, 0, &[]);
    reply(
        &mut plc,
        userdata::response(
            request.reference.wrapping_add(1),
            UserDataParams::response(&params, 0, false, 0),
            &payload,
        ),
    )
    .await;

    let err = reader.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::INVALID_PLC_ANSWER);
}
