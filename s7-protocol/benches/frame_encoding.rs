use std::hint::black_box;
use std::io::Cursor;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use s7_protocol::{
    frame::{Frame, MAX_FRAME_LEN},
    pdu,
    types::{AddressSpec, Area, WordLen},
};

fn read_request_frame(items: usize) -> Frame {
    let specs: Vec<AddressSpec> = (0..items)
        .map(|i| AddressSpec::new(Area::DB, 1, (i * 4) as u32, WordLen::Byte, 4))
        .collect();
    let request = pdu::read_request(1, &specs).expect("item count within limit");
    Frame::Data(request.encode())
}

fn encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode read request");
    for items in [1, 10, 20] {
        let frame = read_request_frame(items);
        group.bench_with_input(BenchmarkId::from_parameter(items), &frame, |b, frame| {
            b.iter(|| {
                let mut out = Vec::with_capacity(512);
                black_box(frame).write_to(&mut out).unwrap();
                out
            })
        });
    }
    group.finish();
}

fn decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode read response");
    for size in [4usize, 222, 462] {
        let data = pdu::read_response_data(&[(WordLen::Byte, Ok(vec![0x55; size]))]);
        let response = pdu::Pdu::ack_data(1, 0, vec![pdu::FUNC_READ_VAR, 1], data);
        let mut bytes = Vec::new();
        Frame::Data(response.encode()).write_to(&mut bytes).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| {
                let frame = Frame::from_reader(&mut Cursor::new(black_box(bytes)), MAX_FRAME_LEN)
                    .unwrap();
                let Frame::Data(payload) = frame else {
                    panic!("expected data frame");
                };
                let pdu = pdu::Pdu::decode(&payload).unwrap();
                pdu::parse_read_response(&pdu, 1).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, encode, decode);
criterion_main!(benches);
