//! # S7 Server
//!
//! Runs a software S7 PLC with DB1, PA, TM and CT registered (and optionally DB0
//! filled with one value of every common type) and prints what clients do with it.
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use s7_protocol::{error::CodecError, types::Area, wire};
use s7_server::{event::event_text, server::Builder};

#[derive(Parser)]
#[command(about = "Software Siemens S7 PLC serving demo memory areas", long_about=None)]
struct Args {
    #[arg(short, long, default_value = "1102")]
    port: u16,

    #[arg(short, long, default_value = "0.0.0.0")]
    ip: IpAddr,

    #[arg(short, long, default_value = "100", help = "Size of each demo area in bytes")]
    size: usize,

    #[arg(long, help = "Register DB0 filled with sample values of every type")]
    standard_values: bool,
}

/// DB0 contents: the limits of each elementary type at fixed offsets.
fn standard_values() -> Result<Vec<u8>, CodecError> {
    let mut db = vec![0u8; 1000];
    wire::set_byte(&mut db, 0, 0b1010_1010)?;
    for (offset, value) in [(10, i8::MIN), (11, 0), (12, 100), (13, i8::MAX)] {
        wire::set_sint(&mut db, offset, value)?;
    }
    wire::set_usint(&mut db, 20, 0)?;
    wire::set_usint(&mut db, 21, u8::MAX)?;
    for (i, value) in [i16::MIN, -1234, 0, 1234, i16::MAX].into_iter().enumerate() {
        wire::set_int(&mut db, 30 + 2 * i, value)?;
    }
    for (i, value) in [i32::MIN, -32768, 0, 32767, i32::MAX].into_iter().enumerate() {
        wire::set_dint(&mut db, 40 + 4 * i, value)?;
    }
    let reals = [
        -3.402823e38,
        -3.402823e12,
        -1.175494351e-38,
        -1.175494351e-12,
        0.0,
        1.175494351e-38,
        1.175494351e-12,
        3.402823466e12,
        3.402823466e38,
    ];
    for (i, value) in reals.into_iter().enumerate() {
        wire::set_real(&mut db, 60 + 4 * i, value)?;
    }
    wire::set_string(&mut db, 100, "the brown fox jumps over the lazy dog", 254)?;
    for (i, value) in [0x0000, 0x1234, 0xABCD, 0xFFFF].into_iter().enumerate() {
        wire::set_word(&mut db, 400 + 4 * i, value)?;
    }
    for (i, value) in [0x0000_0000, 0x1234_5678, 0x1234_ABCD, 0xFFFF_FFFF]
        .into_iter()
        .enumerate()
    {
        wire::set_dword(&mut db, 500 + 8 * i, value)?;
    }
    Ok(db)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting S7 server");

    let args = Args::parse();
    log::debug!(
        "Parsed arguments: ip={}, port={}, size={}",
        args.ip,
        args.port,
        args.size
    );

    let server = Arc::new(Builder::new().local_port(args.port).build());
    server.register_area(Area::DB, 1, vec![0; args.size])?;
    server.register_area(Area::PA, 1, vec![0; args.size])?;
    server.register_area(Area::TM, 1, vec![0; args.size])?;
    server.register_area(Area::CT, 1, vec![0; args.size])?;
    if args.standard_values {
        log::info!("Registering DB0 with standard values");
        server.register_area(Area::DB, 0, standard_values()?)?;
    }

    server.start_to(args.ip, args.port)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Some(event) = server.pick_event() {
                    log::info!("{}", event_text(&event));
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                log::info!("Interrupted, stopping server");
                break;
            }
        }
    }

    let stopping = Arc::clone(&server);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    while let Some(event) = server.pick_event() {
        log::info!("{}", event_text(&event));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn standard_layout() {
        let db = standard_values().unwrap();
        assert_eq!(wire::get_int(&db, 32).unwrap(), -1234);
        assert_eq!(wire::get_dint(&db, 56).unwrap(), i32::MAX);
        assert_eq!(wire::get_real(&db, 76).unwrap(), 0.0);
        assert_eq!(
            wire::get_string(&db, 100).unwrap(),
            "the brown fox jumps over the lazy dog"
        );
        assert_eq!(wire::get_dword(&db, 508).unwrap(), 0x1234_5678);
    }

    #[test]
    fn arguments() {
        let args = Args::parse_from(["s7-server", "--port", "2102", "--standard-values"]);
        assert_eq!(args.port, 2102);
        assert_eq!(args.size, 100);
        assert!(args.standard_values);
    }
}
