mod common;

use std::time::Duration;

use ecu_flash::kefex::segmented::WriteState;
use ecu_flash::kefex::{Error, KefexProtocol, KefexSettings, LockCategory};
use ecu_flash::types::ServerId;

use common::{init_logging, kefex_bus};

fn settings(block_size: u8) -> KefexSettings {
    KefexSettings {
        server_address: 5,
        block_size,
        timeout_ms: 100,
        ..Default::default()
    }
}

#[test]
fn logon_echoes_crc() {
    init_logging();
    let (dispatcher, server) = kefex_bus(settings(20));
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();

    protocol.logon(0xbeef).unwrap();
    assert_eq!(server.lock().logon_crc, Some(0xbeef));
    protocol.logoff().unwrap();
    assert_eq!(server.lock().logon_crc, None);
    assert_eq!(protocol.server_id(), ServerId { bus: 0, node: 5 });
}

#[test]
fn single_read() {
    let (dispatcher, server) = kefex_bus(settings(20));
    server.lock().variables.insert(0x0102, vec![0xfe, 0xff, 0xff, 0xff]);
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();

    assert_eq!(protocol.read(0x0102).unwrap(), -2);
    assert!(matches!(protocol.read(0x1_0000), Err(ecu_flash::Error::Range)));
}

#[test]
fn segmented_read_sends_flow_control_per_block() {
    init_logging();
    let (dispatcher, server) = kefex_bus(settings(2));
    let data: Vec<u8> = (0..30).collect();
    server.lock().variables.insert(0x20, data.clone());
    let protocol = KefexProtocol::new(dispatcher, settings(2)).unwrap();

    assert_eq!(protocol.segmented_read(0x20, 30).unwrap(), data);
    // 5 frames in blocks of 2: a grant before frames 1, 3 and 5
    assert_eq!(server.lock().read_flow_controls, 3);
}

#[test]
fn segmented_read_exact_block_needs_no_trailing_flow_control() {
    let (dispatcher, server) = kefex_bus(settings(2));
    let data: Vec<u8> = (0..24).collect();
    server.lock().variables.insert(0x21, data.clone());
    let protocol = KefexProtocol::new(dispatcher, settings(2)).unwrap();

    assert_eq!(protocol.segmented_read(0x21, 24).unwrap(), data);
    assert_eq!(server.lock().read_flow_controls, 2);
}

#[test]
fn segmented_read_size_mismatch_is_not_a_timeout() {
    let (dispatcher, server) = kefex_bus(settings(4));
    server.lock().variables.insert(0x22, vec![0; 12]);
    let protocol = KefexProtocol::new(dispatcher, settings(4)).unwrap();

    let err = protocol.segmented_read(0x22, 10).unwrap_err();
    assert!(matches!(
        err,
        ecu_flash::Error::KefexError(Error::SizeMismatch {
            expected: 10,
            actual: 12
        })
    ));
    assert!(!err.is_timeout());
}

#[test]
fn segmented_read_rejects_sequence_gap() {
    let (dispatcher, server) = kefex_bus(settings(8));
    server.lock().variables.insert(0x23, vec![0x55; 18]);
    server.lock().skip_read_sequence = true;
    let protocol = KefexProtocol::new(dispatcher, settings(8)).unwrap();

    assert!(matches!(
        protocol.segmented_read(0x23, 18),
        Err(ecu_flash::Error::KefexError(Error::SequenceMismatch {
            expected: 1,
            actual: 2
        }))
    ));
}

#[test]
fn segmented_read_unknown_variable_reports_reason() {
    let (dispatcher, _server) = kefex_bus(settings(8));
    let protocol = KefexProtocol::new(dispatcher, settings(8)).unwrap();

    let err = protocol.segmented_read(0x99, 8).unwrap_err();
    assert_eq!(err.reason_code(), Some(0x01));
}

#[test]
fn segmented_write_three_frames_block_size_two() {
    init_logging();
    let (dispatcher, server) = kefex_bus(settings(20));
    server.lock().write_block_size = 2;
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();

    let data: Vec<u8> = (1..=12).collect();
    protocol.segmented_write(0x30, &data).unwrap();

    let server = server.lock();
    assert_eq!(server.write_consecutive_frames, 3);
    // One grant after the first frame, one after frame 2, none after the last
    assert_eq!(server.write_flow_controls, 2);
    assert_eq!(server.variables[&0x30], data);
    assert_eq!(protocol.write_state(), WriteState::Done);
}

#[test]
fn segmented_write_unlimited_block_size() {
    let (dispatcher, server) = kefex_bus(settings(20));
    server.lock().write_block_size = 0;
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();

    let data = vec![0xa5; 40];
    protocol.segmented_write(0x31, &data).unwrap();
    assert_eq!(server.lock().write_flow_controls, 1);
    assert_eq!(server.lock().write_consecutive_frames, 8);
}

#[test]
fn segmented_read_sequence_wraps() {
    init_logging();
    let (dispatcher, server) = kefex_bus(settings(255));
    // 500 consecutive frames, the counter passes 255 once
    let data: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
    server.lock().variables.insert(0x40, data.clone());
    let protocol = KefexProtocol::new(dispatcher, settings(255)).unwrap();

    assert_eq!(protocol.segmented_read(0x40, 3000).unwrap(), data);
    assert_eq!(server.lock().read_flow_controls, 2);
}

#[test]
fn segmented_write_sequence_wraps() {
    let (dispatcher, server) = kefex_bus(settings(20));
    server.lock().write_block_size = 7;
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();

    let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    protocol.segmented_write(0x41, &data).unwrap();

    let server = server.lock();
    assert_eq!(server.write_consecutive_frames, 400);
    assert_eq!(server.write_flow_controls, 1 + 399 / 7);
    assert_eq!(server.variables[&0x41], data);
}

#[test]
fn segmented_transfer_sizes_and_block_sizes() {
    for size in [1usize, 5, 6, 7, 12, 13, 120, 121] {
        for block_size in [1u8, 2, 3, 20] {
            let data: Vec<u8> = (0..size).map(|i| i as u8 ^ 0x5a).collect();

            let (dispatcher, server) = kefex_bus(settings(block_size));
            server.lock().variables.insert(0x50, data.clone());
            server.lock().write_block_size = block_size;
            let protocol = KefexProtocol::new(dispatcher, settings(block_size)).unwrap();

            assert_eq!(protocol.segmented_read(0x50, size).unwrap(), data, "read {size}/{block_size}");
            let read_frames = size.div_ceil(6);
            assert_eq!(
                server.lock().read_flow_controls,
                read_frames.div_ceil(block_size as usize),
                "read {size}/{block_size}"
            );

            let written: Vec<u8> = data.iter().rev().copied().collect();
            protocol.segmented_write(0x51, &written).unwrap();
            let server = server.lock();
            let write_frames = size.div_ceil(5);
            assert_eq!(server.write_consecutive_frames, write_frames, "write {size}/{block_size}");
            assert_eq!(
                server.write_flow_controls,
                1 + (write_frames - 1) / block_size as usize,
                "write {size}/{block_size}"
            );
            assert_eq!(server.variables[&0x51], written);
        }
    }
}

#[test]
fn segmented_transfer_is_busy_while_one_runs() {
    let (dispatcher, _server) = kefex_bus(settings(20));
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();

    let _running = protocol.locks().try_acquire(LockCategory::SegmentedWrite).unwrap();
    assert!(matches!(
        protocol.segmented_write(0x30, &[1, 2, 3]),
        Err(ecu_flash::Error::Busy)
    ));
    // The other direction is independent
    assert!(!matches!(protocol.segmented_read(0x30, 3), Err(ecu_flash::Error::Busy)));
}

#[test]
fn segmented_index_out_of_range() {
    let (dispatcher, _server) = kefex_bus(settings(20));
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();
    assert!(matches!(
        protocol.segmented_write(0x1_0000, &[1]),
        Err(ecu_flash::Error::Range)
    ));
}

#[test]
fn ssl_write_memory() {
    init_logging();
    let (dispatcher, server) = kefex_bus(settings(20));
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();

    protocol.write_memory(0x8000_0000, &[1, 2, 3, 4, 5]).unwrap();
    let server = server.lock();
    let written: Vec<u8> = server.memory.range(0x8000_0000..).map(|(_, b)| *b).collect();
    assert_eq!(written, vec![1, 2, 3, 4, 5]);
}

#[test]
fn ssl_write_rejects_address_overflow() {
    let (dispatcher, _server) = kefex_bus(settings(20));
    let protocol = KefexProtocol::new(dispatcher, settings(20)).unwrap();
    assert!(matches!(
        protocol.write_eeprom(0xffff_fffe, &[1, 2, 3]),
        Err(ecu_flash::Error::Range)
    ));
}

#[test]
fn silent_server_times_out() {
    let (dispatcher, _server) = kefex_bus(settings(20));
    // Nobody answers on another server address
    let protocol = KefexProtocol::new(
        dispatcher,
        KefexSettings {
            server_address: 9,
            timeout_ms: 20,
            ..Default::default()
        },
    )
    .unwrap();

    let start = std::time::Instant::now();
    assert!(protocol.logon(0).unwrap_err().is_timeout());
    assert!(start.elapsed() >= Duration::from_millis(20));
}
