use hmbus::error::BusError;
use hmbus::protocol::*;
use hmbus::zone::{RunMode, SensorKind};

fn sample_block() -> Vec<u8> {
    let mut block = vec![0u8; 48];
    block[dcb::TARGET_TEMP] = 21;
    block[dcb::RUN_MODE] = 0;
    block[dcb::AIR_TEMP..dcb::AIR_TEMP + 2].copy_from_slice(&203i16.to_be_bytes());
    block[dcb::FLOOR_TEMP..dcb::FLOOR_TEMP + 2].copy_from_slice(&188i16.to_be_bytes());
    block[dcb::HEATING_STATE] = 1;
    block[dcb::HOTWATER_STATE] = 1;
    block
}

fn all_kinds() -> Vec<CommandKind> {
    vec![
        CommandKind::ReadZone { address: 1, sensor: SensorKind::Air },
        CommandKind::ReadZone { address: 12, sensor: SensorKind::Floor },
        CommandKind::WriteTarget { address: 3, target_c: 5 },
        CommandKind::WriteTarget { address: 3, target_c: 35 },
        CommandKind::WriteMode { address: 6, mode: RunMode::Frost },
        CommandKind::WriteMode { address: 6, mode: RunMode::On },
        CommandKind::ReadHotwater { address: 6 },
        CommandKind::WriteHotwater { address: 6, on: true },
        CommandKind::WriteHotwater { address: 6, on: false },
    ]
}

/// What a thermostat would answer to `request`.
fn respond(request: &RequestFrame) -> Vec<u8> {
    if request.function == FUNC_READ {
        encode_response(request.destination, FUNC_READ, &encode_read_payload(0, &sample_block()))
    } else {
        encode_response(request.destination, FUNC_WRITE, &[])
    }
}

#[test]
fn test_every_command_round_trips_through_a_thermostat() {
    for kind in all_kinds() {
        let command = Command::new(kind, Priority::Control);
        let request_bytes = encode(&command).unwrap();
        let request = decode_request(&request_bytes).unwrap();

        assert_eq!(request.destination, kind.address());
        assert_eq!(request.source, MASTER_ADDRESS);
        assert_eq!(request.function, kind.function());
        assert_eq!(usize::from(request_bytes[1]), request_bytes.len());

        let frame = decode(&respond(&request)).unwrap();
        let delta = interpret(&frame, &command).unwrap();
        match (kind, delta) {
            (CommandKind::ReadZone { sensor: SensorKind::Air, .. }, StateDelta::Zone(state)) => {
                assert_eq!(state.measured_decicelsius, 203);
                assert_eq!(state.target_c, 21);
                assert!(state.heating);
            }
            (CommandKind::ReadZone { sensor: SensorKind::Floor, .. }, StateDelta::Zone(state)) => {
                assert_eq!(state.measured_decicelsius, 188);
            }
            (CommandKind::WriteTarget { target_c, .. }, StateDelta::Target(got)) => assert_eq!(got, target_c),
            (CommandKind::WriteMode { mode, .. }, StateDelta::Mode(got)) => assert_eq!(got, mode),
            (CommandKind::ReadHotwater { .. }, StateDelta::Hotwater(on)) => assert!(on),
            (CommandKind::WriteHotwater { on, .. }, StateDelta::Hotwater(got)) => assert_eq!(got, on),
            (kind, delta) => panic!("{kind} produced {delta:?}"),
        }
    }
}

#[test]
fn test_write_payload_encodings() {
    let frost = encode(&Command::control(CommandKind::WriteMode { address: 6, mode: RunMode::Frost })).unwrap();
    let request = decode_request(&frost).unwrap();
    assert_eq!((request.start, request.length, request.payload.as_slice()), (23, 1, &[1u8][..]));

    let on = encode(&Command::control(CommandKind::WriteMode { address: 6, mode: RunMode::On })).unwrap();
    assert_eq!(decode_request(&on).unwrap().payload, vec![0]);

    let hot = encode(&Command::control(CommandKind::WriteHotwater { address: 6, on: true })).unwrap();
    let request = decode_request(&hot).unwrap();
    assert_eq!((request.start, request.payload.as_slice()), (42, &[1u8][..]));

    let read = encode(&Command::poll(CommandKind::ReadHotwater { address: 6 })).unwrap();
    assert_eq!(decode_request(&read).unwrap().length, READ_ALL);
}

#[test]
fn test_any_single_bit_flip_is_rejected() {
    let frames = [
        encode_response(4, FUNC_READ, &encode_read_payload(0, &sample_block())),
        encode_response(4, FUNC_WRITE, &[]),
    ];
    for frame in frames {
        assert!(decode(&frame).is_ok());
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut flipped = frame.clone();
                flipped[byte] ^= 1 << bit;
                let result = decode(&flipped);
                if byte == 1 || byte == 2 {
                    // The length field no longer matches what arrived.
                    assert!(
                        matches!(result, Err(BusError::LengthMismatch { .. })),
                        "flip of bit {bit} in length byte {byte}: {result:?}"
                    );
                } else {
                    assert!(
                        matches!(result, Err(BusError::ChecksumMismatch { .. })),
                        "flip of bit {bit} in byte {byte}: {result:?}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_decode_checks_length_before_checksum() {
    let mut frame = encode_response(4, FUNC_WRITE, &[]);
    frame.truncate(6);
    assert!(matches!(decode(&frame), Err(BusError::Truncated { len: 6, min: 7 })));

    let frame = encode_response(4, FUNC_READ, &encode_read_payload(0, &sample_block()));
    let short = &frame[..frame.len() - 1];
    assert!(matches!(decode(short), Err(BusError::LengthMismatch { .. })));
}

#[test]
fn test_alternate_master_address_is_accepted() {
    let mut frame = encode_response(4, FUNC_WRITE, &[]);
    frame[0] = ALT_MASTER_ADDRESS;
    let body = frame.len() - CRC_LEN;
    let crc = crc16(&frame[..body]).to_le_bytes();
    frame[body..].copy_from_slice(&crc);
    assert_eq!(decode(&frame).unwrap().destination, ALT_MASTER_ADDRESS);
}

#[test]
fn test_response_classification_is_retryable() {
    let ack = decode(&encode_response(4, FUNC_WRITE, &[])).unwrap();
    let read = Command::poll(CommandKind::ReadZone { address: 4, sensor: SensorKind::Air });
    let err = interpret(&ack, &read).unwrap_err();
    assert!(err.is_retryable());

    let err = decode(&[0x81, 0x07, 0x00, 0x04, 0x01, 0x00, 0x00]).unwrap_err();
    assert!(matches!(err, BusError::ChecksumMismatch { .. }));
    assert!(err.is_retryable());
}
