//! Heatmiser V3 frame codec.
//!
//! Pure functions only: [`encode`] turns a [`Command`] into request bytes,
//! [`decode`] validates a received response frame, and [`interpret`] maps a
//! validated frame onto zone or hot-water state for the command that caused
//! it. The controller side ([`decode_request`], [`encode_response`]) is used
//! by the in-crate simulator.

use crate::error::BusError;
use crate::zone::{RunMode, SensorKind, ZoneState, MAX_TARGET_C, MIN_TARGET_C};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};

pub const MASTER_ADDRESS: u8 = 0x81;
/// Some UH1 firmware answers to this address instead of `0x81`.
pub const ALT_MASTER_ADDRESS: u8 = 0xA0;

pub const FUNC_READ: u8 = 0x00;
pub const FUNC_WRITE: u8 = 0x01;

/// Read length meaning "the whole data block".
pub const READ_ALL: u16 = 0xFFFF;

pub const CRC_LEN: usize = 2;
pub const REQUEST_HEADER_LEN: usize = 8;
pub const RESPONSE_HEADER_LEN: usize = 5;
pub const MIN_RESPONSE_LEN: usize = RESPONSE_HEADER_LEN + CRC_LEN;
pub const WRITE_ACK_LEN: usize = MIN_RESPONSE_LEN;

/// The request length field is a single byte.
pub const MAX_REQUEST_LEN: usize = 255;
pub const MAX_REQUEST_PAYLOAD: usize = MAX_REQUEST_LEN - REQUEST_HEADER_LEN - CRC_LEN;
pub const MAX_RESPONSE_LEN: usize = 512;

pub type RequestBuffer = BoundedVec<u8, MAX_REQUEST_LEN>;

/// Offsets into the data block returned by a read.
pub mod dcb {
    pub const MODEL: usize = 4;
    pub const TARGET_TEMP: usize = 18;
    pub const ON_OFF: usize = 21;
    pub const RUN_MODE: usize = 23;
    pub const FLOOR_TEMP: usize = 30;
    pub const AIR_TEMP: usize = 32;
    pub const HEATING_STATE: usize = 35;
    pub const HOTWATER_STATE: usize = 36;

    pub const ZONE_MIN_LEN: usize = HEATING_STATE + 1;
    pub const HOTWATER_MIN_LEN: usize = HOTWATER_STATE + 1;
}

/// Start addresses for single-byte writes.
pub mod write_address {
    pub const TARGET_TEMP: u16 = 18;
    pub const RUN_MODE: u16 = 23;
    pub const HOTWATER: u16 = 42;

    pub const HOTWATER_ON: u8 = 1;
    pub const HOTWATER_OFF: u8 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// User-initiated state changes; always drained first.
    Control,
    /// Periodic status reads.
    Poll,
}

/// Submission sequence number; unique per arbiter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct CommandId(pub u64);

impl core::fmt::Display for CommandId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    ReadZone { address: u8, sensor: SensorKind },
    WriteTarget { address: u8, target_c: u8 },
    WriteMode { address: u8, mode: RunMode },
    ReadHotwater { address: u8 },
    WriteHotwater { address: u8, on: bool },
}

impl CommandKind {
    pub fn address(&self) -> u8 {
        match *self {
            CommandKind::ReadZone { address, .. }
            | CommandKind::WriteTarget { address, .. }
            | CommandKind::WriteMode { address, .. }
            | CommandKind::ReadHotwater { address }
            | CommandKind::WriteHotwater { address, .. } => address,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            CommandKind::WriteTarget { .. } | CommandKind::WriteMode { .. } | CommandKind::WriteHotwater { .. }
        )
    }

    pub fn function(&self) -> u8 {
        if self.is_write() {
            FUNC_WRITE
        } else {
            FUNC_READ
        }
    }
}

impl core::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CommandKind::ReadZone { address, .. } => write!(f, "read zone {address}"),
            CommandKind::WriteTarget { address, target_c } => write!(f, "zone {address} target {target_c}C"),
            CommandKind::WriteMode { address, mode } => write!(f, "zone {address} mode {mode:?}"),
            CommandKind::ReadHotwater { address } => write!(f, "read hot water on {address}"),
            CommandKind::WriteHotwater { address, on } => {
                write!(f, "hot water on {address} {}", if *on { "ON" } else { "OFF" })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    pub priority: Priority,
    pub retries: u32,
}

impl Command {
    pub fn new(kind: CommandKind, priority: Priority) -> Self {
        Self {
            id: CommandId::default(),
            kind,
            priority,
            retries: 0,
        }
    }

    pub fn control(kind: CommandKind) -> Self {
        Self::new(kind, Priority::Control)
    }

    pub fn poll(kind: CommandKind) -> Self {
        Self::new(kind, Priority::Poll)
    }
}

/// What a successful exchange changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateDelta {
    Zone(ZoneState),
    Target(u8),
    Mode(RunMode),
    Hotwater(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Decoded(StateDelta),
    Failed(BusError),
}

impl Outcome {
    pub fn is_decoded(&self) -> bool {
        matches!(self, Outcome::Decoded(_))
    }
}

/// A validated response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: u8,
    pub source: u8,
    pub function: u8,
    pub length: u16,
    pub payload: Vec<u8>,
    pub checksum: u16,
}

/// A validated request frame, as seen by the thermostat side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub destination: u8,
    pub source: u8,
    pub function: u8,
    pub start: u16,
    pub length: u16,
    pub payload: Vec<u8>,
}

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, MSB first, no final xor.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in bytes {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

pub fn encode(command: &Command) -> Result<RequestBuffer, BusError> {
    let address = command.kind.address();
    match command.kind {
        CommandKind::ReadZone { .. } | CommandKind::ReadHotwater { .. } => {
            encode_request(address, FUNC_READ, 0, &[])
        }
        CommandKind::WriteTarget { target_c, .. } => {
            if !(MIN_TARGET_C..=MAX_TARGET_C).contains(&target_c) {
                return Err(BusError::InvalidPayload(format!(
                    "target {target_c}C outside {MIN_TARGET_C}..={MAX_TARGET_C}"
                )));
            }
            encode_request(address, FUNC_WRITE, write_address::TARGET_TEMP, &[target_c])
        }
        CommandKind::WriteMode { mode, .. } => {
            encode_request(address, FUNC_WRITE, write_address::RUN_MODE, &[u8::from(mode.is_frost())])
        }
        CommandKind::WriteHotwater { on, .. } => {
            let value = if on { write_address::HOTWATER_ON } else { write_address::HOTWATER_OFF };
            encode_request(address, FUNC_WRITE, write_address::HOTWATER, &[value])
        }
    }
}

/// Build a raw request. Reads ignore `payload` and ask for the whole block.
pub fn encode_request(address: u8, function: u8, start: u16, payload: &[u8]) -> Result<RequestBuffer, BusError> {
    if address == 0 {
        return Err(BusError::InvalidPayload("address 0 is not a thermostat".into()));
    }
    let payload = if function == FUNC_READ { &[][..] } else { payload };
    if payload.len() > MAX_REQUEST_PAYLOAD {
        return Err(BusError::InvalidPayload(format!(
            "{} payload bytes exceed the {MAX_REQUEST_PAYLOAD} byte limit",
            payload.len()
        )));
    }

    let total = REQUEST_HEADER_LEN + payload.len() + CRC_LEN;
    let length = if function == FUNC_READ { READ_ALL } else { payload.len() as u16 };
    let start = start.to_le_bytes();
    let length = length.to_le_bytes();

    let mut frame = RequestBuffer::new();
    let header = [
        address,
        total as u8,
        MASTER_ADDRESS,
        function,
        start[0],
        start[1],
        length[0],
        length[1],
    ];
    frame.extend_from_slice(&header).map_err(|()| overflow())?;
    frame.extend_from_slice(payload).map_err(|()| overflow())?;
    let crc = crc16(&frame).to_le_bytes();
    frame.extend_from_slice(&crc).map_err(|()| overflow())?;
    Ok(frame)
}

fn overflow() -> BusError {
    BusError::InvalidPayload("request exceeds frame buffer".into())
}

/// Validate a response frame: minimum length, declared length, CRC, destination.
pub fn decode(bytes: &[u8]) -> Result<Frame, BusError> {
    if bytes.len() < MIN_RESPONSE_LEN {
        return Err(BusError::Truncated { len: bytes.len(), min: MIN_RESPONSE_LEN });
    }

    let declared = u16::from_le_bytes([bytes[1], bytes[2]]);
    if usize::from(declared) != bytes.len() {
        return Err(BusError::LengthMismatch { declared: usize::from(declared), actual: bytes.len() });
    }

    let body_len = bytes.len() - CRC_LEN;
    let received = u16::from_le_bytes([bytes[body_len], bytes[body_len + 1]]);
    let computed = crc16(&bytes[..body_len]);
    if computed != received {
        return Err(BusError::ChecksumMismatch { computed, received });
    }

    let destination = bytes[0];
    if destination != MASTER_ADDRESS && destination != ALT_MASTER_ADDRESS {
        return Err(BusError::ForeignDestination(destination));
    }

    Ok(Frame {
        destination,
        source: bytes[3],
        function: bytes[4],
        length: declared,
        payload: bytes[RESPONSE_HEADER_LEN..body_len].to_vec(),
        checksum: received,
    })
}

/// Map a validated frame onto state for the command that was sent.
pub fn interpret(frame: &Frame, command: &Command) -> Result<StateDelta, BusError> {
    let expected_function = command.kind.function();
    if frame.function != expected_function {
        return Err(BusError::UnexpectedFunctionCode { expected: expected_function, actual: frame.function });
    }
    let address = command.kind.address();
    if frame.source != address {
        return Err(BusError::UnexpectedAddress { expected: address, actual: frame.source });
    }

    match command.kind {
        CommandKind::ReadZone { sensor, .. } => {
            let block = data_block(&frame.payload, dcb::ZONE_MIN_LEN)?;
            let probe = match sensor {
                SensorKind::Air => dcb::AIR_TEMP,
                SensorKind::Floor => dcb::FLOOR_TEMP,
            };
            Ok(StateDelta::Zone(ZoneState {
                target_c: block[dcb::TARGET_TEMP],
                measured_decicelsius: i16::from_be_bytes([block[probe], block[probe + 1]]),
                mode: RunMode::from_frost_flag(block[dcb::RUN_MODE] != 0),
                heating: block[dcb::HEATING_STATE] != 0,
            }))
        }
        CommandKind::ReadHotwater { .. } => {
            let block = data_block(&frame.payload, dcb::HOTWATER_MIN_LEN)?;
            Ok(StateDelta::Hotwater(block[dcb::HOTWATER_STATE] != 0))
        }
        CommandKind::WriteTarget { target_c, .. } => write_ack(frame).map(|()| StateDelta::Target(target_c)),
        CommandKind::WriteMode { mode, .. } => write_ack(frame).map(|()| StateDelta::Mode(mode)),
        CommandKind::WriteHotwater { on, .. } => write_ack(frame).map(|()| StateDelta::Hotwater(on)),
    }
}

fn write_ack(frame: &Frame) -> Result<(), BusError> {
    if frame.payload.is_empty() {
        Ok(())
    } else {
        Err(BusError::LengthMismatch {
            declared: WRITE_ACK_LEN,
            actual: WRITE_ACK_LEN + frame.payload.len(),
        })
    }
}

/// Read payload layout: start (LE), block length (LE), block.
fn data_block(payload: &[u8], needed: usize) -> Result<&[u8], BusError> {
    if payload.len() < 4 {
        return Err(BusError::ShortDataBlock { len: payload.len(), needed });
    }
    let declared = usize::from(u16::from_le_bytes([payload[2], payload[3]]));
    let block = &payload[4..];
    if declared != block.len() {
        return Err(BusError::LengthMismatch { declared, actual: block.len() });
    }
    if block.len() < needed {
        return Err(BusError::ShortDataBlock { len: block.len(), needed });
    }
    Ok(block)
}

/// Build the payload a thermostat sends back for a read.
pub fn encode_read_payload(start: u16, block: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(block.len() + 4);
    payload.extend_from_slice(&start.to_le_bytes());
    payload.extend_from_slice(&(block.len() as u16).to_le_bytes());
    payload.extend_from_slice(block);
    payload
}

/// Build a response frame as a thermostat would.
pub fn encode_response(source: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let total = RESPONSE_HEADER_LEN + payload.len() + CRC_LEN;
    let length = (total as u16).to_le_bytes();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[MASTER_ADDRESS, length[0], length[1], source, function]);
    frame.extend_from_slice(payload);
    let crc = crc16(&frame).to_le_bytes();
    frame.extend_from_slice(&crc);
    frame
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame, BusError> {
    let min = REQUEST_HEADER_LEN + CRC_LEN;
    if bytes.len() < min {
        return Err(BusError::Truncated { len: bytes.len(), min });
    }
    let declared = usize::from(bytes[1]);
    if declared != bytes.len() {
        return Err(BusError::LengthMismatch { declared, actual: bytes.len() });
    }
    let body_len = bytes.len() - CRC_LEN;
    let received = u16::from_le_bytes([bytes[body_len], bytes[body_len + 1]]);
    let computed = crc16(&bytes[..body_len]);
    if computed != received {
        return Err(BusError::ChecksumMismatch { computed, received });
    }
    Ok(RequestFrame {
        destination: bytes[0],
        source: bytes[2],
        function: bytes[3],
        start: u16::from_le_bytes([bytes[4], bytes[5]]),
        length: u16::from_le_bytes([bytes[6], bytes[7]]),
        payload: bytes[REQUEST_HEADER_LEN..body_len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(target: u8, air: i16, floor: i16, frost: bool, heating: bool, hotwater: bool) -> Vec<u8> {
        let mut block = vec![0u8; 64];
        block[dcb::TARGET_TEMP] = target;
        block[dcb::RUN_MODE] = u8::from(frost);
        block[dcb::AIR_TEMP..dcb::AIR_TEMP + 2].copy_from_slice(&air.to_be_bytes());
        block[dcb::FLOOR_TEMP..dcb::FLOOR_TEMP + 2].copy_from_slice(&floor.to_be_bytes());
        block[dcb::HEATING_STATE] = u8::from(heating);
        block[dcb::HOTWATER_STATE] = u8::from(hotwater);
        block
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_read_request_layout() {
        let command = Command::poll(CommandKind::ReadZone { address: 3, sensor: SensorKind::Air });
        let frame = encode(&command).unwrap();
        assert_eq!(&frame[..8], &[3, 10, MASTER_ADDRESS, FUNC_READ, 0, 0, 0xFF, 0xFF]);
        assert_eq!(frame.len(), 10);
        let crc = crc16(&frame[..8]).to_le_bytes();
        assert_eq!(&frame[8..], &crc);
    }

    #[test]
    fn test_write_target_layout() {
        let command = Command::control(CommandKind::WriteTarget { address: 2, target_c: 21 });
        let frame = encode(&command).unwrap();
        assert_eq!(&frame[..9], &[2, 11, MASTER_ADDRESS, FUNC_WRITE, 18, 0, 1, 0, 21]);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let command = Command::control(CommandKind::WriteHotwater { address: 6, on: true });
        assert_eq!(encode(&command).unwrap(), encode(&command).unwrap());
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        let zero = Command::control(CommandKind::WriteMode { address: 0, mode: RunMode::On });
        assert!(matches!(encode(&zero), Err(BusError::InvalidPayload(_))));

        let hot = Command::control(CommandKind::WriteTarget { address: 1, target_c: 60 });
        assert!(matches!(encode(&hot), Err(BusError::InvalidPayload(_))));

        let oversized = vec![0u8; MAX_REQUEST_PAYLOAD + 1];
        assert!(matches!(
            encode_request(1, FUNC_WRITE, 0, &oversized),
            Err(BusError::InvalidPayload(_))
        ));
        assert!(encode_request(1, FUNC_WRITE, 0, &oversized[..MAX_REQUEST_PAYLOAD]).is_ok());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode(&[0x81, 7, 0]), Err(BusError::Truncated { len: 3, .. })));

        let mut frame = encode_response(1, FUNC_WRITE, &[]);
        frame.push(0);
        assert!(matches!(decode(&frame), Err(BusError::LengthMismatch { declared: 7, actual: 8 })));

        let mut frame = encode_response(1, FUNC_WRITE, &[]);
        frame[6] ^= 0xFF;
        assert!(matches!(decode(&frame), Err(BusError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_decode_rejects_foreign_destination() {
        let mut frame = encode_response(1, FUNC_WRITE, &[]);
        frame[0] = 0x05;
        let crc = crc16(&frame[..5]).to_le_bytes();
        frame[5..].copy_from_slice(&crc);
        assert_eq!(decode(&frame), Err(BusError::ForeignDestination(0x05)));
    }

    #[test]
    fn test_interpret_honors_sensor_kind() {
        let block = block_with(22, 205, 181, false, true, false);
        let raw = encode_response(4, FUNC_READ, &encode_read_payload(0, &block));
        let frame = decode(&raw).unwrap();

        let air = Command::poll(CommandKind::ReadZone { address: 4, sensor: SensorKind::Air });
        let floor = Command::poll(CommandKind::ReadZone { address: 4, sensor: SensorKind::Floor });

        match interpret(&frame, &air).unwrap() {
            StateDelta::Zone(state) => {
                assert_eq!(state.target_c, 22);
                assert_eq!(state.measured_decicelsius, 205);
                assert_eq!(state.mode, RunMode::On);
                assert!(state.heating);
            }
            other => panic!("unexpected delta {other:?}"),
        }
        match interpret(&frame, &floor).unwrap() {
            StateDelta::Zone(state) => assert_eq!(state.measured_decicelsius, 181),
            other => panic!("unexpected delta {other:?}"),
        }
    }

    #[test]
    fn test_interpret_rejects_mismatched_response() {
        let ack = decode(&encode_response(4, FUNC_WRITE, &[])).unwrap();
        let read = Command::poll(CommandKind::ReadZone { address: 4, sensor: SensorKind::Air });
        assert_eq!(
            interpret(&ack, &read),
            Err(BusError::UnexpectedFunctionCode { expected: FUNC_READ, actual: FUNC_WRITE })
        );

        let write = Command::control(CommandKind::WriteMode { address: 5, mode: RunMode::Frost });
        assert_eq!(interpret(&ack, &write), Err(BusError::UnexpectedAddress { expected: 5, actual: 4 }));
    }

    #[test]
    fn test_interpret_short_block() {
        let raw = encode_response(6, FUNC_READ, &encode_read_payload(0, &[0u8; 36]));
        let frame = decode(&raw).unwrap();
        let zone = Command::poll(CommandKind::ReadZone { address: 6, sensor: SensorKind::Air });
        assert!(interpret(&frame, &zone).is_ok());
        let hotwater = Command::poll(CommandKind::ReadHotwater { address: 6 });
        assert_eq!(interpret(&frame, &hotwater), Err(BusError::ShortDataBlock { len: 36, needed: 37 }));
    }

    #[test]
    fn test_write_ack_with_payload_is_rejected() {
        let frame = decode(&encode_response(6, FUNC_WRITE, &[1])).unwrap();
        let write = Command::control(CommandKind::WriteHotwater { address: 6, on: false });
        assert!(matches!(interpret(&frame, &write), Err(BusError::LengthMismatch { .. })));
    }

    #[test]
    fn test_request_decodes_on_controller_side() {
        let command = Command::control(CommandKind::WriteHotwater { address: 6, on: false });
        let request = decode_request(&encode(&command).unwrap()).unwrap();
        assert_eq!(request.destination, 6);
        assert_eq!(request.source, MASTER_ADDRESS);
        assert_eq!(request.function, FUNC_WRITE);
        assert_eq!(request.start, write_address::HOTWATER);
        assert_eq!(request.payload, vec![write_address::HOTWATER_OFF]);
    }
}
