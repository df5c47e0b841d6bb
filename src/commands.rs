use enum_primitive::FromPrimitive;

use crate::error::SensorError;
use crate::measurement::Sample;

// Constants
enum_from_primitive! {
#[repr(u8)]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Serial {
    Start = 0xAA,
    End = 0xAB,
    SendByte = 0xB4,
    ResponseByte = 0xC5,
    ReceiveByte = 0xC0,
    CommandTerminator = 0xFF
}}

pub const RESPONSE_LENGTH: usize = 10;
pub const COMMAND_LENGTH: usize = 19;

/// Longest duty cycle the firmware accepts, in minutes.
pub const MAX_DUTY_CYCLE: u8 = 30;

// Enumeration of SDS011 commands
enum_from_primitive! {
#[repr(u8)]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    ReportMode = 2,
    Request = 4,
    DeviceId = 5,
    WorkState = 6,
    Firmware = 7,
    DutyCycle = 8
}}

// Command to get the current configuration or set it
enum_from_primitive! {
#[repr(u8)]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CommandMode {
    Getting = 0,
    Setting = 1
}}

//Report modes of the sensor:
//In active mode the sensor pushes a data frame every duty cycle,
//in query mode one has to send a request command to get one.
enum_from_primitive! {
#[repr(u8)]
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum ReportMode {
    Active = 0,
    Query = 1
}}

//the Work states:
//In sleeping mode it does not send any data, the fan is turned off.
//To get data one has to wake it up
enum_from_primitive! {
#[repr(u8)]
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum WorkState {
    Sleeping = 0,
    Measuring = 1
}}

pub struct SendData {
    pub command: Command,
    mode: CommandMode,
    data: Vec<u8>,
}

impl SendData {
    pub fn request() -> Self {
        SendData {
            command: Command::Request,
            mode: CommandMode::Getting,
            data: Vec::new(),
        }
    }

    pub fn set_report_mode(mode: ReportMode) -> Self {
        SendData::new(Command::ReportMode, CommandMode::Setting, mode as u8)
    }

    pub fn set_duty_cycle(minutes: u8) -> Self {
        SendData::new(
            Command::DutyCycle,
            CommandMode::Setting,
            minutes.min(MAX_DUTY_CYCLE),
        )
    }

    pub fn set_work_state(work_state: WorkState) -> Self {
        SendData::new(Command::WorkState, CommandMode::Setting, work_state as u8)
    }

    pub fn new(command: Command, mode: CommandMode, value: u8) -> Self {
        SendData {
            command,
            mode,
            data: vec![value],
        }
    }

    /// Builds the 19 byte frame, addressed to every device (`FF FF`).
    pub fn to_command_data(&self) -> Vec<u8> {
        let mut bytes_to_send: Vec<u8> = vec![
            Serial::Start as u8,
            Serial::SendByte as u8,
            self.command as u8,
        ];
        // the request command has no mode byte; its payload starts right away
        if self.command != Command::Request {
            bytes_to_send.push(self.mode as u8);
        }
        bytes_to_send.extend(self.data.iter().cloned());
        bytes_to_send.resize(COMMAND_LENGTH - 4, 0);
        bytes_to_send.push(Serial::CommandTerminator as u8);
        bytes_to_send.push(Serial::CommandTerminator as u8);

        let checksum = generate_checksum(&bytes_to_send[2..]);
        bytes_to_send.push(checksum);
        bytes_to_send.push(Serial::End as u8);

        debug_assert_eq!(bytes_to_send.len(), COMMAND_LENGTH);
        bytes_to_send
    }
}

/// Low byte of the sum of the payload bytes.
pub fn generate_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Validates the framing and checksum of a 10 byte reply.
pub fn check_frame(frame: &[u8; RESPONSE_LENGTH]) -> Result<(), SensorError> {
    if Serial::from_u8(frame[0]) != Some(Serial::Start) {
        return Err(SensorError::Frame(format!(
            "missing start byte, got {:#04x}",
            frame[0]
        )));
    }
    if Serial::from_u8(frame[9]) != Some(Serial::End) {
        return Err(SensorError::Frame(format!(
            "missing end byte, got {:#04x}",
            frame[9]
        )));
    }
    let expected = generate_checksum(&frame[2..8]);
    if expected != frame[8] {
        return Err(SensorError::Checksum {
            expected,
            actual: frame[8],
        });
    }
    Ok(())
}

/// Decodes a `AA C0` data frame.
///
/// Byte positions:
/// 2,3 PM2.5 low/high, 4,5 PM10 low/high, 6,7 device id, 8 checksum.
pub fn decode_measurement(frame: &[u8; RESPONSE_LENGTH]) -> Result<Sample, SensorError> {
    check_frame(frame)?;
    if Serial::from_u8(frame[1]) != Some(Serial::ReceiveByte) {
        return Err(SensorError::Frame(format!(
            "expected a data frame, got kind {:#04x}",
            frame[1]
        )));
    }
    let pm2_5 = f64::from(u16::from_le_bytes([frame[2], frame[3]])) / 10.0;
    let pm10 = f64::from(u16::from_le_bytes([frame[4], frame[5]])) / 10.0;
    Ok(Sample {
        pm2_5,
        pm10,
        device_id: [frame[6], frame[7]],
    })
}

#[cfg(test)]
pub(crate) fn data_frame(pm2_5_tenths: u16, pm10_tenths: u16, device_id: [u8; 2]) -> Vec<u8> {
    let mut frame = vec![Serial::Start as u8, Serial::ReceiveByte as u8];
    frame.extend_from_slice(&pm2_5_tenths.to_le_bytes());
    frame.extend_from_slice(&pm10_tenths.to_le_bytes());
    frame.extend_from_slice(&device_id);
    let checksum = generate_checksum(&frame[2..]);
    frame.push(checksum);
    frame.push(Serial::End as u8);
    frame
}
