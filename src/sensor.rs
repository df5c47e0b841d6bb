use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use enum_primitive::FromPrimitive;
use log::{debug, trace, warn};
use serial::SerialPort;

use crate::commands::*;
use crate::error::SensorError;
use crate::measurement::Sample;

const PORT_SETTINGS: serial::PortSettings = serial::PortSettings {
    baud_rate: serial::Baud9600,
    char_size: serial::Bits8,
    parity: serial::ParityNone,
    stop_bits: serial::Stop1,
    flow_control: serial::FlowNone,
};

/// Something that can produce one particulate sample on demand.
pub trait Sensor {
    /// Blocks until the device delivers a sample.
    fn read(&mut self) -> Result<Sample, SensorError>;
}

/// SDS011 attached over a serial line.
///
/// The port is owned for the lifetime of the value and released on drop.
pub struct Sds011<P> {
    port: P,
    report_mode: ReportMode,
    frame_timeout: Duration,
    device_id: Option<[u8; 2]>,
}

impl Sds011<serial::SystemPort> {
    /// Opens and configures the device at `path` (9600 8N1).
    ///
    /// `poll_timeout` bounds a single blocking read on the port; waiting for a
    /// whole frame is bounded separately by [`Sds011::set_frame_timeout`].
    pub fn open(path: &Path, poll_timeout: Duration) -> Result<Self, SensorError> {
        let mut port = serial::open(path)?;
        port.configure(&PORT_SETTINGS)?;
        port.set_timeout(poll_timeout)?;
        debug!("opened {} at 9600 baud", path.display());
        Ok(Sds011::new(port))
    }
}

impl<P: Read + Write> Sds011<P> {
    pub fn new(port: P) -> Self {
        Sds011 {
            port,
            report_mode: ReportMode::Active,
            frame_timeout: Duration::from_secs(2),
            device_id: None,
        }
    }

    /// Upper bound on how long one reply or data frame may take to arrive.
    pub fn set_frame_timeout(&mut self, timeout: Duration) {
        self.frame_timeout = timeout;
    }

    pub fn report_mode(&self) -> ReportMode {
        self.report_mode
    }

    pub fn device_id(&self) -> Option<[u8; 2]> {
        self.device_id
    }

    /// Puts the fan and laser back into measuring state.
    pub fn wake(&mut self) -> Result<(), SensorError> {
        self.send(&SendData::set_work_state(WorkState::Measuring))?;
        Ok(())
    }

    pub fn set_report_mode(&mut self, mode: ReportMode) -> Result<(), SensorError> {
        self.send(&SendData::set_report_mode(mode))?;
        self.report_mode = mode;
        Ok(())
    }

    /// Sets the working period in minutes; 0 means continuous.
    pub fn set_duty_cycle(&mut self, minutes: u8) -> Result<(), SensorError> {
        if minutes > MAX_DUTY_CYCLE {
            warn!(
                "maximum duty cycle is {} minutes; received {}, using {}",
                MAX_DUTY_CYCLE, minutes, MAX_DUTY_CYCLE
            );
        }
        self.send(&SendData::set_duty_cycle(minutes))?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SensorError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn send(&mut self, send_data: &SendData) -> Result<[u8; RESPONSE_LENGTH], SensorError> {
        let bytes_to_write = send_data.to_command_data();
        debug!("command {:?}: {:02X?}", send_data.command, bytes_to_write);
        self.write_bytes(&bytes_to_write)?;
        if send_data.command == Command::Request {
            return self.get_response(None);
        }
        self.get_response(Some(send_data.command))
    }

    fn read_byte(&mut self, deadline: Instant) -> Result<u8, SensorError> {
        let mut buffer = [0u8; 1];
        loop {
            if Instant::now() > deadline {
                return Err(SensorError::Timeout);
            }
            match self.port.read(&mut buffer) {
                Ok(0) => return Err(SensorError::Timeout),
                Ok(_) => return Ok(buffer[0]),
                Err(err) if err.kind() == ErrorKind::TimedOut => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Waits for the next frame of the wanted kind.
    ///
    /// `None` waits for a data frame (`AA C0`), `Some(command)` for the
    /// setting reply (`AA C5`) to that command. Frames of the other kind are
    /// skipped.
    fn get_response(
        &mut self,
        command: Option<Command>,
    ) -> Result<[u8; RESPONSE_LENGTH], SensorError> {
        let deadline = Instant::now() + self.frame_timeout;
        let wanted = match command {
            None => Serial::ReceiveByte,
            Some(_) => Serial::ResponseByte,
        };

        let mut previous = 0u8;
        loop {
            let kind = self.read_byte(deadline)?;
            let after_start = previous == Serial::Start as u8 && kind != Serial::Start as u8;
            previous = kind;
            if !after_start {
                continue;
            }
            previous = 0;

            let mut frame = [0u8; RESPONSE_LENGTH];
            frame[0] = Serial::Start as u8;
            frame[1] = kind;
            for slot in frame.iter_mut().skip(2) {
                *slot = self.read_byte(deadline)?;
            }
            trace!("frame: {:02X?}", frame);
            check_frame(&frame)?;

            if Serial::from_u8(kind) != Some(wanted) {
                debug!("skipping frame of kind {:#04x}", kind);
                continue;
            }
            if let Some(command) = command {
                if frame[2] != command as u8 {
                    return Err(SensorError::UnexpectedReply {
                        expected: command,
                        actual: frame[2],
                    });
                }
            }
            self.remember_device(&frame)?;
            return Ok(frame);
        }
    }

    fn remember_device(&mut self, frame: &[u8; RESPONSE_LENGTH]) -> Result<(), SensorError> {
        let device_id = [frame[6], frame[7]];
        match self.device_id {
            None => {
                debug!("device id {:02x}{:02x}", device_id[0], device_id[1]);
                self.device_id = Some(device_id);
                Ok(())
            }
            Some(existing) if existing == device_id => Ok(()),
            Some(existing) => Err(SensorError::Frame(format!(
                "frame from device {:02x?} while talking to {:02x?}",
                device_id, existing
            ))),
        }
    }
}

impl<P: Read + Write> Sensor for Sds011<P> {
    fn read(&mut self) -> Result<Sample, SensorError> {
        let frame = if self.report_mode == ReportMode::Query {
            self.send(&SendData::request())?
        } else {
            self.get_response(None)?
        };
        decode_measurement(&frame)
    }
}
