//! Register bus to the EC and pH probes (Modbus-RTU over RS-485).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Per-attempt response deadline.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

pub const EC_UNIT: u8 = 1;
pub const EC_REGISTERS: u16 = 3;
pub const PH_UNIT: u8 = 2;
pub const PH_REGISTERS: u16 = 2;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Frame(&'static str),
    #[error("device exception {0:#04x}")]
    Exception(u8),
    #[error("modbus: {0:?}")]
    Modbus(rmodbus::ErrorKind),
}

#[async_trait]
pub trait RegisterBus: Send + Sync {
    async fn read_input_registers(
        &self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, BusError>;
}

/// One read attempt bounded by [`RESPONSE_TIMEOUT`].
pub async fn poll(
    bus: &dyn RegisterBus,
    unit: u8,
    start: u16,
    count: u16,
) -> Result<Vec<u16>, BusError> {
    tokio::time::timeout(RESPONSE_TIMEOUT, bus.read_input_registers(unit, start, count))
        .await
        .unwrap_or(Err(BusError::Timeout(RESPONSE_TIMEOUT)))
}

// ---------------------------------------------------------------------------
// RTU framing
// ---------------------------------------------------------------------------

pub mod rtu {
    use super::BusError;
    use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};

    /// Header bytes needed before the reply length is known.
    pub const HEADER_LEN: usize = 3;

    /// An input-register read (function 0x04) and what its reply must match.
    pub struct ReadInputs {
        unit: u8,
        count: u16,
        request: ModbusRequest,
    }

    impl ReadInputs {
        /// Returns the request and the frame to put on the wire.
        pub fn new(unit: u8, start: u16, count: u16) -> Result<(Self, Vec<u8>), BusError> {
            let mut request = ModbusRequest::new(unit, ModbusProto::Rtu);
            let mut frame = Vec::with_capacity(8);
            request
                .generate_get_inputs(start, count, &mut frame)
                .map_err(BusError::Modbus)?;
            Ok((
                Self {
                    unit,
                    count,
                    request,
                },
                frame,
            ))
        }

        pub fn parse(&mut self, frame: &[u8]) -> Result<Vec<u16>, BusError> {
            if frame.first() != Some(&self.unit) {
                return Err(BusError::Frame("unexpected unit"));
            }
            let mut regs = Vec::with_capacity(self.count as usize);
            self.request
                .parse_u16(frame, &mut regs)
                .map_err(BusError::Modbus)?;
            let byte_count = frame.get(2).map(|b| *b as usize);
            if byte_count != Some(2 * self.count as usize) || regs.len() != self.count as usize {
                return Err(BusError::Frame("register count mismatch"));
            }
            Ok(regs)
        }
    }

    /// Full reply length, once [`HEADER_LEN`] bytes have arrived.
    pub fn expected_len(frame: &[u8]) -> Option<usize> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        guess_response_frame_len(frame, ModbusProto::Rtu)
            .ok()
            .map(usize::from)
    }
}

// ---------------------------------------------------------------------------
// Serial transport (rppal UART, RS-485 adapter)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use serial::SerialBus;

#[cfg(feature = "gpio")]
mod serial {
    use super::{rtu, BusError, RegisterBus, RESPONSE_TIMEOUT};
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use rppal::uart::{Parity, Uart};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::{Duration, Instant};

    pub struct SerialBus {
        uart: Arc<Mutex<Uart>>,
    }

    impl SerialBus {
        pub fn open(path: &str, baud: u32) -> Result<Self> {
            let mut uart = Uart::with_path(path, baud, Parity::None, 8, 1)
                .with_context(|| format!("opening serial port {path}"))?;
            uart.set_read_mode(0, Duration::from_millis(100))?;
            Ok(Self {
                uart: Arc::new(Mutex::new(uart)),
            })
        }
    }

    fn map_uart(e: rppal::uart::Error) -> BusError {
        match e {
            rppal::uart::Error::Io(io) => BusError::Io(io),
            other => BusError::Io(std::io::Error::other(other.to_string())),
        }
    }

    #[async_trait]
    impl RegisterBus for SerialBus {
        async fn read_input_registers(
            &self,
            unit: u8,
            start: u16,
            count: u16,
        ) -> Result<Vec<u16>, BusError> {
            let uart = Arc::clone(&self.uart);
            let (mut read, request) = rtu::ReadInputs::new(unit, start, count)?;

            let frame = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, BusError> {
                let mut uart = uart.lock().unwrap_or_else(PoisonError::into_inner);
                uart.flush(rppal::uart::Queue::Input).map_err(map_uart)?;
                uart.write(&request).map_err(map_uart)?;

                let deadline = Instant::now() + RESPONSE_TIMEOUT;
                let mut frame = Vec::with_capacity(rtu::HEADER_LEN + 2 * count as usize + 2);
                let mut buf = [0u8; 64];
                while Instant::now() < deadline {
                    let n = uart.read(&mut buf).map_err(map_uart)?;
                    frame.extend_from_slice(&buf[..n]);
                    if let Some(len) = rtu::expected_len(&frame) {
                        if frame.len() >= len {
                            frame.truncate(len);
                            break;
                        }
                    }
                }
                if frame.is_empty() {
                    return Err(BusError::Timeout(RESPONSE_TIMEOUT));
                }
                Ok(frame)
            })
            .await
            .map_err(|e| BusError::Io(std::io::Error::other(e.to_string())))??;

            read.parse(&frame)
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
