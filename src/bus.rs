//! ==============================================================================
//! bus.rs - field bus client (modbus rtu over rs-485)
//! ==============================================================================
//!
//! purpose:
//!     owns the single request/response link to the sensor bus and exposes one
//!     operation: read N holding registers at an address from a unit.
//!
//! contract:
//!     - connect() is idempotent and reports success as a bool.
//!     - read() never panics or propagates past this boundary; it returns a
//!       typed BusError.
//!     - if the link is closed when a read is attempted, exactly one reconnect
//!       is tried. there is no retry loop in here: the acquisition loop owns
//!       back-off.
//!     - every operation is bounded by the configured timeout.
//!     - a timeout, framing or i/o error closes the link, so a late reply
//!       can never be read as the next unit's response.
//!
//! relationships:
//!     - used by: sensors.rs (register reads), acquisition.rs (connect/close)
//!     - uses: tokio-serial + tokio-modbus (RtuTransport)
//!
//! ==============================================================================

use async_trait::async_trait;
use std::ops::Deref;
use std::time::Duration;
use tokio::time;
use tokio_modbus::client::{rtu, Context};
use tokio_modbus::prelude::{Reader, Slave, SlaveContext};
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};

use crate::config::BusConfig;
use crate::error::BusError;

// ==============================================================================
// transport seam
// ==============================================================================
// the client talks to a Transport so tests can script register responses
// without a serial adapter attached.

#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<(), BusError>;
    fn is_open(&self) -> bool;
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, BusError>;
    async fn close(&mut self);
}

/// registers returned by one successful read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock(Vec<u16>);

impl RegisterBlock {
    pub fn new(registers: Vec<u16>) -> Self {
        Self(registers)
    }
}

impl Deref for RegisterBlock {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        &self.0
    }
}

// ==============================================================================
// rtu transport - the real serial line
// ==============================================================================

pub struct RtuTransport {
    port: String,
    baud_rate: u32,
    parity: Parity,
    stop_bits: StopBits,
    data_bits: DataBits,
    timeout: Duration,
    ctx: Option<Context>,
}

impl RtuTransport {
    pub fn new(config: &BusConfig) -> Result<Self, BusError> {
        let parity = match config.parity.to_ascii_uppercase().as_str() {
            "N" => Parity::None,
            "E" => Parity::Even,
            "O" => Parity::Odd,
            other => return Err(BusError::Config(format!("parity {other:?}"))),
        };
        let stop_bits = match config.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => return Err(BusError::Config(format!("stop bits {other}"))),
        };
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(BusError::Config(format!("data bits {other}"))),
        };

        Ok(Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            parity,
            stop_bits,
            data_bits,
            timeout: config.timeout(),
            ctx: None,
        })
    }
}

#[async_trait]
impl Transport for RtuTransport {
    async fn open(&mut self) -> Result<(), BusError> {
        let builder = tokio_serial::new(&self.port, self.baud_rate)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .data_bits(self.data_bits)
            .timeout(self.timeout);
        let stream = SerialStream::open(&builder).map_err(|e| BusError::Io(e.to_string()))?;
        self.ctx = Some(rtu::attach(stream));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, BusError> {
        let ctx = self.ctx.as_mut().ok_or(BusError::NotConnected)?;
        ctx.set_slave(Slave(unit));
        match ctx.read_holding_registers(address, count).await {
            Ok(Ok(registers)) => Ok(registers),
            Ok(Err(exception)) => Err(BusError::Exception(format!("{exception:?}"))),
            Err(tokio_modbus::Error::Transport(e)) => Err(BusError::Io(e.to_string())),
            Err(tokio_modbus::Error::Protocol(e)) => Err(BusError::Protocol(e.to_string())),
        }
    }

    async fn close(&mut self) {
        // dropping the context releases the serial port
        self.ctx = None;
    }
}

// ==============================================================================
// bus client
// ==============================================================================

pub struct BusClient<T: Transport> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> BusClient<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// open the link if it is not already open.
    pub async fn connect(&mut self) -> bool {
        if self.transport.is_open() {
            return true;
        }
        match time::timeout(self.timeout, self.transport.open()).await {
            Ok(Ok(())) => {
                tracing::info!("bus connected");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "bus connect failed");
                false
            }
            Err(_) => {
                tracing::warn!("bus connect timed out");
                false
            }
        }
    }

    /// read `count` holding registers starting at `address` from `unit`
    pub async fn read(&mut self, unit: u8, address: u16, count: u16) -> Result<RegisterBlock, BusError> {
        if !self.transport.is_open() && !self.connect().await {
            return Err(BusError::NotConnected);
        }

        let result = match time::timeout(
            self.timeout,
            self.transport.read_holding_registers(unit, address, count),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout),
        };

        match result {
            Ok(registers) if registers.len() < count as usize => Err(BusError::ShortResponse {
                expected: count,
                got: registers.len(),
            }),
            Ok(registers) => Ok(RegisterBlock::new(registers)),
            Err(e) => {
                if e.invalidates_link() {
                    tracing::warn!(unit, error = %e, "bus link out of step, closing");
                    self.transport.close().await;
                }
                Err(e)
            }
        }
    }

    pub async fn close(&mut self) {
        if self.transport.is_open() {
            self.transport.close().await;
            tracing::info!("bus connection closed");
        }
    }
}

// ==============================================================================
// scripted transport for tests
// ==============================================================================
