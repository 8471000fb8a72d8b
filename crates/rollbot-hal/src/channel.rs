//! [`RegisterChannel`] – serialized register transactions against one device.
//!
//! Every microcontroller on the robot exposes a set of numbered registers,
//! each read or written as a fixed-layout little-endian payload.  The channel
//! owns the device address and the exclusive-access lock; the byte transport
//! itself is abstracted behind the [`RegisterBus`] trait so the rest of the
//! stack never depends on a concrete bus driver.
//!
//! A channel built with [`RegisterChannel::simulated`] has no transport at
//! all: writes are discarded and reads return zero-filled buffers.  Every
//! higher layer can therefore run (and be tested) without hardware.
//!
//! # Example
//!
//! ```rust
//! use rollbot_hal::channel::{register, RegisterChannel};
//!
//! let channel = RegisterChannel::simulated(0x42);
//! channel.write_f32s(register(1, 0).unwrap(), &[100.0, 0.5]).unwrap();
//!
//! // Simulate mode never stores anything.
//! let back = channel.read_f32s::<2>(register(3, 1).unwrap()).unwrap();
//! assert_eq!(back, [0.0, 0.0]);
//! ```

use std::io;
use std::sync::{Mutex, PoisonError};

use rollbot_types::RobotError;
use tracing::trace;

// ────────────────────────────────────────────────────────────────────────────
// Transport
// ────────────────────────────────────────────────────────────────────────────

/// Byte-level transport for register-addressed block transfers
/// (SMBus/I2C block read and write, or any bus with the same shape).
///
/// Implementations perform exactly one transaction per call and never retry.
pub trait RegisterBus: Send {
    /// Write `data` to `register` on the device at `address`.
    fn write_block(&mut self, address: u8, register: u8, data: &[u8]) -> io::Result<()>;

    /// Fill `buf` from `register` on the device at `address`.
    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> io::Result<()>;
}

/// Build a register address from a base register and a sub-address:
/// `base | (sub << 4)`.
///
/// # Errors
///
/// Returns [`RobotError::Validation`] when either nibble does not fit in
/// four bits.
pub fn register(base: u8, sub: u8) -> Result<u8, RobotError> {
    if base > 0x0f || sub > 0x0f {
        return Err(RobotError::validation(format!(
            "register base {base} / sub-address {sub} out of range (0..16)"
        )));
    }
    Ok(base | (sub << 4))
}

// ────────────────────────────────────────────────────────────────────────────
// Payload codec
// ────────────────────────────────────────────────────────────────────────────

/// Encode `values` as consecutive little-endian `f32`s.
pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode exactly `N` little-endian `f32`s from `bytes`.
///
/// # Errors
///
/// Returns [`RobotError::Validation`] when the payload length is not `4 * N`.
pub fn decode_f32s<const N: usize>(bytes: &[u8]) -> Result<[f32; N], RobotError> {
    let words = decode_words::<N>(bytes)?;
    Ok(words.map(f32::from_le_bytes))
}

fn decode_words<const N: usize>(bytes: &[u8]) -> Result<[[u8; 4]; N], RobotError> {
    if bytes.len() != N * 4 {
        return Err(RobotError::validation(format!(
            "expected {} payload bytes, got {}",
            N * 4,
            bytes.len()
        )));
    }
    let mut out = [[0u8; 4]; N];
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        word.copy_from_slice(chunk);
    }
    Ok(out)
}

// ────────────────────────────────────────────────────────────────────────────
// RegisterChannel
// ────────────────────────────────────────────────────────────────────────────

/// Handle to one addressed device on a shared bus.
///
/// All transactions are serialized by an internal lock, so a channel can be
/// shared between threads behind an `Arc`.
pub struct RegisterChannel {
    address: u8,
    /// `None` in simulate mode.
    bus: Option<Mutex<Box<dyn RegisterBus>>>,
}

impl RegisterChannel {
    /// Create a channel talking to `address` over `bus`.
    pub fn new(address: u8, bus: Box<dyn RegisterBus>) -> Self {
        Self {
            address,
            bus: Some(Mutex::new(bus)),
        }
    }

    /// Create a channel with no physical transport.
    pub fn simulated(address: u8) -> Self {
        Self { address, bus: None }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// True when no transport is attached.
    pub fn is_simulated(&self) -> bool {
        self.bus.is_none()
    }

    /// Write a raw payload to `register`.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Communication`] when the transport fails.
    pub fn write(&self, register: u8, data: &[u8]) -> Result<(), RobotError> {
        let Some(bus) = &self.bus else {
            return Ok(());
        };
        trace!(address = self.address, register, len = data.len(), "register write");
        let mut bus = bus.lock().unwrap_or_else(PoisonError::into_inner);
        bus.write_block(self.address, register, data)
            .map_err(|e| self.comm_error("write", register, e))
    }

    /// Read `len` bytes from `register`.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Communication`] when the transport fails.
    pub fn read(&self, register: u8, len: usize) -> Result<Vec<u8>, RobotError> {
        let mut buf = vec![0u8; len];
        let Some(bus) = &self.bus else {
            return Ok(buf);
        };
        trace!(address = self.address, register, len, "register read");
        let mut bus = bus.lock().unwrap_or_else(PoisonError::into_inner);
        bus.read_block(self.address, register, &mut buf)
            .map_err(|e| self.comm_error("read", register, e))?;
        Ok(buf)
    }

    /// Write an empty payload (a bare command).
    pub fn write_command(&self, register: u8) -> Result<(), RobotError> {
        self.write(register, &[])
    }

    pub fn write_bool(&self, register: u8, value: bool) -> Result<(), RobotError> {
        self.write(register, &[u8::from(value)])
    }

    /// Read a one-byte flag; any value other than `1` is `false`.
    pub fn read_bool(&self, register: u8) -> Result<bool, RobotError> {
        Ok(self.read_u8(register)? == 1)
    }

    pub fn read_u8(&self, register: u8) -> Result<u8, RobotError> {
        let bytes = self.read(register, 1)?;
        Ok(bytes[0])
    }

    pub fn write_f32s(&self, register: u8, values: &[f32]) -> Result<(), RobotError> {
        self.write(register, &encode_f32s(values))
    }

    pub fn read_f32s<const N: usize>(&self, register: u8) -> Result<[f32; N], RobotError> {
        let bytes = self.read(register, N * 4)?;
        decode_f32s(&bytes)
    }

    pub fn read_i32s<const N: usize>(&self, register: u8) -> Result<[i32; N], RobotError> {
        let bytes = self.read(register, N * 4)?;
        Ok(decode_words::<N>(&bytes)?.map(i32::from_le_bytes))
    }

    fn comm_error(&self, op: &str, register: u8, err: io::Error) -> RobotError {
        RobotError::Communication {
            address: self.address,
            details: format!("{op} of register 0x{register:02x} failed: {err}"),
        }
    }
}

impl std::fmt::Debug for RegisterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterChannel")
            .field("address", &self.address)
            .field("simulated", &self.is_simulated())
            .finish()
    }
}
