//! UART page flash loader.
//!
//! Host side driver for a line oriented flash console that transfers one
//! 256 byte page per command. Every page transfer resets the link, sends a
//! command line, checks the echo and then exchanges the page, writes are
//! always verified by reading the page back.

use core::fmt;
use core::marker::PhantomData;

#[macro_use]
extern crate log;
use log::Level;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod bulk;
pub mod protocol;

#[cfg(test)]
mod mock;

pub use bulk::{page_count, Progress, Transfer};
use protocol::{AddressError, Command, CANCEL, CANCEL_RESPONSE_LEN, OK, PAGE_SIZE, READY};

/// Byte transport used to reach the flash console
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    /// Drop any bytes queued in the inbound and outbound buffers
    fn discard_buffers(&mut self) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("response timeout ({received} of {expected} bytes received)")]
    Timeout { expected: usize, received: usize },

    #[error("command echo not newline terminated")]
    BadEcho,

    #[error("unexpected response {received:02x?} (expected {expected:02x?})")]
    UnexpectedToken {
        expected: &'static [u8],
        received: Vec<u8>,
    },

    #[error("read back differs from written page at byte {offset}")]
    Verify { offset: usize },

    #[error("page data must be exactly {} bytes (got {0})", PAGE_SIZE)]
    PageLength(usize),

    #[error("{0}")]
    Address(AddressError),

    #[error("input ended before a full page")]
    InputSize,

    #[error("io error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for each console response, counted in poll periods
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for console responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for the board to come up after opening the port
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub settle_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3000,
            poll_delay_ms: 1,
            settle_delay_ms: 5000,
        }
    }
}

/// Sink for protocol diagnostics, `address` is the page being transferred
pub trait Diagnostics {
    fn record(&mut self, level: Level, address: Option<u32>, message: fmt::Arguments);
}

/// Forwards diagnostics to the `log` facade
#[derive(Copy, Clone, Default, Debug)]
pub struct LogSink;

impl Diagnostics for LogSink {
    fn record(&mut self, level: Level, address: Option<u32>, message: fmt::Arguments) {
        match address {
            Some(a) => log!(level, "[0x{:06X}] {}", a, message),
            None => log!(level, "{}", message),
        }
    }
}

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    diag: Box<dyn Diagnostics>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            diag: Box::new(LogSink),
            _err: PhantomData,
        }
    }

    /// Replace the diagnostics sink (defaults to [`LogSink`])
    pub fn set_diagnostics(&mut self, diag: Box<dyn Diagnostics>) {
        self.diag = diag;
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Wait for the board to settle after the port is opened, then reset the link
    pub fn init(&mut self) {
        let settle = self.options.settle_delay_ms;

        self.note(
            Level::Debug,
            None,
            format_args!("Waiting {} ms for the board to settle", settle),
        );
        self.delay.delay_ms(settle);

        self.reset_link();
    }

    /// Bring the link to a known empty state.
    ///
    /// Drops queued bytes, interrupts whatever the console is doing and
    /// swallows its acknowledgement. Best effort: a console in a bad state is
    /// caught by the following echo check.
    pub fn reset_link(&mut self) {
        if let Err(e) = self.port.discard_buffers() {
            self.note(Level::Debug, None, format_args!("Buffer reset failed: {:?}", e));
        }

        if let Err(e) = block!(self.port.write(CANCEL)) {
            self.note(Level::Debug, None, format_args!("Cancel write failed: {:?}", e));
        }

        let mut ack = [0u8; CANCEL_RESPONSE_LEN];
        if let Err(e) = self.read_exact(&mut ack) {
            self.note(Level::Debug, None, format_args!("No cancel acknowledgement: {}", e));
        }

        if let Err(e) = block!(self.port.flush()) {
            self.note(Level::Debug, None, format_args!("Flush failed: {:?}", e));
        }
    }

    /// Read a single page from the provided address
    pub fn read_page(&mut self, address: u32) -> Result<[u8; PAGE_SIZE], Error<E>> {
        protocol::validate_offset(address).map_err(Error::Address)?;

        self.reset_link();
        self.send_command(Command::ReadFlashPageRaw, address)?;

        let mut page = [0u8; PAGE_SIZE];
        if let Err(e) = self.read_exact(&mut page) {
            self.note(Level::Warn, Some(address), format_args!("Incomplete page read: {}", e));
            return Err(e);
        }

        self.note(Level::Debug, Some(address), format_args!("Read full page"));

        Ok(page)
    }

    /// Write a single page to the provided address and verify it by reading it back
    pub fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.len() != PAGE_SIZE {
            return Err(Error::PageLength(data.len()));
        }
        protocol::validate_offset(address).map_err(Error::Address)?;

        self.reset_link();
        self.send_command(Command::WriteFlashPageRaw, address)?;

        // Console must be ready before the payload goes out
        self.expect_token(address, READY)?;

        self.write_all(data)?;

        self.expect_token(address, OK)?;

        let readback = self.read_page(address)?;
        if let Some(offset) = data.iter().zip(readback.iter()).position(|(a, b)| a != b) {
            self.note(
                Level::Warn,
                Some(address),
                format_args!(
                    "Verification failed at byte {} (wrote 0x{:02x}, read 0x{:02x})",
                    offset, data[offset], readback[offset]
                ),
            );
            return Err(Error::Verify { offset });
        }

        self.note(Level::Debug, Some(address), format_args!("Write verification correct"));

        Ok(())
    }

    /// Send a command line and check its echo
    fn send_command(&mut self, command: Command, address: u32) -> Result<(), Error<E>> {
        let line = command.encode(address);

        self.note(
            Level::Debug,
            Some(address),
            format_args!("Sending command: {}", String::from_utf8_lossy(&line).trim_end()),
        );
        self.write_all(&line)?;

        let mut echo = vec![0u8; Command::echo_len(&line)];
        self.read_exact(&mut echo)?;

        if echo.last() != Some(&b'\n') {
            self.note(
                Level::Debug,
                Some(address),
                format_args!("Bad echo: {}", hex::encode(&echo)),
            );
            return Err(Error::BadEcho);
        }

        Ok(())
    }

    /// Read a status token and compare it against the expected literal
    fn expect_token(&mut self, address: u32, expected: &'static [u8]) -> Result<(), Error<E>> {
        let mut received = vec![0u8; expected.len()];
        self.read_exact(&mut received)?;

        if received != expected {
            self.note(
                Level::Debug,
                Some(address),
                format_args!(
                    "Unexpected response: {} (expected {})",
                    hex::encode(&received),
                    hex::encode(expected)
                ),
            );
            return Err(Error::UnexpectedToken { expected, received });
        }

        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Read exactly `buff.len()` bytes, polling until the response timeout elapses.
    ///
    /// The timeout covers the whole buffer rather than each byte. Only time
    /// spent in the poll delay is counted, so ports must return `WouldBlock`
    /// without waiting themselves.
    fn read_exact(&mut self, buff: &mut [u8]) -> Result<(), Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut n = 0;
        let mut t = 0;

        while n < buff.len() {
            match self.port.read() {
                Ok(v) => {
                    buff[n] = v;
                    n += 1;
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            if t >= self.options.response_timeout_ms {
                return Err(Error::Timeout {
                    expected: buff.len(),
                    received: n,
                });
            }

            // Wait for delay period
            self.delay.delay_ms(poll);
            t += poll;
        }

        Ok(())
    }

    fn note(&mut self, level: Level, address: Option<u32>, message: fmt::Arguments) {
        self.diag.record(level, address, message);
    }
}
