use std::io::ErrorKind as IoErrorKind;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::protocol::PAGE_SIZE;
use crate::{Options, Programmer, SerialPort};

/// Most stale bytes dropped per buffer reset, a console that keeps talking
/// past this is left for the cancel byte to interrupt
pub const DRAIN_LIMIT: usize = 16 * PAGE_SIZE;

/// Read and drop pending bytes until the reader runs dry or `limit` bytes are gone
fn drain<R: std::io::Read>(r: &mut R, limit: usize) -> std::io::Result<usize> {
    let mut buff = [0u8; 64];
    let mut drained = 0;

    while drained < limit {
        let len = buff.len().min(limit - drained);
        match r.read(&mut buff[..len]) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(e) if e.kind() == IoErrorKind::TimedOut => break,
            Err(e) if e.kind() == IoErrorKind::WouldBlock => break,
            Err(e) if e.kind() == IoErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }

    Ok(drained)
}

impl SerialPort<IoErrorKind> for Serial {
    fn discard_buffers(&mut self) -> Result<(), IoErrorKind> {
        // No tcflush in serial-core, read until the port runs dry instead
        match drain(&mut self.0, DRAIN_LIMIT).map_err(|e| e.kind())? {
            0 => (),
            n if n >= DRAIN_LIMIT => debug!("Console still talking after {} stale bytes", n),
            n => trace!("Discarded {} stale bytes", n),
        }

        self.0.flush().map_err(|e| e.kind())
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        path: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(path.as_ref())?;

        // Apply settings (8N1, no flow control)
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads must not wait, the programmer polls and counts the response timeout
        port.0.set_timeout(Duration::from_millis(0))?;

        debug!("Opened {} at {} baud", path.as_ref().display(), baud);

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
