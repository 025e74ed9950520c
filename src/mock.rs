//! Simulated flash console for exercising the programmer without hardware.

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::{CANCEL, FLASH_SIZE, OK, PAGE_SIZE, READY};
use crate::SerialPort;

#[derive(Clone, PartialEq, Debug)]
pub struct MockError;

/// Misbehaviours the simulated console can be told to exhibit
#[derive(Clone, Default, Debug)]
pub struct Faults {
    /// Only send this many bytes of each page
    pub truncate_page: Option<usize>,
    /// Terminate echoes with `?` instead of a newline
    pub bad_echo: bool,
    /// Answer write commands with an error instead of `READY`
    pub not_ready: bool,
    /// Swallow the write payload without acknowledging it
    pub no_ack: bool,
    /// Do not answer the cancel byte
    pub silent_cancel: bool,
    /// Flip the byte at (page address, offset) whenever that page is read
    pub corrupt_readback: Option<(u32, usize)>,
}

pub struct Remote {
    pub faults: Faults,
    flash: Vec<u8>,
    rx: VecDeque<u8>,
    line: Vec<u8>,
    payload: Option<(u32, Vec<u8>)>,

    /// Command lines received, without the terminator
    pub commands: Vec<String>,
    /// Page payload bytes received
    pub payload_bytes: usize,
    /// Cancel bytes received
    pub cancels: usize,
    /// Total bytes written by the host
    pub written: usize,
}

impl Remote {
    pub fn new(faults: Faults) -> Self {
        Self {
            faults,
            flash: vec![0xFF; FLASH_SIZE as usize],
            rx: VecDeque::new(),
            line: Vec::new(),
            payload: None,
            commands: Vec::new(),
            payload_bytes: 0,
            cancels: 0,
            written: 0,
        }
    }

    /// Preload flash contents
    pub fn load(&mut self, address: u32, data: &[u8]) {
        let a = address as usize;
        self.flash[a..a + data.len()].copy_from_slice(data);
    }

    pub fn flash(&self, address: u32, len: usize) -> &[u8] {
        let a = address as usize;
        &self.flash[a..a + len]
    }

    /// Queue unsolicited bytes towards the host
    pub fn inject(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Bytes waiting to be read by the host
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    fn receive(&mut self, b: u8) {
        if let Some((address, mut page)) = self.payload.take() {
            page.push(b);
            self.payload_bytes += 1;

            if page.len() < PAGE_SIZE {
                self.payload = Some((address, page));
            } else {
                self.load(address, &page);
                if !self.faults.no_ack {
                    self.rx.extend(OK);
                }
            }
            return;
        }

        if b == CANCEL {
            self.cancels += 1;
            self.line.clear();
            if !self.faults.silent_cancel {
                self.rx.extend(b"^C\r\n");
            }
            return;
        }

        if b != b'\n' {
            self.line.push(b);
            self.rx.push_back(b);
            return;
        }

        // Line terminators are echoed as CRLF
        if self.faults.bad_echo {
            self.rx.extend(b"\r?");
        } else {
            self.rx.extend(b"\r\n");
        }

        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        self.execute(line);
    }

    fn execute(&mut self, line: String) {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_string();
        let address = parts
            .next()
            .and_then(|a| u32::from_str_radix(a.trim_start_matches("0x"), 16).ok());

        self.commands.push(line.clone());

        let address = match address {
            Some(a) if a % PAGE_SIZE as u32 == 0 && a < FLASH_SIZE => a,
            _ => {
                self.rx.extend(b"ERROR\r\n");
                return;
            }
        };

        match verb.as_str() {
            "read-flash-page-raw" => {
                let mut page = self.flash(address, PAGE_SIZE).to_vec();
                if let Some((a, offset)) = self.faults.corrupt_readback {
                    if a == address {
                        page[offset] ^= 0x01;
                    }
                }
                let n = self.faults.truncate_page.unwrap_or(PAGE_SIZE);
                self.rx.extend(&page[..n]);
            }
            "write-flash-page-raw" => {
                if self.faults.not_ready {
                    self.rx.extend(b"BUSY!\r\n");
                } else {
                    self.rx.extend(READY);
                    self.payload = Some((address, Vec::with_capacity(PAGE_SIZE)));
                }
            }
            _ => self.rx.extend(b"ERROR\r\n"),
        }
    }
}

impl Read<u8> for Remote {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Remote {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.written += 1;
        self.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl SerialPort<MockError> for Remote {
    fn discard_buffers(&mut self) -> Result<(), MockError> {
        self.rx.clear();
        Ok(())
    }
}

/// Delay that only accounts for the time it would have slept
#[derive(Clone, Default, Debug)]
pub struct Clock {
    pub elapsed: u32,
}

impl DelayMs<u32> for Clock {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed += ms;
    }
}
