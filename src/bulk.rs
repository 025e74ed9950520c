//! Page by page transfers over a contiguous address range.
//!
//! Runs stop at the first failed page, nothing is retried. Page failures,
//! including an input that runs out mid-image, are reported in the returned
//! [`Transfer`]. `Err` is kept for problems detected before the link is
//! touched and for output file errors.

use std::io::{ErrorKind, Read, Write};

use embedded_hal::blocking::delay::DelayMs;
use log::Level;

use crate::protocol::{self, FLASH_SIZE, PAGE_SIZE};
use crate::{Error, Programmer, SerialPort};

/// Observer for bulk transfer progress
pub trait Progress {
    fn start(&mut self, _total: usize) {}

    fn page_start(&mut self, _index: usize, _address: u32) {}

    fn page_done(&mut self, _index: usize, _address: u32) {}

    fn finish<E>(&mut self, _transfer: &Transfer<E>) {}
}

impl Progress for () {}

/// Outcome of a bulk run
#[derive(Clone, PartialEq, Debug)]
pub struct Transfer<E> {
    /// Pages the run covers
    pub total: usize,
    /// Pages transferred successfully, in address order
    pub completed: usize,
    /// First failing page and why, the run stopped there
    pub failure: Option<(u32, Error<E>)>,
}

impl<E> Transfer<E> {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            failure: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.completed == self.total
    }
}

/// Number of whole pages in `size` bytes, any remainder is dropped
pub fn page_count(size: u64) -> usize {
    (size / PAGE_SIZE as u64) as usize
}

fn page_address(offset: u32, index: usize) -> u32 {
    offset + (index * PAGE_SIZE) as u32
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Read `size` bytes (or up to the end of flash) starting at `offset` into `out`
    pub fn read_flash<W: Write, R: Progress>(
        &mut self,
        offset: u32,
        size: Option<u64>,
        out: &mut W,
        progress: &mut R,
    ) -> Result<Transfer<E>, Error<E>> {
        protocol::validate_offset(offset).map_err(Error::Address)?;

        let size = size.unwrap_or((FLASH_SIZE - offset) as u64);
        protocol::validate_range(offset, size).map_err(Error::Address)?;

        let remainder = size % PAGE_SIZE as u64;
        if remainder != 0 {
            self.note(
                Level::Warn,
                None,
                format_args!("Ignoring trailing {} bytes of a partial page", remainder),
            );
        }

        let mut transfer = Transfer::new(page_count(size));
        progress.start(transfer.total);

        for i in 0..transfer.total {
            let address = page_address(offset, i);
            progress.page_start(i, address);

            let total = transfer.total;
            self.note(
                Level::Debug,
                Some(address),
                format_args!("Reading page {}/{}", i + 1, total),
            );

            match self.read_page(address) {
                Ok(page) => out.write_all(&page).map_err(|e| Error::Io(e.kind()))?,
                Err(e) => {
                    self.note(
                        Level::Error,
                        Some(address),
                        format_args!("Terminating read: {}", e),
                    );
                    transfer.failure = Some((address, e));
                    break;
                }
            }

            transfer.completed += 1;
            progress.page_done(i, address);
        }

        out.flush().map_err(|e| Error::Io(e.kind()))?;
        progress.finish(&transfer);

        Ok(transfer)
    }

    /// Program `size` bytes read from `input` starting at `offset`.
    ///
    /// `size` must be a whole number of pages that fits in flash, this is
    /// checked before anything is sent.
    pub fn write_flash<I: Read, R: Progress>(
        &mut self,
        offset: u32,
        size: u64,
        input: &mut I,
        progress: &mut R,
    ) -> Result<Transfer<E>, Error<E>> {
        protocol::validate_image(offset, size).map_err(Error::Address)?;

        let mut transfer = Transfer::new(page_count(size));
        progress.start(transfer.total);

        let mut page = [0u8; PAGE_SIZE];

        for i in 0..transfer.total {
            let address = page_address(offset, i);

            if let Err(e) = input.read_exact(&mut page) {
                let e = match e.kind() {
                    ErrorKind::UnexpectedEof => Error::InputSize,
                    k => Error::Io(k),
                };
                self.note(
                    Level::Error,
                    Some(address),
                    format_args!("Terminating write, bad input: {}", e),
                );
                transfer.failure = Some((address, e));
                break;
            }

            progress.page_start(i, address);

            let total = transfer.total;
            self.note(
                Level::Debug,
                Some(address),
                format_args!("Writing page {}/{}", i + 1, total),
            );

            if let Err(e) = self.write_page(address, &page) {
                self.note(
                    Level::Error,
                    Some(address),
                    format_args!("Terminating write: {}", e),
                );
                transfer.failure = Some((address, e));
                break;
            }

            transfer.completed += 1;
            progress.page_done(i, address);
        }

        progress.finish(&transfer);

        Ok(transfer)
    }
}
