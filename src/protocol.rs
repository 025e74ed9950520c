//! Wire-level constants and command framing for the page flash console.

/// Size of a single flash page, the unit of every transfer
pub const PAGE_SIZE: usize = 256;

/// Total size of the flash address space (2 MiB)
pub const FLASH_SIZE: u32 = 2 * 1024 * 1024;

/// Control byte cancelling the current remote line / operation (ETX, ^C)
pub const CANCEL: u8 = 0x03;

/// Number of bytes the remote answers a cancel with
pub const CANCEL_RESPONSE_LEN: usize = 4;

/// Sent by the remote once it is ready to accept a page payload
pub const READY: &[u8] = b"READY\r\n";

/// Sent by the remote once a page payload has been received
pub const OK: &[u8] = b"OK\r\n";

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Command {
    /// Reads one raw page starting at the supplied address
    ReadFlashPageRaw,

    /// Writes one raw page starting at the supplied address.
    /// The remote answers `READY` before the payload and `OK` after it.
    WriteFlashPageRaw,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::ReadFlashPageRaw => "read-flash-page-raw",
            Command::WriteFlashPageRaw => "write-flash-page-raw",
        }
    }

    /// Encode a command line for the provided address
    pub fn encode(&self, address: u32) -> Vec<u8> {
        format!("{} 0x{:06X}\n", self.verb(), address).into_bytes()
    }

    /// Length of the echo for an encoded command line, the remote reflects
    /// the line and then terminates it with its own newline.
    pub fn echo_len(line: &[u8]) -> usize {
        line.len() + 1
    }
}

/// Configuration errors, raised before any transport activity
#[derive(Copy, Clone, PartialEq, Debug, thiserror::Error)]
pub enum AddressError {
    #[error("offset 0x{0:06X} is not page aligned (multiple of {})", PAGE_SIZE)]
    Unaligned(u32),

    #[error("offset 0x{0:06X} exceeds flash size (0x{:06X})", FLASH_SIZE)]
    OutOfRange(u32),

    #[error("0x{size:X} bytes at offset 0x{offset:06X} would exceed flash size")]
    Overflow { offset: u32, size: u64 },

    #[error("size {0} is not a multiple of {}", PAGE_SIZE)]
    SizeNotPageMultiple(u64),
}

/// Check an offset is page aligned and inside the flash region
pub fn validate_offset(offset: u32) -> Result<(), AddressError> {
    if offset % PAGE_SIZE as u32 != 0 {
        return Err(AddressError::Unaligned(offset));
    }
    if offset >= FLASH_SIZE {
        return Err(AddressError::OutOfRange(offset));
    }
    Ok(())
}

/// Check `size` bytes starting at `offset` fit inside the flash region
pub fn validate_range(offset: u32, size: u64) -> Result<(), AddressError> {
    validate_offset(offset)?;

    // offset < FLASH_SIZE here, so the remaining space cannot underflow
    if size > (FLASH_SIZE - offset) as u64 {
        return Err(AddressError::Overflow { offset, size });
    }
    Ok(())
}

/// Check a write image: page multiple and inside the flash region
pub fn validate_image(offset: u32, size: u64) -> Result<(), AddressError> {
    validate_offset(offset)?;

    if size % PAGE_SIZE as u64 != 0 {
        return Err(AddressError::SizeNotPageMultiple(size));
    }

    validate_range(offset, size)
}

/// Parse a size argument, accepting decimal or `0x` prefixed hex
pub fn parse_size(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    }
}
