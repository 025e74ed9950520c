use std::convert::TryFrom;
use std::fs::File;
use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use uart_page_flasher::protocol::{self, parse_size};
use uart_page_flasher::{Options, Programmer, Progress, Transfer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    operation: Operation,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Enable verbose output
    #[structopt(short, long)]
    verbose: bool,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Read flash to a file
    Read {
        /// Flash offset (page aligned, decimal or 0x hex)
        #[structopt(parse(try_from_str = parse_offset))]
        offset: u32,

        /// Output file path
        file: PathBuf,

        /// Size to read (decimal or 0x hex), defaults to the end of flash
        #[structopt(long, parse(try_from_str = parse_size))]
        size: Option<u64>,
    },
    /// Write flash from a file
    Write {
        /// Flash offset (page aligned, decimal or 0x hex)
        #[structopt(parse(try_from_str = parse_offset))]
        offset: u32,

        /// Input file path, size must be a multiple of the page size
        file: PathBuf,
    },
}

fn parse_offset(s: &str) -> Result<u32, anyhow::Error> {
    let v = parse_size(s)?;
    Ok(u32::try_from(v)?)
}

/// Renders bulk transfer progress as a terminal bar
struct Bar(ProgressBar);

impl Bar {
    fn new(label: &str) -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages ({eta})")
                .progress_chars("#>-"),
        );
        pb.set_prefix(label);
        Self(pb)
    }
}

impl Progress for Bar {
    fn start(&mut self, total: usize) {
        self.0.set_length(total as u64);
    }

    fn page_done(&mut self, _index: usize, _address: u32) {
        self.0.inc(1);
    }

    fn finish<E>(&mut self, transfer: &Transfer<E>) {
        if transfer.is_complete() {
            self.0.finish_with_message("done");
        } else {
            self.0.abandon_with_message("stopped");
        }
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let level = if o.verbose {
        LevelFilter::Debug
    } else {
        o.log_level
    };
    let _ = SimpleLogger::init(level, Config::default());

    match run(o) {
        Ok(true) => (),
        Ok(false) => std::process::exit(2),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

/// Execute the requested operation, returns whether every page was transferred
fn run(o: Args) -> anyhow::Result<bool> {
    // Check everything we can before touching the port
    let image_size = match &o.operation {
        Operation::Read { offset, size, .. } => {
            match size {
                Some(s) => protocol::validate_range(*offset, *s)?,
                None => protocol::validate_offset(*offset)?,
            }
            None
        }
        Operation::Write { offset, file } => {
            if !file.is_file() {
                return Err(anyhow!("input file '{}' does not exist", file.display()));
            }
            let size = file.metadata()?.len();
            protocol::validate_image(*offset, size)?;
            Some(size)
        }
    };

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .map_err(|e| anyhow!("error connecting to serial port {}: {:?}", o.port, e))?;

    p.init();

    let transfer = match o.operation {
        Operation::Read { offset, size, file } => {
            let mut out = File::create(&file)
                .with_context(|| format!("creating output file '{}'", file.display()))?;

            let len = size.unwrap_or((protocol::FLASH_SIZE - offset) as u64);
            info!("Reading {} from 0x{:06X}", bytefmt::format(len), offset);

            p.read_flash(offset, size, &mut out, &mut Bar::new("Reading"))?
        }
        Operation::Write { offset, file } => {
            let mut input = File::open(&file)
                .with_context(|| format!("opening input file '{}'", file.display()))?;

            let size = image_size.unwrap_or_default();
            info!("Writing {} to 0x{:06X}", bytefmt::format(size), offset);

            p.write_flash(offset, size, &mut input, &mut Bar::new("Writing"))?
        }
    };

    if let Some((address, e)) = &transfer.failure {
        error!(
            "Stopped at 0x{:06X} after {}/{} pages: {}",
            address, transfer.completed, transfer.total, e
        );
    } else {
        info!("Transferred {} pages", transfer.completed);
    }

    Ok(transfer.is_complete())
}
