use std::fs;
use std::num::ParseIntError;
use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use bf_uart_loader::linux::LinuxTransport;
use bf_uart_loader::protocol::covers_erase_sector;
use bf_uart_loader::{KeyIndex, Options, Programmer, ERASE_SECTOR_START};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Unlock the bootloader and show device information
    Info,

    /// Read a memory region
    Read {
        /// Start address (hex with 0x prefix, or decimal)
        #[structopt(long, parse(try_from_str = parse_u16))]
        addr: u16,

        /// Number of bytes, a multiple of the block size
        #[structopt(long, parse(try_from_str = parse_usize))]
        count: usize,

        /// Key index (0-19) to decipher the region with
        #[structopt(long)]
        key: Option<u8>,

        /// Write data to a file instead of dumping it
        #[structopt(long)]
        output: Option<PathBuf>,
    },

    /// Write a file to a memory region, writing 0xF000 erases the sector first
    Write {
        /// Start address (hex with 0x prefix, or decimal)
        #[structopt(long, parse(try_from_str = parse_u16))]
        addr: u16,

        /// Key index (0-19) to encipher the region with
        #[structopt(long)]
        key: Option<u8>,

        /// File to write, a multiple of the block size
        #[structopt(long)]
        input: PathBuf,
    },

    /// Read a single raw block
    Block {
        #[structopt(long, parse(try_from_str = parse_u16))]
        addr: u16,
    },
}

fn parse_usize(s: &str) -> Result<usize, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => usize::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_u16(s: &str) -> Result<u16, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u16::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn key_index(key: Option<u8>) -> anyhow::Result<Option<KeyIndex>> {
    key.map(|k| KeyIndex::new(k).ok_or_else(|| anyhow!("key index {} out of range", k)))
        .transpose()
}

fn progress(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar().template("{bar:40.cyan/blue} {bytes}/{total_bytes} {msg}"),
    );
    pb
}

fn dump(addr: u16, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        println!("{:04x}: {}", addr.wrapping_add((i * 16) as u16), hex::encode(line));
    }
}

fn read(
    p: &mut Programmer<LinuxTransport>,
    key: Option<KeyIndex>,
    addr: u16,
    count: usize,
) -> anyhow::Result<Vec<u8>> {
    let bs = p.block_size();
    if count % bs != 0 {
        bail!("read length {} is not a multiple of the block size {}", count, bs);
    }

    let pb = progress(count);

    match p.read_memory_with(key, addr, count, |n| pb.set_position(n as u64)) {
        Ok(data) => {
            pb.finish_and_clear();
            Ok(data)
        }
        Err(e) => {
            pb.abandon();
            if !e.data.is_empty() {
                warn!("Data read before failure:");
                dump(addr, &e.data);
            }
            let failed = addr.wrapping_add(e.data.len() as u16);
            Err(e).with_context(|| format!("reading block 0x{:04x}", failed))
        }
    }
}

fn write(
    p: &mut Programmer<LinuxTransport>,
    key: Option<KeyIndex>,
    addr: u16,
    data: &[u8],
) -> anyhow::Result<()> {
    let bs = p.block_size();
    if data.len() % bs != 0 {
        bail!("write length {} is not a multiple of the block size {}", data.len(), bs);
    }

    if covers_erase_sector(addr, data.len(), bs as u8) {
        warn!("Region covers 0x{:04x}, the device will erase that sector", ERASE_SECTOR_START);
    }

    let pb = progress(data.len());

    match p.write_memory_with(key, addr, data, |n| pb.set_position(n as u64)) {
        Ok(()) => {
            pb.finish_and_clear();
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            let written = e.data.len();
            let failed = addr.wrapping_add(written as u16);
            Err(e).with_context(|| {
                format!("writing block 0x{:04x}, {} bytes written", failed, written)
            })
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port {} at {} baud", o.port, o.baud);

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("opening serial port {}", o.port))?;

    info!("Connecting to bootloader");

    let device = p.handshake().context("bootloader handshake failed")?;

    info!("Bootloader connected: {}", device.ident_str());
    debug!("Status: {}", hex::encode(&device.status));

    match o.operation {
        Operation::Info => {
            println!("Identification: {}", device.ident_str());
            println!("Status: {}", hex::encode(&device.status));
        }
        Operation::Read {
            addr,
            count,
            key,
            output,
        } => {
            let data = read(&mut p, key_index(key)?, addr, count)?;

            info!(
                "Read {} from 0x{:04x}",
                bytefmt::format(data.len() as u64),
                addr
            );

            match output {
                Some(path) => fs::write(&path, &data)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => dump(addr, &data),
            }
        }
        Operation::Write { addr, key, input } => {
            let data =
                fs::read(&input).with_context(|| format!("reading {}", input.display()))?;

            write(&mut p, key_index(key)?, addr, &data)?;

            info!(
                "Wrote {} to 0x{:04x}",
                bytefmt::format(data.len() as u64),
                addr
            );
        }
        Operation::Block { addr } => {
            let block = p
                .read_block(addr)
                .with_context(|| format!("reading block 0x{:04x}", addr))?;
            dump(addr, &block);
        }
    }

    Ok(())
}
