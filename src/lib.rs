//! BF Serial Bootloader.
//!
//! Reads and writes fixed size memory blocks through the bootloader's
//! command / response protocol, with optional per-block key substitution
//! for enciphered regions.
//!
//! The serial port itself is supplied by the caller as a [`Transport`],
//! see [`hal::HalTransport`] for embedded-hal serial ports and the `linux`
//! feature for opening a tty directly.

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod cipher;
pub mod hal;
pub mod protocol;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

pub use cipher::{crypt, KeyIndex};
pub use protocol::{Command, ERASE_SECTOR_START};

use protocol::*;

/// Duplex byte channel to the bootloader with a bounded read timeout
pub trait Transport {
    type Error: Debug;

    /// Write the whole of `data`, returning the number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read available bytes into `buff`.
    ///
    /// Returns `Ok(0)` if nothing arrived before the read timeout.
    fn read(&mut self, buff: &mut [u8]) -> Result<usize, Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(data)
    }

    fn read(&mut self, buff: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).read(buff)
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Unlocked,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("transport error: {0:?}")]
    Transport(E),

    #[error("short read, {shortfall} bytes missing after {}", .partial.len())]
    ShortRead { partial: Vec<u8>, shortfall: usize },

    /// Response header or acknowledgement did not match, `payload` holds
    /// any data that followed the header
    #[error("protocol mismatch, expected {expected:02x?} received {actual:02x?}")]
    ProtocolMismatch {
        expected: Vec<u8>,
        actual: Vec<u8>,
        payload: Vec<u8>,
    },
}

impl<E: Debug> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

/// Failure part way through a region, with the data transferred before it
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
#[error("{error} ({} bytes transferred)", .data.len())]
pub struct RegionError<E: Debug> {
    pub error: Error<E>,
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Memory block size expected by the device
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "64"))]
    pub block_size: u8,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
        }
    }
}

/// Responses collected during the handshake
#[derive(Clone, PartialEq, Debug)]
pub struct DeviceInfo {
    pub unlock: u8,
    pub status: Vec<u8>,
    pub ident: Vec<u8>,
    pub key_select: u8,
}

impl DeviceInfo {
    /// Device revision and identification as text
    pub fn ident_str(&self) -> String {
        String::from_utf8_lossy(&self.ident).into_owned()
    }
}

/// Outcome of feeding one read into an [`Accumulator`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Progress {
    Complete,
    Pending,
    Stalled,
}

/// Response buffer filled across partial reads
#[derive(Clone, PartialEq, Debug)]
pub struct Accumulator {
    buff: Vec<u8>,
    filled: usize,
}

impl Accumulator {
    pub fn new(expected: usize) -> Self {
        Self {
            buff: vec![0u8; expected],
            filled: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buff.len() - self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Space left for the next read
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buff[self.filled..]
    }

    /// Record `n` bytes read into [`Accumulator::unfilled`]
    pub fn advance(&mut self, n: usize) -> Progress {
        self.filled = (self.filled + n).min(self.buff.len());

        if self.is_complete() {
            Progress::Complete
        } else if n == 0 {
            Progress::Stalled
        } else {
            Progress::Pending
        }
    }

    /// Bytes collected so far
    pub fn collected(&self) -> &[u8] {
        &self.buff[..self.filled]
    }

    pub fn into_inner(mut self) -> Vec<u8> {
        self.buff.truncate(self.filled);
        self.buff
    }

    fn into_short_read<E: Debug>(self) -> Error<E> {
        let shortfall = self.remaining();
        Error::ShortRead {
            partial: self.into_inner(),
            shortfall,
        }
    }
}

pub struct Programmer<T> {
    state: State,
    options: Options,
    transport: T,
}

impl<T> Programmer<T>
where
    T: Transport,
{
    /// Create a new programmer instance
    pub fn new(transport: T, options: Options) -> Self {
        assert!(options.block_size > 0, "block size must be non-zero");

        Self {
            state: State::Init,
            options,
            transport,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn block_size(&self) -> usize {
        self.options.block_size as usize
    }

    /// Release the underlying transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Unlock block commands on the device.
    ///
    /// Performed once per session, before any block access.
    pub fn handshake(&mut self) -> Result<DeviceInfo, Error<T::Error>> {
        debug!("Sending unlock sequence");
        let unlock = self.exchange(UNLOCK_MAGIC, UNLOCK_RESP_LEN)?;
        debug!("Unlock response: {:02x?}", unlock);

        let status = self.exchange(&[Command::Status.opcode()], STATUS_RESP_LEN)?;
        debug!("Status: {:02x?}", status);

        let ident = self.exchange(&[Command::Identify.opcode()], IDENT_RESP_LEN)?;
        debug!("Identification: {}", String::from_utf8_lossy(&ident));

        debug!("Sending key selection");
        let key_select = self.exchange(&key_select_command(), KEY_SELECT_RESP_LEN)?;
        debug!("Key selection response: {:02x?}", key_select);

        self.state = State::Unlocked;

        Ok(DeviceInfo {
            unlock: unlock[0],
            status,
            ident,
            key_select: key_select[0],
        })
    }

    /// Write a command and wait for exactly `expected` response bytes
    pub fn exchange(&mut self, command: &[u8], expected: usize) -> Result<Vec<u8>, Error<T::Error>> {
        trace!("tx: {:02x?}", command);

        let n = self.transport.write(command)?;
        if n != command.len() {
            warn!("Partial command write ({} of {} bytes)", n, command.len());
        }

        let mut resp = Accumulator::new(expected);

        while !resp.is_complete() {
            let n = self.transport.read(resp.unfilled())?;

            if resp.advance(n) == Progress::Stalled {
                debug!(
                    "Short read, received {} of {} bytes: {:02x?}",
                    expected - resp.remaining(),
                    expected,
                    resp.collected()
                );
                return Err(resp.into_short_read());
            }
        }

        let resp = resp.into_inner();
        trace!("rx: {:02x?}", resp);

        Ok(resp)
    }

    /// Read the block at `addr`
    pub fn read_block(&mut self, addr: u16) -> Result<Vec<u8>, Error<T::Error>> {
        if self.state != State::Init {
            trace!("Reading block 0x{:04x}", addr);
        } else {
            warn!("Reading block 0x{:04x} before handshake", addr);
        }

        let header = block_header(Command::ReadBlock, addr, self.options.block_size);
        let mut resp = self.exchange(&header, BLOCK_HEADER_LEN + self.block_size())?;

        let payload = resp.split_off(BLOCK_HEADER_LEN);

        if resp[..3] != header[..3] {
            error!(
                "Unexpected read response header for 0x{:04x}: {:02x?}",
                addr, resp
            );
            return Err(Error::ProtocolMismatch {
                expected: header[..3].to_vec(),
                actual: resp[..3].to_vec(),
                payload,
            });
        }

        Ok(payload)
    }

    /// Write one block of data at `addr`.
    ///
    /// `data` must be exactly one block long. Writing at
    /// [`ERASE_SECTOR_START`] erases the sector on the device.
    pub fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<(), Error<T::Error>> {
        assert_eq!(
            data.len(),
            self.block_size(),
            "block write must be exactly one block"
        );

        if addr == ERASE_SECTOR_START {
            info!("Writing block 0x{:04x}, device will erase the sector", addr);
        } else {
            trace!("Writing block 0x{:04x}", addr);
        }

        let mut cmd = block_header(Command::WriteBlock, addr, self.options.block_size).to_vec();
        cmd.extend_from_slice(data);

        let resp = self.exchange(&cmd, 1)?;

        if resp[0] != ACK {
            error!("Write of 0x{:04x} not acknowledged: 0x{:02x}", addr, resp[0]);
            return Err(Error::ProtocolMismatch {
                expected: vec![ACK],
                actual: resp,
                payload: vec![],
            });
        }

        Ok(())
    }

    /// Read `count` bytes starting at `addr`, deciphering each block with `key` if set.
    ///
    /// `count` must be a multiple of the block size. On failure the data
    /// read before the failing block is returned with the error.
    pub fn read_memory(
        &mut self,
        key: Option<KeyIndex>,
        addr: u16,
        count: usize,
    ) -> Result<Vec<u8>, RegionError<T::Error>> {
        self.read_memory_with(key, addr, count, |_| ())
    }

    /// [`Programmer::read_memory`], calling `progress` with the total bytes
    /// read after each block
    pub fn read_memory_with<F: FnMut(usize)>(
        &mut self,
        key: Option<KeyIndex>,
        addr: u16,
        count: usize,
        mut progress: F,
    ) -> Result<Vec<u8>, RegionError<T::Error>> {
        let bs = self.block_size();
        assert!(
            count % bs == 0,
            "read length {} is not a multiple of the block size {}",
            count,
            bs
        );

        debug!("Reading {} bytes from 0x{:04x} (key: {:?})", count, addr, key);

        let mut data = Vec::with_capacity(count);
        let mut block_addr = addr;

        for _ in 0..count / bs {
            let block = match self.read_block(block_addr) {
                Ok(b) => b,
                Err(error) => return Err(RegionError { error, data }),
            };

            match key {
                Some(k) => data.extend(crypt(&block, k)),
                None => data.extend(block),
            }
            progress(data.len());

            block_addr = block_addr.wrapping_add(bs as u16);
        }

        Ok(data)
    }

    /// Write `data` starting at `addr`, enciphering each block with `key` if set.
    ///
    /// `data` must be a multiple of the block size. Blocks written before
    /// a failure stay written and are returned with the error.
    pub fn write_memory(
        &mut self,
        key: Option<KeyIndex>,
        addr: u16,
        data: &[u8],
    ) -> Result<(), RegionError<T::Error>> {
        self.write_memory_with(key, addr, data, |_| ())
    }

    /// [`Programmer::write_memory`], calling `progress` with the total bytes
    /// written after each block
    pub fn write_memory_with<F: FnMut(usize)>(
        &mut self,
        key: Option<KeyIndex>,
        addr: u16,
        data: &[u8],
        mut progress: F,
    ) -> Result<(), RegionError<T::Error>> {
        let bs = self.block_size();
        assert!(
            data.len() % bs == 0,
            "write length {} is not a multiple of the block size {}",
            data.len(),
            bs
        );

        debug!("Writing {} bytes to 0x{:04x} (key: {:?})", data.len(), addr, key);

        let mut block_addr = addr;

        for (i, chunk) in data.chunks(bs).enumerate() {
            let res = match key {
                Some(k) => self.write_block(block_addr, &crypt(chunk, k)),
                None => self.write_block(block_addr, chunk),
            };

            if let Err(error) = res {
                return Err(RegionError {
                    error,
                    data: data[..i * bs].to_vec(),
                });
            }
            progress((i + 1) * bs);

            block_addr = block_addr.wrapping_add(bs as u16);
        }

        Ok(())
    }
}
