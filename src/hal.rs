//! [`Transport`] over embedded-hal non-blocking serial ports

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::{Options, Transport};

/// Adapts an embedded-hal serial port to a [`Transport`].
///
/// Reads poll the port every `poll_delay_ms` (at least 1 ms) and give up
/// with zero bytes once nothing has arrived for `response_timeout_ms`.
/// Port reads are expected not to wait themselves.
pub struct HalTransport<P, D> {
    port: P,
    delay: D,
    response_timeout_ms: u32,
    poll_delay_ms: u32,
}

impl<P, D> HalTransport<P, D> {
    pub fn new(port: P, delay: D, options: &Options) -> Self {
        Self {
            port,
            delay,
            response_timeout_ms: options.response_timeout_ms,
            poll_delay_ms: options.poll_delay_ms.max(1),
        }
    }

    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }
}

impl<P, D, E> Transport for HalTransport<P, D>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = E;

    fn write(&mut self, data: &[u8]) -> Result<usize, E> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(data.len())
    }

    fn read(&mut self, buff: &mut [u8]) -> Result<usize, E> {
        let mut n = 0;
        let mut t = 0;

        while n < buff.len() {
            match self.port.read() {
                Ok(v) => {
                    buff[n] = v;
                    n += 1;
                    continue;
                }
                // Hand back what has arrived so far
                Err(nb::Error::WouldBlock) if n > 0 => break,
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e),
            };

            // Wait for delay period
            self.delay.delay_ms(self.poll_delay_ms);
            t += self.poll_delay_ms;

            if t > self.response_timeout_ms {
                debug!("Receive timeout after {} ms", t);
                break;
            }
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct PortError;

    /// Serial port yielding `WouldBlock` for each `None` in its input
    struct Port {
        rx: VecDeque<Option<u8>>,
        tx: Vec<u8>,
        flushed: bool,
    }

    impl Read<u8> for Port {
        type Error = PortError;

        fn read(&mut self) -> nb::Result<u8, PortError> {
            match self.rx.pop_front() {
                Some(Some(v)) => Ok(v),
                _ => Err(nb::Error::WouldBlock),
            }
        }
    }

    impl Write<u8> for Port {
        type Error = PortError;

        fn write(&mut self, word: u8) -> nb::Result<(), PortError> {
            self.tx.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), PortError> {
            self.flushed = true;
            Ok(())
        }
    }

    struct Delay(u32);

    impl DelayMs<u32> for Delay {
        fn delay_ms(&mut self, ms: u32) {
            self.0 += ms;
        }
    }

    fn transport(rx: &[Option<u8>]) -> HalTransport<Port, Delay> {
        transport_with_poll(rx, 1)
    }

    fn transport_with_poll(rx: &[Option<u8>], poll_delay_ms: u32) -> HalTransport<Port, Delay> {
        let port = Port {
            rx: rx.iter().cloned().collect(),
            tx: vec![],
            flushed: false,
        };
        let options = Options {
            response_timeout_ms: 10,
            poll_delay_ms,
            ..Options::default()
        };
        HalTransport::new(port, Delay(0), &options)
    }

    #[test]
    fn write_flushes() {
        let mut t = transport(&[]);
        assert_eq!(t.write(b"PROG"), Ok(4));

        let (port, _) = t.into_inner();
        assert_eq!(port.tx, b"PROG".to_vec());
        assert!(port.flushed);
    }

    #[test]
    fn read_returns_available_bytes() {
        let mut t = transport(&[None, None, Some(1), Some(2), None, Some(3)]);
        let mut buff = [0u8; 8];

        assert_eq!(t.read(&mut buff), Ok(2));
        assert_eq!(&buff[..2], &[1, 2]);

        assert_eq!(t.read(&mut buff), Ok(1));
        assert_eq!(buff[0], 3);
    }

    #[test]
    fn read_stops_when_buffer_full() {
        let mut t = transport(&[Some(1), Some(2), Some(3)]);
        let mut buff = [0u8; 2];

        assert_eq!(t.read(&mut buff), Ok(2));
        assert_eq!(t.read(&mut buff), Ok(1));
    }

    #[test]
    fn read_times_out_with_zero() {
        let mut t = transport(&[]);
        let mut buff = [0u8; 4];

        assert_eq!(t.read(&mut buff), Ok(0));

        let (_, delay) = t.into_inner();
        assert_eq!(delay.0, 11);
    }

    #[test]
    fn read_times_out_with_zero_poll_delay() {
        let mut t = transport_with_poll(&[None, Some(7)], 0);
        let mut buff = [0u8; 4];

        assert_eq!(t.read(&mut buff), Ok(1));
        assert_eq!(buff[0], 7);

        // An idle port still times out
        assert_eq!(t.read(&mut buff), Ok(0));

        let (_, delay) = t.into_inner();
        assert_eq!(delay.0, 12);
    }
}
