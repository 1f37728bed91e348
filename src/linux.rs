use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::hal::HalTransport;
use crate::{Options, Programmer};

/// Transport over a linux tty
pub type LinuxTransport = HalTransport<Serial, Delay>;

impl Programmer<LinuxTransport> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, 8N1 without flow control
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Tty reads return immediately, the transport's poll delay does the waiting
        port.0.set_timeout(Duration::from_millis(0))?;

        let transport = HalTransport::new(port, Delay, &options);

        // Return instance
        Ok(Self::new(transport, options))
    }
}
