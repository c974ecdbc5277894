//! Serial transport under the display link.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info};

use crate::{Result, DEFAULT_BAUD_RATE};

/// Byte-level transport the link writes through.
///
/// Implementations deliver raw bytes to the display, switch line speed
/// for transfers, and drive the display supply rail where the hardware
/// exposes it.
#[allow(async_fn_in_trait)]
pub trait LinkTransport: Send {
    /// Writes the whole buffer, returning the number of bytes accepted.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Waits until all written bytes have left the transmit buffer.
    async fn flush(&mut self) -> Result<()>;

    /// Reconfigures the line speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Drives the display supply rail. No-op where unavailable.
    fn set_power(&mut self, on: bool) -> Result<()>;
}

/// Write side of the display's serial link.
///
/// The read side is a separate handle on the same device (see the
/// daemon's byte pump); termios changes such as a baud switch apply to
/// the device and are seen by both.
pub struct SerialTransport {
    port: SerialStream,
    power_gpio: Option<PathBuf>,
}

impl SerialTransport {
    /// Opens the display serial port at 8N1.
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let mut port = tokio_serial::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()?;
        // The byte pump opens the same device for reading.
        port.set_exclusive(false)?;

        info!("display serial port opened at {} ({} baud)", path, baud);

        Ok(Self {
            port,
            power_gpio: None,
        })
    }

    /// Opens the port at the default bring-up speed.
    pub fn open_default(path: &str) -> Result<Self> {
        Self::open(path, DEFAULT_BAUD_RATE)
    }

    /// Attaches the sysfs GPIO value file switching display power.
    pub fn with_power_gpio(mut self, path: impl Into<PathBuf>) -> Self {
        self.power_gpio = Some(path.into());
        self
    }
}

impl LinkTransport for SerialTransport {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.port.write_all(data).await?;
        Ok(data.len())
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush().await?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)?;
        debug!("serial baud rate switched to {}", baud);
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<()> {
        let Some(gpio) = &self.power_gpio else {
            debug!("no power GPIO configured, skipping supply switch");
            return Ok(());
        };
        // The supply switch is active low.
        std::fs::write(gpio, if on { "0" } else { "1" })?;
        debug!("display power {}", if on { "on" } else { "off" });
        Ok(())
    }
}
