//! Command framing and R1 collection.

use crate::{
    bus::{BusClock, TimeSource},
    config::SdSpiConfig,
    consts::{timing, Command},
    crc::crc7,
    response::R1Response,
    Error, ErrorFor, SdSpiDisk,
};

use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};
#[cfg(feature = "log")]
use log::{trace, warn};

/// Six byte command frame: start bits and index, big-endian argument, CRC and stop bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; 6]);

impl CommandFrame {
    /// CRC byte used once the card no longer checks command CRC.
    const PLACEHOLDER_CRC: u8 = 0x01;

    pub fn new(command: Command, arg: u32) -> Self {
        let arg = arg.to_be_bytes();
        let mut buf = [0x40 | command.index(), arg[0], arg[1], arg[2], arg[3], 0];
        let crc_index = buf.len() - 1;

        // Only the commands sent before SPI mode drops CRC checking need a real one.
        buf[crc_index] = match command {
            Command::GoIdleState | Command::SendIfCond => (crc7(&buf[..crc_index]) << 1) | 0x01,
            _ => Self::PLACEHOLDER_CRC,
        };

        CommandFrame(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl<Spi, Cs, Time, Config> SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    /// Send command.
    ///
    /// App-specific commands are preceded by APP_CMD; if that is refused its
    /// response is returned instead. A card that never gets ready answers
    /// [`R1Response::NOT_READY`].
    pub(crate) fn send_command(
        &mut self,
        command: Command,
        arg: u32,
    ) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        if command.is_app() {
            let r1 = self.send_command(Command::AppCmd, 0)?;
            if !r1.is_accepted() {
                return Ok(r1);
            }
        }

        // A multiple block read is stopped in the middle of the data stream.
        if command != Command::StopTransmission {
            self.deselect()?;
            if !self.select()? {
                warn!("SD not ready for CMD{}", command.index());
                return Ok(R1Response::NOT_READY);
            }
        }

        self.send_frame(command, arg)
    }

    /// Send command and require the ready state in response.
    pub(crate) fn send_command_ready(
        &mut self,
        command: Command,
        arg: u32,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let r1 = self.send_command(command, arg)?;
        if r1 == R1Response::READY_STATE {
            Ok(())
        } else {
            Err(Error::from_response(command, r1))
        }
    }

    /// Send GO_IDLE_STATE right after power-up, before the card can signal ready.
    pub(crate) fn send_go_idle_no_wait(&mut self) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        self.select_no_wait()?;
        self.send_frame(Command::GoIdleState, 0)
    }

    fn send_frame(&mut self, command: Command, arg: u32) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        trace!("CMD{} arg: 0x{:08X}", command.index(), arg);

        let frame = CommandFrame::new(command, arg);
        self.send_slice(frame.as_bytes())?;

        if command == Command::StopTransmission {
            self.skip(1)?;
        }

        let mut r1 = R1Response::NOT_READY;
        for _ in 0..timing::R1_POLL_BYTES {
            r1 = R1Response(self.receive()?);
            if r1.is_valid() {
                break;
            }
        }

        Ok(r1)
    }
}
