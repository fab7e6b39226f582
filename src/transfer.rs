//! Framed data blocks and sector transfers.

use crate::{
    bus::{BusClock, Deadline, TimeSource},
    config::SdSpiConfig,
    consts::{timing, tokens, Command, BLOCK_SIZE, BLOCK_SIZE_U32, IDLE_BYTE},
    response::data_accepted,
    Error, ErrorFor, Lba, SdSpiDisk,
};

use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};
#[cfg(feature = "log")]
use log::{debug, warn};

/// Outcome of one byte polled while waiting for a data start token.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPoll {
    /// Bus still idle, keep polling.
    Pending,
    /// Start token seen, the payload follows.
    Start,
    /// Card sent another token, usually an error token.
    Rejected(u8),
    /// Bus still idle and the budget is used up.
    TimedOut,
}

/// Decides on `byte` seen while waiting for a data start token.
pub fn poll_data_token(byte: u8, expired: bool) -> TokenPoll {
    match byte {
        tokens::DATA_START_BLOCK => TokenPoll::Start,
        IDLE_BYTE if expired => TokenPoll::TimedOut,
        IDLE_BYTE => TokenPoll::Pending,
        token => TokenPoll::Rejected(token),
    }
}

impl<Spi, Cs, Time, Config> SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    /// Card address of `sector`: byte offset on byte-addressed cards.
    pub(crate) fn card_address(&self, sector: Lba) -> Result<u32, ErrorFor<Spi, Cs>> {
        if self.card_type.is_byte_addressed() {
            sector
                .checked_mul(BLOCK_SIZE_U32)
                .ok_or(Error::InvalidArgument)
        } else {
            Ok(sector)
        }
    }

    /// Receive one framed block into `data`.
    ///
    /// The two trailing CRC bytes are clocked out and dropped unchecked.
    pub(crate) fn receive_data_block(&mut self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let deadline = Deadline::start(&self.time, timing::DATA_TOKEN_MS);
        loop {
            let byte = self.receive()?;
            match poll_data_token(byte, deadline.is_expired(&self.time)) {
                TokenPoll::Start => break,
                TokenPoll::Pending => {}
                TokenPoll::Rejected(token) => {
                    warn!("SD data token: 0x{:02X}", token);
                    return Err(Error::BadDataToken(token));
                }
                TokenPoll::TimedOut => return Err(Error::TimeoutDataToken),
            }
        }

        self.receive_slice(data)?;
        self.skip(2)
    }

    /// Send one framed block started by `token`, with a dummy CRC.
    pub(crate) fn transmit_data_block(
        &mut self,
        token: u8,
        data: &[u8],
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        if !self.wait_ready(timing::READY_WAIT_MS)? {
            return Err(Error::TimeoutWaitReady);
        }

        self.send(token)?;
        self.send_slice(data)?;
        self.send_slice(&[IDLE_BYTE, IDLE_BYTE])?;

        let response = self.receive()?;
        if data_accepted(response) {
            Ok(())
        } else {
            warn!("SD rejected data block: 0x{:02X}", response);
            Err(Error::WriteRejected(response))
        }
    }

    /// End a multiple block write.
    fn transmit_stop_token(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        if !self.wait_ready(timing::READY_WAIT_MS)? {
            return Err(Error::TimeoutWaitReady);
        }

        self.send(tokens::STOP_TRAN)
    }

    /// Read `count` sectors starting at `sector`. Arguments are validated by the caller.
    pub(crate) fn read_sectors(
        &mut self,
        buf: &mut [u8],
        sector: Lba,
        count: usize,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("SD read sector: {}, count: {}", sector, count);

        let address = self.card_address(sector)?;
        let buf = &mut buf[..count * BLOCK_SIZE];

        self.transaction(|s| {
            if count == 1 {
                s.send_command_ready(Command::ReadSingleBlock, address)?;
                s.receive_data_block(buf)
            } else {
                s.send_command_ready(Command::ReadMultipleBlock, address)?;
                let result = buf
                    .chunks_mut(BLOCK_SIZE)
                    .try_for_each(|block| s.receive_data_block(block));
                let stop = s.send_command(Command::StopTransmission, 0);

                result.and(stop.map(|_| ()))
            }
        })
    }

    /// Write `count` sectors starting at `sector`. Arguments are validated by the caller.
    pub(crate) fn write_sectors(
        &mut self,
        buf: &[u8],
        sector: Lba,
        count: usize,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("SD write sector: {}, count: {}", sector, count);

        let address = self.card_address(sector)?;
        let buf = &buf[..count * BLOCK_SIZE];

        self.transaction(|s| {
            if count == 1 {
                s.send_command_ready(Command::WriteBlock, address)?;
                s.transmit_data_block(tokens::DATA_START_BLOCK, buf)
            } else {
                if s.card_type.is_sd() {
                    // Pre-erase hint only, the answer does not matter.
                    s.send_command(Command::SetWrBlkEraseCount, count as u32)?;
                }
                s.send_command_ready(Command::WriteMultipleBlock, address)?;
                let result = buf
                    .chunks(BLOCK_SIZE)
                    .try_for_each(|block| s.transmit_data_block(tokens::WRITE_MULTIPLE, block));
                let stop = s.transmit_stop_token();

                result.and(stop)
            }
        })
    }
}
