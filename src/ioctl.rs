//! Drive control and capability queries.

use crate::{
    bus::{BusClock, TimeSource},
    config::SdSpiConfig,
    consts::{timing, Command, BLOCK_SIZE},
    csd::{CapacityProvider, Csd, CsdData, CsdMmc, CsdV1, SdStatus, SdStatusData},
    status::{CardType, DriveStatus},
    Error, ErrorFor, Lba, SdSpiDisk,
};

use embedded_hal::blocking::spi::Transfer;
use size::Size;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, info};
#[cfg(feature = "log")]
use log::{debug, info};

/// Card Identification block.
pub type CidData = [u8; 16];

/// Operating Conditions Register bytes.
pub type OcrData = [u8; 4];

/// Drive control command.
#[derive(Debug)]
pub enum IoctlCmd<'a> {
    /// Wait for the card to finish pending internal writes.
    CtrlSync,
    /// Capacity, in 512-byte sectors.
    GetSectorCount(&'a mut u64),
    /// Sector size, always 512.
    GetSectorSize(&'a mut usize),
    /// Erase block size, in 512-byte sectors.
    GetBlockSize(&'a mut u32),
    /// Erase the inclusive sector range `start..=end`.
    CtrlTrim { start: Lba, end: Lba },
    /// Card classification.
    GetCardType(&'a mut CardType),
    /// Raw CSD register.
    GetCsd(&'a mut CsdData),
    /// Raw CID register.
    GetCid(&'a mut CidData),
    /// Raw OCR register.
    GetOcr(&'a mut OcrData),
    /// Raw SD Status block.
    GetSdStatus(&'a mut SdStatusData),
}

impl<Spi, Cs, Time, Config> SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    /// Runs a control command. The drive is validated by the caller.
    pub(crate) fn control(&mut self, cmd: IoctlCmd<'_>) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transaction(|s| match cmd {
            IoctlCmd::CtrlSync => {
                if s.select()? {
                    Ok(())
                } else {
                    Err(Error::TimeoutWaitReady)
                }
            }
            IoctlCmd::GetSectorCount(count) => {
                *count = s.read_csd()?.card_capacity_blocks();
                Ok(())
            }
            IoctlCmd::GetSectorSize(size) => {
                *size = BLOCK_SIZE;
                Ok(())
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = s.erase_block_sectors()?;
                Ok(())
            }
            IoctlCmd::CtrlTrim { start, end } => s.trim(start, end),
            IoctlCmd::GetCardType(card_type) => {
                *card_type = s.card_type;
                Ok(())
            }
            IoctlCmd::GetCsd(data) => s.read_register(Command::SendCsd, data),
            IoctlCmd::GetCid(data) => s.read_register(Command::SendCid, data),
            IoctlCmd::GetOcr(data) => {
                s.send_command_ready(Command::ReadOcr, 0)?;
                s.receive_slice(data)
            }
            IoctlCmd::GetSdStatus(data) => {
                if !s.card_type.is_sd() {
                    return Err(Error::NotSupported);
                }
                s.read_sd_status(data)
            }
        })
    }

    /// Reads the card capacity from the CSD register.
    pub fn capacity(&mut self) -> Result<Size, ErrorFor<Spi, Cs>> {
        if self.status.contains(DriveStatus::NOT_INITIALIZED) {
            return Err(Error::NotInitialized);
        }

        self.transaction(|s| s.read_csd()).map(|csd| csd.card_capacity())
    }

    /// Read a 16 byte register sent as a data block.
    fn read_register(
        &mut self,
        command: Command,
        data: &mut [u8; 16],
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        self.send_command_ready(command, 0)?;
        self.receive_data_block(data)
    }

    fn read_csd(&mut self) -> Result<Csd, ErrorFor<Spi, Cs>> {
        let mut data: CsdData = Default::default();
        self.read_register(Command::SendCsd, &mut data)?;

        Ok(Csd::from(data))
    }

    fn read_sd_status(&mut self, data: &mut SdStatusData) -> Result<(), ErrorFor<Spi, Cs>> {
        self.send_command_ready(Command::SdStatus, 0)?;
        // Second byte of the R2 response.
        self.skip(1)?;
        self.receive_data_block(data)
    }

    /// Erase block size, in sectors.
    fn erase_block_sectors(&mut self) -> Result<u32, ErrorFor<Spi, Cs>> {
        if self.card_type.contains(CardType::SD2) {
            let mut data = [0; 64];
            self.read_sd_status(&mut data)?;
            return Ok(SdStatus(data).erase_block_sectors());
        }

        let mut data: CsdData = Default::default();
        self.read_register(Command::SendCsd, &mut data)?;

        Ok(if self.card_type.contains(CardType::SD1) {
            CsdV1::from(data).erase_block_sectors()
        } else {
            CsdMmc::from(data).erase_block_sectors()
        })
    }

    /// Erase sectors `start..=end`. A failed step leaves the card as it is.
    fn trim(&mut self, start: Lba, end: Lba) -> Result<(), ErrorFor<Spi, Cs>> {
        if end < start {
            return Err(Error::InvalidArgument);
        }
        if !self.card_type.is_sd() || !self.read_csd()?.supports_sector_erase() {
            return Err(Error::EraseNotSupported);
        }

        info!("SD erase sectors: {}..={}", start, end);

        let first = self.card_address(start)?;
        let last = self.card_address(end)?;

        self.send_command_ready(Command::EraseStart, first)?;
        self.send_command_ready(Command::EraseEnd, last)?;
        self.send_command_ready(Command::Erase, 0)?;

        if self.wait_ready(timing::ERASE_MS)? {
            debug!("SD erase done");
            Ok(())
        } else {
            Err(Error::TimeoutErase)
        }
    }
}
