use crate::{
    bus::{BusClock, TimeSource},
    config::SdSpiConfig,
    consts::BLOCK_SIZE,
    ioctl::IoctlCmd,
    status::{CardType, DriveStatus},
    Error, ErrorFor, Lba, SdSpiDisk,
};

use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{error, info, warn};
#[cfg(feature = "log")]
use log::{error, info, warn};

/// Sector-addressed disk, as consumed by a file-system layer.
///
/// Every operation names the physical drive it is meant for.
pub trait DiskIo {
    /// Error of every operation.
    type Error;

    /// Negotiates with the card in `drive` and returns the resulting status.
    ///
    /// A failed negotiation is reported as `Err`; the drive is then left
    /// `NOT_INITIALIZED`, as [`DiskIo::status`] shows.
    fn initialize(&mut self, drive: u8) -> Result<DriveStatus, Self::Error>;

    /// Current status of `drive`, without bus activity.
    fn status(&self, drive: u8) -> Result<DriveStatus, Self::Error>;

    /// Reads `count` sectors from `sector` into the front of `buf`.
    fn read(&mut self, drive: u8, buf: &mut [u8], sector: Lba, count: usize)
        -> Result<(), Self::Error>;

    /// Writes `count` sectors from the front of `buf` at `sector`.
    fn write(&mut self, drive: u8, buf: &[u8], sector: Lba, count: usize) -> Result<(), Self::Error>;

    /// Runs a control command on `drive`.
    fn ioctl(&mut self, drive: u8, cmd: IoctlCmd<'_>) -> Result<(), Self::Error>;
}

impl<Spi, Cs, Time, Config> SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    /// Validate drive number.
    fn validate_drive(drive: u8) -> Result<(), ErrorFor<Spi, Cs>> {
        if drive == Config::DRIVE {
            Ok(())
        } else {
            Err(Error::InvalidDrive(drive))
        }
    }

    /// Validate sector count against the buffer for read/write.
    fn validate_count(buf_len: usize, count: usize) -> Result<(), ErrorFor<Spi, Cs>> {
        let fits = count
            .checked_mul(BLOCK_SIZE)
            .map_or(false, |len| len <= buf_len);

        if count == 0 || !fits || u32::try_from(count).is_err() {
            error!(
                "SD invalid transfer, buffer length: {}, count: {}",
                buf_len, count
            );
            Err(Error::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Validate initialized.
    fn validate_initialized(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        if self.status.contains(DriveStatus::NOT_INITIALIZED) {
            Err(Error::NotInitialized)
        } else {
            Ok(())
        }
    }
}

impl<Spi, Cs, Time, Config> DiskIo for SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    type Error = ErrorFor<Spi, Cs>;

    fn initialize(&mut self, drive: u8) -> Result<DriveStatus, Self::Error> {
        Self::validate_drive(drive)?;

        if self.status.contains(DriveStatus::NO_MEDIA) {
            warn!("SD initialize without media");
            return Err(Error::NoMedia);
        }

        info!("SD initialize started");

        self.card_type = CardType::empty();

        match self.negotiate() {
            Ok(card_type) => {
                self.card_type = card_type;
                self.set_clock(Config::FAST_CLOCK_HZ);
                self.status.remove(DriveStatus::NOT_INITIALIZED);
                info!(
                    "SD successfully initialized, type: 0x{:02X}",
                    card_type.bits()
                );
                Ok(self.status)
            }
            Err(err) => {
                self.status.insert(DriveStatus::NOT_INITIALIZED);
                error!("Failed to initialize SD");
                Err(err)
            }
        }
    }

    fn status(&self, drive: u8) -> Result<DriveStatus, Self::Error> {
        Self::validate_drive(drive)?;

        Ok(self.status)
    }

    fn read(
        &mut self,
        drive: u8,
        buf: &mut [u8],
        sector: Lba,
        count: usize,
    ) -> Result<(), Self::Error> {
        Self::validate_drive(drive)?;
        Self::validate_count(buf.len(), count)?;
        self.validate_initialized()?;

        self.read_sectors(buf, sector, count)
    }

    fn write(&mut self, drive: u8, buf: &[u8], sector: Lba, count: usize) -> Result<(), Self::Error> {
        Self::validate_drive(drive)?;
        Self::validate_count(buf.len(), count)?;
        self.validate_initialized()?;

        if self.status.contains(DriveStatus::WRITE_PROTECTED) {
            return Err(Error::WriteProtected);
        }

        self.write_sectors(buf, sector, count)
    }

    fn ioctl(&mut self, drive: u8, cmd: IoctlCmd<'_>) -> Result<(), Self::Error> {
        Self::validate_drive(drive)?;
        self.validate_initialized()?;

        self.control(cmd)
    }
}
