//! SD/MMC sector driver written in Embedded Rust, that inspired by [embedded-sdmmc](https://crates.io/crates/embedded-sdmmc).
//!
//! This crate is intended to allow a FAT-style file-system layer to init/read/write
//! SD/MMC cards by SPI bus, addressed by drive number and 512-byte sector.
//!
//! ```rust,ignore
//! use sd_spi_disk::{DiskIo, IoctlCmd, SdSpiDisk};
//!
//! let mut disk: SdSpiDisk<_, _, _> = SdSpiDisk::new(spi, cs.into_active_low_switch(), ticks);
//! disk.initialize(0)?;
//!
//! let mut sectors = 0;
//! disk.ioctl(0, IoctlCmd::GetSectorCount(&mut sectors))?;
//!
//! let mut buf = [0u8; 1024];
//! disk.read(0, &mut buf, 0, 2)?;
//! ```
//!
//! ## Features
//!
//! * `log` (default): log messages through the `log` facade.
//! * `defmt-log`: turn off the default features and enable this one to log over defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]

mod bus;
mod command;
mod config;
mod consts;
mod crc;
mod csd;
mod disk;
mod init;
mod ioctl;
mod response;
mod status;
mod transfer;

pub use crate::bus::{BusClock, Deadline, FixedRate, TimeSource};
pub use crate::command::CommandFrame;
pub use crate::config::{DefaultSdSpiConfig, SdSpiConfig};
pub use crate::consts::{Command, BLOCK_SIZE};
pub use crate::csd::{
    CapacityProvider, Csd, CsdData, CsdMmc, CsdV1, CsdV2, SdStatus, SdStatusData,
};
pub use crate::disk::DiskIo;
pub use crate::init::{InitEvent, InitFailure, InitState};
pub use crate::ioctl::{CidData, IoctlCmd, OcrData};
pub use crate::response::{Ocr, R1Response};
pub use crate::status::{CardType, DiskResult, DriveStatus};
pub use crate::transfer::{poll_data_token, TokenPoll};

use core::marker::PhantomData;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Sector number, as seen by the file-system layer.
pub type Lba = u32;

/// [`SdSpiDisk`] result error.
///
/// `T` - transport error type.
/// `S` - select switch error type.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't drive the chip select.
    Select(S),
    /// Drive number is not served by this driver.
    InvalidDrive(u8),
    /// Zero sector count, short buffer or out of range address.
    InvalidArgument,
    /// Operation is not available for this card.
    NotSupported,
    /// Drive has not been initialized.
    NotInitialized,
    /// No card in the socket.
    NoMedia,
    /// Card is write protected.
    WriteProtected,
    /// Card kept the bus busy past the ready budget.
    TimeoutWaitReady,
    /// No data start token within its budget.
    TimeoutDataToken,
    /// Negotiation window elapsed before the card left the idle state.
    TimeoutNegotiation,
    /// Erase did not finish within its budget.
    TimeoutErase,
    /// No response when executing this command.
    TimeoutCommand(Command),
    /// Command answered with an error response.
    ErrorCommand(Command, u8),
    /// GO_IDLE_STATE did not put the card into the idle state.
    NotIdle(u8),
    /// SEND_IF_COND echoed an unexpected voltage or check pattern.
    VoltageMismatch(u32),
    /// Read returned something other than a data start token.
    BadDataToken(u8),
    /// Card refused a written data block.
    WriteRejected(u8),
    /// Card cannot erase arbitrary sector ranges.
    EraseNotSupported,
}

/// Error classes reported to the file-system layer.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad drive number, count or command.
    Parameter,
    /// Drive is not ready for the operation.
    NotReady,
    /// Drive is write protected.
    WriteProtected,
    /// Card did not answer within a protocol deadline.
    TransportTimeout,
    /// Card answered with something unexpected.
    Protocol,
    /// Bus peripheral or chip select failed.
    Hardware,
}

impl<T, S> Error<T, S> {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Select(_) => ErrorKind::Hardware,
            Error::InvalidDrive(_) | Error::InvalidArgument | Error::NotSupported => {
                ErrorKind::Parameter
            }
            Error::NotInitialized | Error::NoMedia => ErrorKind::NotReady,
            Error::WriteProtected => ErrorKind::WriteProtected,
            Error::TimeoutWaitReady
            | Error::TimeoutDataToken
            | Error::TimeoutNegotiation
            | Error::TimeoutErase
            | Error::TimeoutCommand(_) => ErrorKind::TransportTimeout,
            Error::ErrorCommand(..)
            | Error::NotIdle(_)
            | Error::VoltageMismatch(_)
            | Error::BadDataToken(_)
            | Error::WriteRejected(_)
            | Error::EraseNotSupported => ErrorKind::Protocol,
        }
    }

    /// Error for a command that did not answer with the ready state.
    pub(crate) fn from_response(command: Command, r1: R1Response) -> Self {
        if r1 == R1Response::NOT_READY {
            Error::TimeoutCommand(command)
        } else {
            Error::ErrorCommand(command, r1.0)
        }
    }
}

impl<T, S> From<InitFailure> for Error<T, S> {
    fn from(failure: InitFailure) -> Self {
        match failure {
            InitFailure::NotIdle(r1) => Error::NotIdle(r1),
            InitFailure::VoltageMismatch(echo) => Error::VoltageMismatch(echo),
            InitFailure::Timeout => Error::TimeoutNegotiation,
            InitFailure::Rejected(command, r1) => Error::from_response(command, R1Response(r1)),
        }
    }
}

impl DiskResult {
    /// Result code for the outcome of a driver operation.
    pub fn from_result<R, T, S>(result: &Result<R, Error<T, S>>) -> Self {
        match result {
            Ok(_) => DiskResult::Ok,
            Err(err) => match err.kind() {
                ErrorKind::Parameter => DiskResult::ParameterError,
                ErrorKind::NotReady => DiskResult::NotReady,
                ErrorKind::WriteProtected => DiskResult::WriteProtected,
                ErrorKind::TransportTimeout | ErrorKind::Protocol | ErrorKind::Hardware => {
                    DiskResult::Error
                }
            },
        }
    }
}

/// Error type alias.
type ErrorFor<Spi, Cs> = Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

/// SD Card SPI driver, the device context of one physical drive.
///
/// `Spi` - SPI with clock rate control.
/// `Cs` - Chip select output switch, `on` asserts the card.
/// `Time` - Monotonic millisecond tick source.
/// `Config` - Config implementation of driver config trait.
pub struct SdSpiDisk<Spi, Cs, Time, Config = DefaultSdSpiConfig> {
    spi: Spi,
    cs: Cs,
    time: Time,
    status: DriveStatus,
    card_type: CardType,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Time, Config> SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    /// Creates a new [`SdSpiDisk<Spi, Cs, Time, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `time` - millisecond tick source.
    pub fn new(spi: Spi, cs: Cs, time: Time) -> Self {
        SdSpiDisk {
            spi,
            cs,
            time,
            status: DriveStatus::NOT_INITIALIZED,
            card_type: CardType::empty(),
            config: PhantomData::<Config>,
        }
    }

    /// Card classification of the last successful negotiation.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Updates the socket flags from card-detect and write-protect switches.
    ///
    /// A removed card also drops the drive back to `NOT_INITIALIZED`.
    pub fn set_socket(&mut self, present: bool, write_protected: bool) {
        self.status
            .set(DriveStatus::WRITE_PROTECTED, write_protected);
        if present {
            self.status.remove(DriveStatus::NO_MEDIA);
        } else {
            self.status
                .insert(DriveStatus::NO_MEDIA | DriveStatus::NOT_INITIALIZED);
            self.card_type = CardType::empty();
        }
    }

    /// Forgets the negotiated card, a new `initialize` is required.
    pub fn reset(&mut self) {
        self.status.insert(DriveStatus::NOT_INITIALIZED);
        self.card_type = CardType::empty();
    }

    /// Releases the bus, chip select and tick source.
    pub fn free(self) -> (Spi, Cs, Time) {
        (self.spi, self.cs, self.time)
    }
}
