use bitflags::bitflags;

bitflags! {
    /// Drive status flags, as seen by the file-system layer.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct DriveStatus: u8 {
        /// Drive has not been negotiated yet, or the last negotiation failed.
        const NOT_INITIALIZED = 0x01;
        /// No card in the socket.
        const NO_MEDIA = 0x02;
        /// Card is write protected.
        const WRITE_PROTECTED = 0x04;
    }
}

bitflags! {
    /// Card classification, set by a successful negotiation.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct CardType: u8 {
        /// MMC version 3.
        const MMC = 0x01;
        /// SD version 1.
        const SD1 = 0x02;
        /// SD version 2.
        const SD2 = 0x04;
        /// Any SD card.
        const SDC = Self::SD1.bits | Self::SD2.bits;
        /// Sector addressed; otherwise addresses are byte offsets.
        const BLOCK = 0x08;
    }
}

impl CardType {
    /// Whether sector numbers must be scaled to byte offsets.
    pub fn is_byte_addressed(&self) -> bool {
        !self.contains(CardType::BLOCK)
    }

    /// Whether the card speaks the SD application command set.
    pub fn is_sd(&self) -> bool {
        self.intersects(CardType::SDC)
    }
}

/// Coarse result code handed to a file-system layer.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskResult {
    /// Succeeded.
    Ok,
    /// Hard error during the operation.
    Error,
    /// Drive is not initialized.
    NotReady,
    /// Drive is write protected.
    WriteProtected,
    /// Invalid drive, count or command.
    ParameterError,
}
