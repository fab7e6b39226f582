/// Sector size, fixed for every card family.
pub const BLOCK_SIZE: usize = 512;
/// Sector size as `u32`, for address arithmetic.
pub const BLOCK_SIZE_U32: u32 = BLOCK_SIZE as u32;
/// Sector size as `u64`, for capacity arithmetic.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

/// Idle byte clocked out while the host only listens.
pub const IDLE_BYTE: u8 = 0xFF;
/// Bytes clocked with chip select released at power-up (80 clocks).
pub const POWER_UP_IDLE_BYTES: usize = 10;
/// SEND_IF_COND argument: 2.7-3.6V supply plus the 0xAA check pattern.
pub const IF_COND_CHECK_PATTERN: u32 = 0x0000_01AA;
/// ACMD41 host capacity support bit.
pub const HCS_BIT: u32 = 1 << 30;

pub mod timing {
    /// Budget for the card to release the bus (0xFF), in ms.
    pub const READY_WAIT_MS: u32 = 500;
    /// Budget for the whole negotiation after GO_IDLE_STATE, in ms.
    pub const NEGOTIATION_MS: u32 = 1000;
    /// Budget for a data start token, in ms.
    pub const DATA_TOKEN_MS: u32 = 200;
    /// Budget for an erase to finish, in ms.
    pub const ERASE_MS: u32 = 30_000;
    /// Byte-times polled for an R1 response.
    pub const R1_POLL_BYTES: usize = 10;
}

/// Card command.
///
/// App-specific commands carry [`Command::APP_FLAG`] in their discriminant and
/// are sent after APP_CMD with the flag masked off.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// CMD0 GO_IDLE_STATE - software reset, enters SPI mode with CS asserted.
    GoIdleState = 0,
    /// CMD1 SEND_OP_COND - MMC initialization.
    SendOpCond = 1,
    /// CMD8 SEND_IF_COND - verify interface operating condition.
    SendIfCond = 8,
    /// CMD9 SEND_CSD - read the Card Specific Data register.
    SendCsd = 9,
    /// CMD10 SEND_CID - read the Card Identification register.
    SendCid = 10,
    /// CMD12 STOP_TRANSMISSION - end a multiple block read.
    StopTransmission = 12,
    /// CMD16 SET_BLOCKLEN.
    SetBlockLen = 16,
    /// CMD17 READ_SINGLE_BLOCK.
    ReadSingleBlock = 17,
    /// CMD18 READ_MULTIPLE_BLOCK.
    ReadMultipleBlock = 18,
    /// CMD24 WRITE_BLOCK.
    WriteBlock = 24,
    /// CMD25 WRITE_MULTIPLE_BLOCK.
    WriteMultipleBlock = 25,
    /// CMD32 ERASE_WR_BLK_START.
    EraseStart = 32,
    /// CMD33 ERASE_WR_BLK_END.
    EraseEnd = 33,
    /// CMD38 ERASE.
    Erase = 38,
    /// CMD55 APP_CMD - escape for the next application specific command.
    AppCmd = 55,
    /// CMD58 READ_OCR.
    ReadOcr = 58,
    /// ACMD13 SD_STATUS.
    SdStatus = 0x80 | 13,
    /// ACMD23 SET_WR_BLK_ERASE_COUNT - pre-erase hint for multi-block writes.
    SetWrBlkEraseCount = 0x80 | 23,
    /// ACMD41 SD_SEND_OP_COND - SD initialization.
    SdSendOpCond = 0x80 | 41,
}

impl Command {
    /// Marks an app-specific command.
    pub const APP_FLAG: u8 = 0x80;

    /// Whether APP_CMD must precede this command.
    pub const fn is_app(self) -> bool {
        (self as u8) & Self::APP_FLAG != 0
    }

    /// Index put on the wire.
    pub const fn index(self) -> u8 {
        (self as u8) & !Self::APP_FLAG
    }
}

pub mod tokens {
    /// Start token for a read block or a single block write.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Start token for each block of a multiple block write.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Stop token ending a multiple block write.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
}
