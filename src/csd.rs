use crate::consts::BLOCK_SIZE_U64;

use bitfield::bitfield;
use size::{consts::KiB, Size};

/// Card Specific Data block.
pub type CsdData = [u8; 16];

/// SD Status block, as returned by ACMD13.
pub type SdStatusData = [u8; 64];

bitfield! {
    /// Card Specific Data, version 1 (SD 1.x and MMC).
    pub struct CsdV1(u128);
    impl Debug;
    pub u8, structure, _: 127, 126;
    pub u8, read_block_length, _: 83, 80;
    pub u16, device_size, _: 73, 62;
    pub u8, device_size_multiplier, _: 49, 47;
    pub erase_single_block_enabled, _: 46;
    pub u8, erase_sector_size, _: 45, 39;
    pub u8, max_write_data_length, _: 25, 22;
}

bitfield! {
    /// Card Specific Data, version 2 (SDHC/SDXC).
    pub struct CsdV2(u128);
    impl Debug;
    pub u32, device_size, _: 69, 48;
}

bitfield! {
    /// Erase group view of an MMC Card Specific Data block.
    pub struct CsdMmc(u128);
    impl Debug;
    pub u8, erase_group_size, _: 46, 42;
    pub u8, erase_group_multiplier_low, _: 39, 37;
    pub u8, erase_group_multiplier_high, _: 33, 32;
}

/// Card Specific Data, generic container.
#[derive(Debug)]
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

/// Represents capacity provider.
pub trait CapacityProvider {
    /// Returns the card capacity in bytes.
    fn card_capacity(&self) -> Size;

    /// Returns the card capacity in 512-byte blocks.
    fn card_capacity_blocks(&self) -> u64;
}

impl From<CsdData> for CsdV1 {
    fn from(csd_data: CsdData) -> Self {
        CsdV1(u128::from_be_bytes(csd_data))
    }
}

impl From<CsdData> for CsdV2 {
    fn from(csd_data: CsdData) -> Self {
        CsdV2(u128::from_be_bytes(csd_data))
    }
}

impl From<CsdData> for CsdMmc {
    fn from(csd_data: CsdData) -> Self {
        CsdMmc(u128::from_be_bytes(csd_data))
    }
}

impl From<CsdData> for Csd {
    /// Layout is picked by the CSD structure bits; only "01" is version 2.
    fn from(csd_data: CsdData) -> Self {
        match csd_data[0] >> 6 {
            1 => Csd::V2(CsdV2::from(csd_data)),
            _ => Csd::V1(CsdV1::from(csd_data)),
        }
    }
}

impl CsdV1 {
    /// Erase sector size of an SD 1.x card, in 512-byte blocks.
    pub fn erase_block_sectors(&self) -> u32 {
        (u32::from(self.erase_sector_size()) + 1)
            << self.max_write_data_length().saturating_sub(9)
    }
}

impl CsdMmc {
    /// Erase group size of an MMC, in 512-byte blocks.
    pub fn erase_block_sectors(&self) -> u32 {
        // High multiplier bits are taken from byte 11, not byte 10.
        let multiplier = (u32::from(self.erase_group_multiplier_high()) << 3)
            | u32::from(self.erase_group_multiplier_low());
        (u32::from(self.erase_group_size()) + 1) * (multiplier + 1)
    }
}

impl Csd {
    /// Whether ERASE may be applied to arbitrary sector ranges.
    ///
    /// Only CSD structure 0 gates it on ERASE_BLK_EN.
    pub fn supports_sector_erase(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.structure() != 0 || csd.erase_single_block_enabled(),
            Csd::V2(_) => true,
        }
    }
}

impl CapacityProvider for CsdV1 {
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_blocks() * BLOCK_SIZE_U64)
    }

    fn card_capacity_blocks(&self) -> u64 {
        let bytes = (u64::from(self.device_size()) + 1)
            << (self.device_size_multiplier() + 2 + self.read_block_length());
        bytes / BLOCK_SIZE_U64
    }
}

impl CapacityProvider for CsdV2 {
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_blocks() * BLOCK_SIZE_U64)
    }

    fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * (KiB as u64)
    }
}

impl CapacityProvider for Csd {
    fn card_capacity(&self) -> Size {
        match self {
            Csd::V1(csd) => csd.card_capacity(),
            Csd::V2(csd) => csd.card_capacity(),
        }
    }

    fn card_capacity_blocks(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}

/// SD Status register.
pub struct SdStatus(pub SdStatusData);

impl SdStatus {
    /// Allocation unit size code (AU_SIZE).
    pub fn au_size(&self) -> u8 {
        self.0[10] >> 4
    }

    /// Allocation unit, in 512-byte blocks.
    pub fn erase_block_sectors(&self) -> u32 {
        16u32 << self.au_size()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    const SD1_CSD: CsdData = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
    const SD1_CSD_1K_WRITE: CsdData = hex!("00 7F 00 32 5B 5A 83 AF 7F FF CF 80 16 80 00 6F");
    const SDHC_CSD: CsdData = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

    #[test]
    fn legacy_layout_capacity() {
        let csd = Csd::from(SD1_CSD);
        assert!(matches!(csd, Csd::V1(_)));
        assert_eq!(csd.card_capacity_blocks(), 1_984_000);
        assert_eq!(csd.card_capacity().bytes(), 1_015_808_000);
        assert_eq!(Csd::from(SD1_CSD_1K_WRITE).card_capacity_blocks(), 3_864_576);
    }

    #[test]
    fn contiguous_layout_capacity() {
        let csd = Csd::from(SDHC_CSD);
        assert!(matches!(csd, Csd::V2(_)));
        assert_eq!(csd.card_capacity_blocks(), 7_710_720);
        assert_eq!(
            Csd::from(hex!("40 0E 00 32 5B 59 00 00 3A 91 7F 80 0A 40 00 05")).card_capacity_blocks(),
            15_353_856
        );
    }

    #[test]
    fn hand_built_layouts() {
        // C_SIZE = 0x3FC, C_SIZE_MULT = 7, READ_BL_LEN = 9.
        let mut v1: CsdData = [0; 16];
        v1[5] = 0x09;
        v1[7] = 0xFF;
        v1[9] = 0x03;
        v1[10] = 0x80;
        let v1 = CsdV1::from(v1);
        assert_eq!(v1.device_size(), 0x3FC);
        assert_eq!(v1.device_size_multiplier(), 7);
        assert_eq!(v1.card_capacity_blocks(), (0x3FC + 1) << 9);

        // C_SIZE = 0x00_0001: two 512 KiB units.
        let mut v2: CsdData = [0; 16];
        v2[0] = 0x40;
        v2[9] = 0x01;
        assert_eq!(Csd::from(v2).card_capacity_blocks(), 2 * 1024);
    }

    #[test]
    fn erase_granularity() {
        assert_eq!(CsdV1::from(SD1_CSD).erase_block_sectors(), 32);
        assert_eq!(CsdV1::from(SD1_CSD_1K_WRITE).erase_block_sectors(), 64);
        assert_eq!(CsdMmc::from(SD1_CSD).erase_block_sectors(), 640);
        assert_eq!(CsdMmc::from(SD1_CSD_1K_WRITE).erase_block_sectors(), 100);

        // ERASE_GRP_SIZE = 0; bits 41..40 set, byte 11 clear.
        let mut mmc: CsdData = [0; 16];
        mmc[10] = 0x03;
        assert_eq!(CsdMmc::from(mmc).erase_block_sectors(), 1);
        mmc[11] = 0x03;
        assert_eq!(CsdMmc::from(mmc).erase_block_sectors(), 25);
    }

    #[test]
    fn sector_erase_support() {
        assert!(Csd::from(SD1_CSD).supports_sector_erase());
        let mut no_erase = SD1_CSD;
        no_erase[10] &= !0x40;
        assert!(!Csd::from(no_erase).supports_sector_erase());
        // Structure values 2 and 3 keep the legacy layout but skip the erase bit.
        let mut mmc_no_erase = no_erase;
        mmc_no_erase[0] |= 0x80;
        assert!(matches!(Csd::from(mmc_no_erase), Csd::V1(_)));
        assert!(Csd::from(mmc_no_erase).supports_sector_erase());
        let mut v2_no_erase = SDHC_CSD;
        v2_no_erase[10] &= !0x40;
        assert!(Csd::from(v2_no_erase).supports_sector_erase());
    }

    #[test]
    fn sd_status_allocation_unit() {
        let mut data: SdStatusData = [0; 64];
        data[10] = 0x90;
        let status = SdStatus(data);
        assert_eq!(status.au_size(), 9);
        assert_eq!(status.erase_block_sectors(), 8192);
    }
}
