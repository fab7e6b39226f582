/// Represents config for [`SdSpiDisk`](crate::SdSpiDisk).
pub trait SdSpiConfig {
    /// Physical drive number served by the driver.
    const DRIVE: u8;
    /// Bus clock while negotiating, in Hz. Cards require 100-400 kHz here.
    const SLOW_CLOCK_HZ: u32;
    /// Bus clock once the card is ready, in Hz.
    const FAST_CLOCK_HZ: u32;
}

/// Default implementation of [`SdSpiConfig`](crate::SdSpiConfig).
pub struct DefaultSdSpiConfig;

impl SdSpiConfig for DefaultSdSpiConfig {
    const DRIVE: u8 = 0;
    const SLOW_CLOCK_HZ: u32 = 280_000;
    const FAST_CLOCK_HZ: u32 = 4_500_000;
}
