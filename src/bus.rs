//! Byte transport and chip select framing.

use crate::{
    config::SdSpiConfig,
    consts::{timing, IDLE_BYTE},
    Error, ErrorFor, SdSpiDisk,
};

use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Monotonic millisecond tick source. Wrapping is allowed.
pub trait TimeSource {
    /// Current tick, in ms.
    fn now_ms(&self) -> u32;
}

/// Clock rate control of the serial bus.
pub trait BusClock {
    /// Switches the bus clock to `hz`, or to the closest rate below it.
    fn set_clock(&mut self, hz: u32);
}

/// Adapts a bus whose clock rate is fixed by the board.
pub struct FixedRate<Spi>(pub Spi);

impl<Spi: Transfer<u8>> Transfer<u8> for FixedRate<Spi> {
    type Error = Spi::Error;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        self.0.transfer(words)
    }
}

impl<Spi> BusClock for FixedRate<Spi> {
    fn set_clock(&mut self, _hz: u32) {}
}

/// Time budget anchored at a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: u32,
    budget_ms: u32,
}

impl Deadline {
    pub const fn new(start: u32, budget_ms: u32) -> Self {
        Deadline { start, budget_ms }
    }

    /// Anchors a budget at the current tick.
    pub fn start<T: TimeSource>(time: &T, budget_ms: u32) -> Self {
        Self::new(time.now_ms(), budget_ms)
    }

    /// Whether the budget is used up at tick `now`.
    pub fn is_expired_at(&self, now: u32) -> bool {
        now.wrapping_sub(self.start) >= self.budget_ms
    }

    pub fn is_expired<T: TimeSource>(&self, time: &T) -> bool {
        self.is_expired_at(time.now_ms())
    }
}

impl<Spi, Cs, Time, Config> SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    /// Send one byte and receive one byte.
    pub(crate) fn transfer(&mut self, data: u8) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.spi
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub(crate) fn receive(&mut self) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.transfer(IDLE_BYTE)
    }

    /// Send a byte to the SD card.
    pub(crate) fn send(&mut self, data: u8) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card in one bus transfer.
    pub(crate) fn receive_slice(&mut self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        data.fill(IDLE_BYTE);
        self.spi
            .transfer(data)
            .map(|_| ())
            .map_err(Error::Transport)
    }

    /// Send a slice to the SD card, discarding what comes back.
    pub(crate) fn send_slice(&mut self, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let mut chunk = [0u8; 32];
        for part in data.chunks(chunk.len()) {
            let chunk = &mut chunk[..part.len()];
            chunk.copy_from_slice(part);
            self.spi.transfer(chunk).map_err(Error::Transport)?;
        }

        Ok(())
    }

    /// Skip bytes.
    pub(crate) fn skip(&mut self, count: usize) -> Result<(), ErrorFor<Spi, Cs>> {
        for _ in 0..count {
            self.receive()?;
        }

        Ok(())
    }

    pub(crate) fn set_clock(&mut self, hz: u32) {
        self.spi.set_clock(hz);
    }

    /// Poll until the card releases the bus (0xFF) or `budget_ms` elapses.
    pub(crate) fn wait_ready(&mut self, budget_ms: u32) -> Result<bool, ErrorFor<Spi, Cs>> {
        let deadline = Deadline::start(&self.time, budget_ms);
        loop {
            if self.receive()? == IDLE_BYTE {
                return Ok(true);
            }
            if deadline.is_expired(&self.time) {
                return Ok(false);
            }
        }
    }

    /// Assert chip select and wait for the card to be ready.
    ///
    /// On timeout the card is deselected again and `false` returned.
    pub(crate) fn select(&mut self) -> Result<bool, ErrorFor<Spi, Cs>> {
        self.cs.on().map_err(Error::Select)?;
        self.skip(1)?;

        if self.wait_ready(timing::READY_WAIT_MS)? {
            return Ok(true);
        }

        self.deselect()?;
        Ok(false)
    }

    /// Assert chip select without waiting, for the first command after power-up.
    pub(crate) fn select_no_wait(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.skip(1)?;
        self.cs.on().map_err(Error::Select)?;
        self.skip(1)
    }

    /// Deassert chip select and clock one byte so the card releases MISO.
    pub(crate) fn deselect(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.off().map_err(Error::Select)?;
        self.skip(1)
    }

    /// Runs `f`, then deselects the card whatever the outcome.
    pub(crate) fn transaction<R, F>(&mut self, f: F) -> Result<R, ErrorFor<Spi, Cs>>
    where
        F: FnOnce(&mut Self) -> Result<R, ErrorFor<Spi, Cs>>,
    {
        let result = f(self);
        let released = self.deselect();
        let value = result?;
        released?;

        Ok(value)
    }
}
