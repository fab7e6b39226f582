//! Simulated SD/MMC card on an SPI bus.
//!
//! Every byte on the bus advances the shared tick by 1 ms.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    convert::Infallible,
    mem,
    rc::Rc,
};

use embedded_hal::blocking::spi::Transfer;
use hex_literal::hex;
use sd_spi_disk::{BusClock, SdSpiDisk, TimeSource};
use switch_hal::OutputSwitch;

pub const SDHC_CSD: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
pub const SD1_CSD: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
pub const CID: [u8; 16] = hex!("03 53 44 53 44 31 36 47 80 12 34 56 78 00 D4 01");

const APP: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    SdV2 { high_capacity: bool },
    SdV1,
    Mmc,
    /// Never answers anything.
    Silent,
}

enum Mode {
    Command,
    ReadStream { address: u32 },
    Receive { multi: bool, address: u32, index: usize, data: Option<Vec<u8>> },
}

pub struct Card {
    family: Family,
    ticks: Rc<Cell<u32>>,
    selected: bool,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    mode: Mode,
    app: bool,
    idle: bool,
    busy: u32,
    streamed: usize,
    erase_start: u32,
    erase_end: u32,

    /// Op-cond polls answered "idle" before the card gets ready.
    pub busy_polls: u32,
    /// Op-cond polls never leave "idle".
    pub never_ready: bool,
    /// Card holds MISO low forever.
    pub stuck_busy: bool,
    /// Replaces the SEND_IF_COND echo.
    pub echo: Option<[u8; 4]>,
    /// Read commands are accepted but no start token follows.
    pub silent_data: bool,
    /// Token sent instead of the start token.
    pub bad_token: Option<u8>,
    /// Read stream goes silent after this many blocks.
    pub stream_limit: Option<usize>,
    /// Block index within a write command whose data is refused.
    pub reject_block: Option<usize>,

    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub sd_status: [u8; 64],
    pub storage: Vec<u8>,

    /// Commands seen, app commands flagged with 0x80.
    pub commands: Vec<(u8, u32)>,
    pub exchanges: usize,
    pub clocks: Vec<u32>,
    pub blocks_written: usize,
    pub stop_tokens: usize,
    pub erased: Option<(u32, u32)>,
}

impl Card {
    pub fn new(family: Family, sectors: usize) -> Self {
        let mut sd_status = [0u8; 64];
        sd_status[10] = 0x90;

        Card {
            family,
            ticks: Rc::new(Cell::new(0)),
            selected: false,
            out: VecDeque::new(),
            frame: Vec::new(),
            mode: Mode::Command,
            app: false,
            idle: false,
            busy: 0,
            streamed: 0,
            erase_start: 0,
            erase_end: 0,
            busy_polls: 2,
            never_ready: false,
            stuck_busy: false,
            echo: None,
            silent_data: false,
            bad_token: None,
            stream_limit: None,
            reject_block: None,
            csd: match family {
                Family::SdV2 { .. } => SDHC_CSD,
                _ => SD1_CSD,
            },
            cid: CID,
            sd_status,
            storage: vec![0; sectors * 512],
            commands: Vec::new(),
            exchanges: 0,
            clocks: Vec::new(),
            blocks_written: 0,
            stop_tokens: 0,
            erased: None,
        }
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.get()
    }

    pub fn sector(&self, sector: usize) -> &[u8] {
        &self.storage[sector * 512..(sector + 1) * 512]
    }

    pub fn sector_mut(&mut self, sector: usize) -> &mut [u8] {
        &mut self.storage[sector * 512..(sector + 1) * 512]
    }

    pub fn has_command(&self, index: u8, arg: u32) -> bool {
        self.commands.contains(&(index, arg))
    }

    pub fn has_index(&self, index: u8) -> bool {
        self.commands.iter().any(|(i, _)| *i == index)
    }

    fn block_addressed(&self) -> bool {
        self.family == Family::SdV2 { high_capacity: true }
    }

    fn offset(&self, address: u32) -> usize {
        if self.block_addressed() {
            address as usize * 512
        } else {
            address as usize
        }
    }

    fn set_selected(&mut self, selected: bool) {
        if !selected {
            self.out.clear();
            self.frame.clear();
            self.mode = Mode::Command;
        }
        self.selected = selected;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        self.exchanges += 1;
        self.ticks.set(self.ticks.get().wrapping_add(1));

        if !self.selected || self.family == Family::Silent {
            return 0xFF;
        }
        if self.stuck_busy {
            return 0x00;
        }

        let miso = self.next_out();
        self.absorb(mosi);
        miso
    }

    fn next_out(&mut self) -> u8 {
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if let Mode::ReadStream { address } = self.mode {
            let offset = self.offset(address) + self.streamed * 512;
            let in_limit = self.stream_limit.map_or(true, |limit| self.streamed < limit);
            // Past the last sector the card stops sending blocks.
            if in_limit && offset + 512 <= self.storage.len() {
                let data = self.storage[offset..offset + 512].to_vec();
                self.streamed += 1;
                self.queue_block(&data);
                return self.out.pop_front().unwrap_or(0xFF);
            }
            return 0xFF;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        0xFF
    }

    fn absorb(&mut self, mosi: u8) {
        if let Mode::Receive { .. } = self.mode {
            self.absorb_data(mosi);
            return;
        }

        if self.frame.is_empty() && mosi & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(mosi);
        if self.frame.len() == 6 {
            let frame = mem::take(&mut self.frame);
            let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
            self.command(frame[0] & 0x3F, arg);
        }
    }

    fn absorb_data(&mut self, mosi: u8) {
        let (multi, address, mut index, mut data) = match mem::replace(&mut self.mode, Mode::Command) {
            Mode::Receive { multi, address, index, data } => (multi, address, index, data),
            _ => return,
        };

        match data.as_mut() {
            None => match mosi {
                0xFE if !multi => data = Some(Vec::new()),
                0xFC if multi => data = Some(Vec::new()),
                0xFD if multi => {
                    self.stop_tokens += 1;
                    self.busy = 4;
                    return;
                }
                _ => {}
            },
            Some(block) => {
                block.push(mosi);
                if block.len() == 514 {
                    if self.reject_block == Some(index) {
                        self.out.push_back(0x0D);
                    } else {
                        let offset = self.offset(address) + index * 512;
                        self.storage[offset..offset + 512].copy_from_slice(&block[..512]);
                        self.blocks_written += 1;
                        self.out.push_back(0xE5);
                        self.busy = 3;
                    }
                    index += 1;
                    data = None;
                    if !multi {
                        return;
                    }
                }
            }
        }

        self.mode = Mode::Receive { multi, address, index, data };
    }

    fn respond(&mut self, r1: u8, payload: &[u8]) {
        self.out.push_back(0xFF);
        self.out.push_back(r1);
        self.out.extend(payload.iter().copied());
    }

    fn queue_block(&mut self, data: &[u8]) {
        if self.silent_data {
            return;
        }
        self.out.push_back(0xFF);
        self.out.push_back(self.bad_token.unwrap_or(0xFE));
        if self.bad_token.is_some() {
            return;
        }
        self.out.extend(data.iter().copied());
        self.out.extend([0x00, 0x00]);
    }

    fn op_cond(&mut self) {
        if self.never_ready || self.busy_polls > 0 {
            self.busy_polls = self.busy_polls.saturating_sub(1);
            self.respond(0x01, &[]);
        } else {
            self.idle = false;
            self.respond(0x00, &[]);
        }
    }

    fn command(&mut self, index: u8, arg: u32) {
        let app = mem::take(&mut self.app);
        self.commands.push((if app { index | APP } else { index }, arg));

        let r1 = if self.idle { 0x01 } else { 0x00 };
        let sd = self.family != Family::Mmc;

        match (app, index) {
            (_, 0) => {
                self.idle = true;
                self.respond(0x01, &[]);
            }
            (false, 8) => match self.family {
                Family::SdV2 { .. } => {
                    let echo = self.echo.unwrap_or((arg & 0xFFF).to_be_bytes());
                    self.respond(0x01, &echo);
                }
                _ => self.respond(0x05, &[]),
            },
            (false, 55) if sd => {
                self.app = true;
                self.respond(r1, &[]);
            }
            (true, 41) | (false, 1) => self.op_cond(),
            (false, 58) => {
                let ccs = if self.block_addressed() { 0xC0 } else { 0x80 };
                self.respond(r1, &[ccs, 0xFF, 0x80, 0x00]);
            }
            (false, 16) => self.respond(r1, &[]),
            (false, 9) => {
                self.respond(0x00, &[]);
                let csd = self.csd;
                self.queue_block(&csd);
            }
            (false, 10) => {
                self.respond(0x00, &[]);
                let cid = self.cid;
                self.queue_block(&cid);
            }
            (true, 13) => {
                self.respond(0x00, &[0x00]);
                let status = self.sd_status;
                self.queue_block(&status);
            }
            (false, 17) => {
                self.respond(0x00, &[]);
                let offset = self.offset(arg);
                let data = self.storage[offset..offset + 512].to_vec();
                self.queue_block(&data);
            }
            (false, 18) => {
                self.respond(0x00, &[]);
                self.streamed = 0;
                self.mode = Mode::ReadStream { address: arg };
            }
            (false, 12) => {
                self.out.clear();
                self.mode = Mode::Command;
                // Stuff byte, then R1.
                self.out.extend([0xFF, 0x00]);
            }
            (false, 24) | (false, 25) => {
                self.respond(0x00, &[]);
                self.mode = Mode::Receive {
                    multi: index == 25,
                    address: arg,
                    index: 0,
                    data: None,
                };
            }
            (true, 23) => self.respond(0x00, &[]),
            (false, 32) => {
                self.erase_start = arg;
                self.respond(0x00, &[]);
            }
            (false, 33) => {
                self.erase_end = arg;
                self.respond(0x00, &[]);
            }
            (false, 38) => {
                self.erased = Some((self.erase_start, self.erase_end));
                self.respond(0x00, &[]);
                self.busy = 100;
            }
            _ => self.respond(0x04 | r1, &[]),
        }
    }
}

pub struct SimSpi(pub Rc<RefCell<Card>>);

impl Transfer<u8> for SimSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

impl BusClock for SimSpi {
    fn set_clock(&mut self, hz: u32) {
        self.0.borrow_mut().clocks.push(hz);
    }
}

pub struct SimCs(pub Rc<RefCell<Card>>);

impl OutputSwitch for SimCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_selected(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_selected(false);
        Ok(())
    }
}

pub struct SimTime(pub Rc<Cell<u32>>);

impl TimeSource for SimTime {
    fn now_ms(&self) -> u32 {
        self.0.get()
    }
}

pub type SimDisk = SdSpiDisk<SimSpi, SimCs, SimTime>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Disk wired to `card`, not initialized yet.
pub fn disk(card: Card) -> (SimDisk, Rc<RefCell<Card>>) {
    init_logger();

    let ticks = card.ticks.clone();
    let card = Rc::new(RefCell::new(card));
    let disk = SdSpiDisk::new(SimSpi(card.clone()), SimCs(card.clone()), SimTime(ticks));

    (disk, card)
}
