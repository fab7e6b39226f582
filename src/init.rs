//! Card power-up negotiation.
//!
//! [`InitState`] holds every protocol decision as a pure transition, the
//! driver only feeds it bus responses and the negotiation window.

use crate::{
    bus::{BusClock, Deadline, TimeSource},
    config::SdSpiConfig,
    consts::{timing, Command, BLOCK_SIZE_U32, HCS_BIT, IF_COND_CHECK_PATTERN, POWER_UP_IDLE_BYTES},
    response::{if_cond_echo_matches, Ocr, R1Response, R7Payload},
    status::CardType,
    Error, ErrorFor, SdSpiDisk,
};

use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};
#[cfg(feature = "log")]
use log::{debug, trace, warn};

/// Why a negotiation ended in [`InitState::Failed`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailure {
    /// GO_IDLE_STATE answered something other than "idle".
    NotIdle(u8),
    /// SEND_IF_COND was accepted but echoed the wrong pattern.
    VoltageMismatch(u32),
    /// The negotiation window elapsed.
    Timeout,
    /// A command was refused.
    Rejected(Command, u8),
}

/// Negotiation state.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Card powered, nothing sent yet. Sends GO_IDLE_STATE.
    PoweredUp,
    /// Card idle in SPI mode. Probes SEND_IF_COND.
    IdleNegotiated,
    /// SD v2 voltage check passed. Polls ACMD41 with HCS.
    VoltageChecked,
    /// SD v2 left idle. Reads the OCR for the addressing mode.
    CapacityQuery,
    /// SEND_IF_COND refused. Probes ACMD41 to tell SD v1 from MMC.
    LegacyProbe,
    /// SD v1 or MMC. Polls its operating condition command.
    LegacyNegotiated(CardType),
    /// Legacy card left idle. Forces a 512 byte block length.
    SettingBlockLength(CardType),
    /// Negotiated.
    Ready(CardType),
    /// Gave up.
    Failed(InitFailure),
}

/// What the card did in answer to [`InitState::command`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitEvent {
    /// R1 response, and the trailing 4 bytes when [`InitState::expects_payload`].
    Reply { r1: R1Response, payload: R7Payload },
    /// Negotiation window elapsed before the command was sent.
    Expired,
}

impl InitEvent {
    /// Reply without a payload.
    pub fn r1(r1: u8) -> Self {
        InitEvent::Reply {
            r1: R1Response(r1),
            payload: [0; 4],
        }
    }
}

impl InitState {
    /// Command and argument to send from this state, `None` once terminal.
    pub fn command(&self) -> Option<(Command, u32)> {
        match self {
            InitState::PoweredUp => Some((Command::GoIdleState, 0)),
            InitState::IdleNegotiated => Some((Command::SendIfCond, IF_COND_CHECK_PATTERN)),
            InitState::VoltageChecked => Some((Command::SdSendOpCond, HCS_BIT)),
            InitState::CapacityQuery => Some((Command::ReadOcr, 0)),
            InitState::LegacyProbe => Some((Command::SdSendOpCond, 0)),
            InitState::LegacyNegotiated(card_type) if card_type.is_sd() => {
                Some((Command::SdSendOpCond, 0))
            }
            InitState::LegacyNegotiated(_) => Some((Command::SendOpCond, 0)),
            InitState::SettingBlockLength(_) => Some((Command::SetBlockLen, BLOCK_SIZE_U32)),
            InitState::Ready(_) | InitState::Failed(_) => None,
        }
    }

    /// Whether the negotiation window bounds this step.
    pub fn is_bounded(&self) -> bool {
        matches!(
            self,
            InitState::VoltageChecked
                | InitState::CapacityQuery
                | InitState::LegacyNegotiated(_)
                | InitState::SettingBlockLength(_)
        )
    }

    /// Whether a 4 byte payload follows `r1` in this state.
    pub fn expects_payload(&self, r1: R1Response) -> bool {
        match self {
            InitState::IdleNegotiated => r1 == R1Response::IN_IDLE_STATE,
            InitState::CapacityQuery => r1 == R1Response::READY_STATE,
            _ => false,
        }
    }

    /// Next state after `event`.
    pub fn step(self, event: InitEvent) -> InitState {
        let (r1, payload) = match (self, event) {
            (InitState::Ready(_) | InitState::Failed(_), _) => return self,
            (_, InitEvent::Expired) => return InitState::Failed(InitFailure::Timeout),
            (_, InitEvent::Reply { r1, payload }) => (r1, payload),
        };

        match self {
            InitState::PoweredUp if r1 == R1Response::IN_IDLE_STATE => InitState::IdleNegotiated,
            InitState::PoweredUp => InitState::Failed(InitFailure::NotIdle(r1.0)),
            InitState::IdleNegotiated if r1 != R1Response::IN_IDLE_STATE => InitState::LegacyProbe,
            InitState::IdleNegotiated if if_cond_echo_matches(payload) => InitState::VoltageChecked,
            InitState::IdleNegotiated => {
                InitState::Failed(InitFailure::VoltageMismatch(u32::from_be_bytes(payload)))
            }
            InitState::VoltageChecked if r1 == R1Response::READY_STATE => InitState::CapacityQuery,
            InitState::VoltageChecked => InitState::VoltageChecked,
            InitState::CapacityQuery if r1 == R1Response::READY_STATE => {
                if Ocr::from(payload).card_capacity_status() {
                    InitState::Ready(CardType::SD2 | CardType::BLOCK)
                } else {
                    InitState::Ready(CardType::SD2)
                }
            }
            InitState::CapacityQuery => {
                InitState::Failed(InitFailure::Rejected(Command::ReadOcr, r1.0))
            }
            InitState::LegacyProbe if r1.is_accepted() => InitState::LegacyNegotiated(CardType::SD1),
            InitState::LegacyProbe => InitState::LegacyNegotiated(CardType::MMC),
            InitState::LegacyNegotiated(card_type) if r1 == R1Response::READY_STATE => {
                InitState::SettingBlockLength(card_type)
            }
            InitState::LegacyNegotiated(_) => self,
            InitState::SettingBlockLength(card_type) if r1 == R1Response::READY_STATE => {
                InitState::Ready(card_type)
            }
            InitState::SettingBlockLength(_) => {
                InitState::Failed(InitFailure::Rejected(Command::SetBlockLen, r1.0))
            }
            InitState::Ready(_) | InitState::Failed(_) => self,
        }
    }
}

impl<Spi, Cs, Time, Config> SdSpiDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + BusClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdSpiConfig,
{
    /// Let the card logic settle: slow clock, at least 74 clocks with chip select released.
    fn power_up(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.set_clock(Config::SLOW_CLOCK_HZ);
        self.cs.off().map_err(Error::Select)?;
        self.skip(POWER_UP_IDLE_BYTES)
    }

    /// Runs the negotiation from [`InitState::PoweredUp`] and classifies the card.
    pub(crate) fn negotiate(&mut self) -> Result<CardType, ErrorFor<Spi, Cs>> {
        self.transaction(|s| {
            s.power_up()?;

            // The card may not answer this one; it only has to see it.
            s.send_go_idle_no_wait()?;

            let mut state = InitState::PoweredUp;
            let mut window = Deadline::start(&s.time, timing::NEGOTIATION_MS);

            while let Some((command, arg)) = state.command() {
                if state == InitState::IdleNegotiated {
                    window = Deadline::start(&s.time, timing::NEGOTIATION_MS);
                }

                let event = if state.is_bounded() && window.is_expired(&s.time) {
                    InitEvent::Expired
                } else {
                    let r1 = s.send_command(command, arg)?;
                    let mut payload = [0; 4];
                    if state.expects_payload(r1) {
                        s.receive_slice(&mut payload)?;
                    }
                    InitEvent::Reply { r1, payload }
                };

                let next = state.step(event);
                if next != state {
                    trace!("SD negotiation: {:?} -> {:?}", state, next);
                }
                state = next;
            }

            match state {
                InitState::Ready(card_type) => {
                    debug!("SD negotiated, type: 0x{:02X}", card_type.bits());
                    Ok(card_type)
                }
                InitState::Failed(failure) => {
                    warn!("SD negotiation failed: {:?}", failure);
                    Err(Error::from(failure))
                }
                // Only terminal states have no command.
                _ => Err(Error::TimeoutNegotiation),
            }
        })
    }
}
