use crate::consts::{tokens, IF_COND_CHECK_PATTERN};

use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub not_response, _: 7;
}

impl R1Response {
    /// Card is ready, no error.
    pub const READY_STATE: Self = Self(0x00);
    /// Card is idle, no error.
    pub const IN_IDLE_STATE: Self = Self(0x01);
    /// Nothing answered, or the card never released the bus.
    pub const NOT_READY: Self = Self(0xFF);

    /// A response byte always has its top bit clear.
    pub fn is_valid(&self) -> bool {
        !self.not_response()
    }

    /// Idle or ready, with no error bit set.
    pub fn is_accepted(&self) -> bool {
        self.0 <= Self::IN_IDLE_STATE.0
    }
}

bitfield! {
    /// Operating Conditions Register, as returned by READ_OCR.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Ocr(u32);
    impl Debug;
    pub card_capacity_status, _: 30;
}

impl From<[u8; 4]> for Ocr {
    fn from(data: [u8; 4]) -> Self {
        Ocr(u32::from_be_bytes(data))
    }
}

/// R7 payload of SEND_IF_COND.
pub type R7Payload = [u8; 4];

/// Whether the SEND_IF_COND echo carries back the voltage and check pattern.
pub fn if_cond_echo_matches(echo: R7Payload) -> bool {
    u32::from_be_bytes(echo) & 0xFFFF == IF_COND_CHECK_PATTERN
}

/// Whether the data response token after a write block reports acceptance.
pub fn data_accepted(response: u8) -> bool {
    response & tokens::DATA_RES_MASK == tokens::DATA_RES_ACCEPTED
}
