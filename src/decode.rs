//! Bit layout of a raw 64-bit event word, and the `Decoder` stage that turns
//! an `UndecodedHit` into a `RawHit` (`SPEC_FULL.md` §4.3).

use crate::buffer::EventBuffer;
use crate::event::{RawHit, UndecodedHit};
use crate::handler::Handler;

/// Compensates a hardware read-clock offset shared by both fine-interpolator
/// fields.
const FINE_ROTATION: u16 = 27;

/// A still-packed event word, with accessors for each bit field. The layout
/// is, from the low bit: `efine[0..10) tfine[10..20) ecoarse[20..30)
/// tcoarse[30..40) tac_id[40..42) channel_id[42..)`.
#[derive(Debug, Clone, Copy)]
pub struct RawEventWord(pub u64);

impl RawEventWord {
    pub fn efine(&self) -> u16 {
        (((self.0 % 1024) as u16) + FINE_ROTATION) % 1024
    }

    pub fn tfine(&self) -> u16 {
        ((((self.0 >> 10) % 1024) as u16) + FINE_ROTATION) % 1024
    }

    pub fn ecoarse(&self) -> u16 {
        ((self.0 >> 20) % 1024) as u16
    }

    pub fn tcoarse(&self) -> u16 {
        ((self.0 >> 30) % 1024) as u16
    }

    pub fn tac_id(&self) -> u8 {
        ((self.0 >> 40) % 4) as u8
    }

    pub fn channel_id(&self) -> u32 {
        (self.0 >> 42) as u32
    }
}

/// Resolves whether a given channel digitises charge (QDC) or duration
/// (time-over-threshold); supplied by the reader from the file header / the
/// optional per-channel `.modf` override table.
pub trait ChannelModeTable: Send {
    fn is_qdc(&self, channel_id: u32) -> bool;
}

pub struct Decoder<M> {
    modes: M,
}

impl<M: ChannelModeTable> Decoder<M> {
    pub fn new(modes: M) -> Self {
        Decoder { modes }
    }
}

impl<M: ChannelModeTable> Handler<UndecodedHit, RawHit> for Decoder<M> {
    fn handle_events(&mut self, buffer: EventBuffer<UndecodedHit>) -> EventBuffer<RawHit> {
        let n = buffer.len();
        // `UndecodedHit` is a plain Copy record, so a cheap snapshot lets us
        // both keep `buffer` alive in the parent chain below and iterate its
        // contents without fighting the borrow checker over `out`.
        let inputs: Vec<UndecodedHit> = buffer.as_slice().to_vec();
        let mut out: EventBuffer<RawHit> = EventBuffer::derived_from(n, buffer);

        for undecoded in inputs {
            let word = RawEventWord(undecoded.event_word);
            let channel_id = word.channel_id();
            let tcoarse = word.tcoarse();
            let ecoarse = word.ecoarse();

            let time = (undecoded.frame_id as i64) * 1024 + tcoarse as i64;
            let mut time_end = (undecoded.frame_id as i64) * 1024 + ecoarse as i64;
            if time_end - time < -256 {
                time_end += 1024;
            }

            out.push(RawHit {
                valid: true,
                qdc_mode: self.modes.is_qdc(channel_id),
                channel_id,
                tac_id: word.tac_id(),
                frame_id: undecoded.frame_id,
                tcoarse,
                ecoarse,
                tfine: word.tfine(),
                efine: word.efine(),
                time,
                time_end,
            });
        }

        out
    }
}
