//! Frame encoding for the FPGA tactile-modulation firmware.
//!
//! This firmware family uses 16 phase divisions (half of the primary
//! firmware's 32, matching the reduced timing resolution needed for tactile
//! modulation) and adds amplitude-modulation step commands with the bit
//! pattern 101XXXXX. Frames are fixed-size: one command byte followed by one
//! quantized value per local slot, 257 bytes total, no terminator and no
//! checksum.

use crate::element::Element;

/// Elements per board; also the number of value bytes in a frame.
pub const ELEMENT_COUNT: usize = 256;

/// Number of discrete phase/amplitude steps the firmware supports.
pub const DIVISOR: u32 = 16;

/// Fastest rate verified stable across supported host serial stacks.
pub const PREFERRED_BAUD_RATE: u32 = 230_400;

pub const CMD_START_PHASES: u8 = 0xFE;
pub const CMD_SWAP_BUFFERS: u8 = 0xFD;
pub const CMD_MULTIPLEX_TOGGLE: u8 = 0xFC;
pub const CMD_START_AMPLITUDES: u8 = 0xFB;

/// 10100000: high three bits tag the command, low five carry the step.
const CMD_AMP_MOD_BASE: u8 = 0xA0;

/// Out-of-range phase code marking an element as inactive. The firmware
/// treats any phase >= DIVISOR as "transducer off", so no separate flag
/// byte is needed.
pub const PHASE_OFF: u8 = DIVISOR as u8;

/// Continuous amplitudes at or above this fraction of full scale are treated
/// as full output, for which the firmware needs no amplitude frame.
const AMP_MODULATION_THRESHOLD: f32 = 0.99;

/// Build the amp-mod-step command byte. Steps outside 0-31 are truncated
/// into range, not rejected.
pub fn amp_mod_step_command(step: u8) -> u8 {
    CMD_AMP_MOD_BASE | (step & 0x1F)
}

/// Encoded frames for one pattern send.
///
/// The phase frame is always present. The amplitude frame is built only when
/// some element actually modulates below full scale; when every active
/// element is at full amplitude the firmware already defaults to full output
/// and the frame would be redundant.
pub struct PatternFrames {
    pub phases: Vec<u8>,
    pub amplitudes: Option<Vec<u8>>,
}

/// Encode a pattern into firmware frames.
///
/// `origin` is the global element index mapped to local slot 0 on this
/// board. Elements whose index falls outside this board's slot range are
/// silently dropped; in a multi-board topology they belong to a different
/// link. Slots no element addresses stay zero.
pub fn build_pattern_frames(elements: &[Element], origin: usize) -> PatternFrames {
    let mut phases = vec![0u8; ELEMENT_COUNT + 1];
    let mut amplitudes = vec![0u8; ELEMENT_COUNT + 1];
    phases[0] = CMD_START_PHASES;
    amplitudes[0] = CMD_START_AMPLITUDES;

    let mut modulation_needed = false;

    for element in elements {
        let slot = element.index as i64 - origin as i64;
        if slot < 0 || slot >= ELEMENT_COUNT as i64 {
            continue;
        }
        let slot = slot as usize;

        let mut phase = element.disc_phase(DIVISOR);
        let amplitude = element.disc_amplitude(DIVISOR);

        // Exact zero marks a silenced element; it gets the phase-off
        // sentinel and never forces an amplitude frame.
        if element.peak_amplitude == 0.0 {
            phase = PHASE_OFF as u32;
        } else if element.amplitude < AMP_MODULATION_THRESHOLD {
            modulation_needed = true;
        }

        phases[slot + 1] = (phase & 0xFF) as u8;
        amplitudes[slot + 1] = (amplitude & 0xFF) as u8;
    }

    PatternFrames {
        phases,
        amplitudes: modulation_needed.then_some(amplitudes),
    }
}
