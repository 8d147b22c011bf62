/// Logical state of one transducer element, as supplied by the pattern source.
///
/// `index` is the global element number across all boards; each board link
/// maps it to a local frame slot via its configured origin. `phase` is in
/// cycle units (1.0 = one full period), `amplitude` and `peak_amplitude`
/// are fractions of full scale. `peak_amplitude` of exactly zero means the
/// element is silenced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Element {
    pub index: usize,
    pub phase: f32,
    pub amplitude: f32,
    pub peak_amplitude: f32,
}

impl Element {
    /// Quantize the phase to `divs` discrete steps.
    ///
    /// The phase is wrapped into [0, 1) first, so negative phases and phases
    /// beyond one cycle land on the equivalent step.
    pub fn disc_phase(&self, divs: u32) -> u32 {
        let wrapped = self.phase.rem_euclid(1.0);
        ((wrapped * divs as f32) as u32).min(divs - 1)
    }

    /// Quantize the amplitude to `divs` discrete steps, clamped to full scale.
    pub fn disc_amplitude(&self, divs: u32) -> u32 {
        let clamped = self.amplitude.clamp(0.0, 1.0);
        ((clamped * divs as f32) as u32).min(divs - 1)
    }
}

/// Size of one element record on the TCP wire:
/// u16 index + f32 phase + f32 amplitude + f32 peak amplitude, big-endian.
pub const WIRE_RECORD_SIZE: usize = 14;

/// Decode element records from a set-pattern payload.
///
/// Trailing bytes that do not form a complete record are ignored.
pub fn decode_records(payload: &[u8]) -> Vec<Element> {
    payload
        .chunks_exact(WIRE_RECORD_SIZE)
        .map(|rec| Element {
            index: u16::from_be_bytes([rec[0], rec[1]]) as usize,
            phase: f32::from_be_bytes([rec[2], rec[3], rec[4], rec[5]]),
            amplitude: f32::from_be_bytes([rec[6], rec[7], rec[8], rec[9]]),
            peak_amplitude: f32::from_be_bytes([rec[10], rec[11], rec[12], rec[13]]),
        })
        .collect()
}
