/// A single sequencer slot: pitch, velocity, envelope and its flags
use crate::error::{Result, SequencerError};
use std::fmt;
use std::str::FromStr;

pub const MIN_FREQUENCY_HZ: f64 = 1.0;
pub const DEFAULT_PITCH: u8 = 60; // Middle C
pub const DEFAULT_VELOCITY: u8 = 100;

/// Equal-tempered frequency of a MIDI note (A4 = 440 Hz).
pub fn midi_to_frequency(note: u8) -> f64 {
    440.0 * 2.0_f64.powf((note as f64 - 69.0) / 12.0)
}

/// Nearest MIDI note for a frequency, rounding halves away from zero
/// (`f64::round`) and clamping to 0..=127.
pub fn frequency_to_midi(hz: f64) -> u8 {
    if hz == f64::INFINITY {
        return 127;
    }
    if !hz.is_finite() || hz <= 0.0 {
        return 0;
    }
    let note = 69.0 + 12.0 * (hz / 440.0).log2();
    note.round().clamp(0.0, 127.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeParam {
    Attack,
    Decay,
    Sustain,
    Release,
}

impl EnvelopeParam {
    pub const ALL: [EnvelopeParam; 4] = [
        EnvelopeParam::Attack,
        EnvelopeParam::Decay,
        EnvelopeParam::Sustain,
        EnvelopeParam::Release,
    ];

    /// Inclusive bounds (ms for times, percent for sustain).
    pub fn bounds(self) -> (u16, u16) {
        match self {
            EnvelopeParam::Attack => (1, 1000),
            EnvelopeParam::Decay => (1, 2000),
            EnvelopeParam::Sustain => (0, 100),
            EnvelopeParam::Release => (1, 3000),
        }
    }

    /// Multiplier applied to encoder deltas.
    pub fn scale(self) -> i64 {
        match self {
            EnvelopeParam::Attack => 5,
            EnvelopeParam::Decay => 10,
            EnvelopeParam::Sustain => 1,
            EnvelopeParam::Release => 10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EnvelopeParam::Attack => "attack",
            EnvelopeParam::Decay => "decay",
            EnvelopeParam::Sustain => "sustain",
            EnvelopeParam::Release => "release",
        }
    }

    fn clamp(self, value: i64) -> u16 {
        let (lo, hi) = self.bounds();
        value.clamp(lo as i64, hi as i64) as u16
    }
}

impl fmt::Display for EnvelopeParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EnvelopeParam {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attack" => Ok(EnvelopeParam::Attack),
            "decay" => Ok(EnvelopeParam::Decay),
            "sustain" => Ok(EnvelopeParam::Sustain),
            "release" => Ok(EnvelopeParam::Release),
            _ => Err(SequencerError::UnknownParameter(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    attack: u16,
    decay: u16,
    sustain: u16,
    release: u16,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            attack: 10,
            decay: 100,
            sustain: 70,
            release: 200,
        }
    }
}

impl Envelope {
    pub fn get(&self, param: EnvelopeParam) -> u16 {
        match param {
            EnvelopeParam::Attack => self.attack,
            EnvelopeParam::Decay => self.decay,
            EnvelopeParam::Sustain => self.sustain,
            EnvelopeParam::Release => self.release,
        }
    }

    /// Stores `value` clamped to the parameter's bounds and returns what was stored.
    pub fn set(&mut self, param: EnvelopeParam, value: i64) -> u16 {
        let value = param.clamp(value);
        match param {
            EnvelopeParam::Attack => self.attack = value,
            EnvelopeParam::Decay => self.decay = value,
            EnvelopeParam::Sustain => self.sustain = value,
            EnvelopeParam::Release => self.release = value,
        }
        value
    }

    pub fn attack(&self) -> u16 {
        self.attack
    }

    pub fn decay(&self) -> u16 {
        self.decay
    }

    pub fn sustain(&self) -> u16 {
        self.sustain
    }

    pub fn release(&self) -> u16 {
        self.release
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    number: usize,
    pitch: u8,
    frequency: f64,
    velocity: u8,
    envelope: Envelope,
    selected: bool,
    muted: bool,
    solo: bool,
}

impl Step {
    /// `number` is the 1-based position of the step in its controller.
    pub fn new(number: usize) -> Self {
        Self {
            number,
            pitch: DEFAULT_PITCH,
            frequency: midi_to_frequency(DEFAULT_PITCH),
            velocity: DEFAULT_VELOCITY,
            envelope: Envelope::default(),
            selected: false,
            muted: false,
            solo: false,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn pitch(&self) -> u8 {
        self.pitch
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_solo(&self) -> bool {
        self.solo
    }

    pub fn set_pitch(&mut self, midi: i64) {
        self.pitch = midi.clamp(0, 127) as u8;
        self.frequency = midi_to_frequency(self.pitch);
    }

    /// Non-finite values are rejected and leave the step unchanged.
    pub fn set_frequency(&mut self, hz: f64) -> bool {
        if !hz.is_finite() {
            return false;
        }
        self.frequency = hz.max(MIN_FREQUENCY_HZ);
        self.pitch = frequency_to_midi(self.frequency);
        true
    }

    pub fn set_velocity(&mut self, velocity: i64) {
        self.velocity = velocity.clamp(0, 127) as u8;
    }

    pub fn set_envelope(&mut self, param: EnvelopeParam, value: i64) -> u16 {
        self.envelope.set(param, value)
    }

    /// Name-based variant used by pattern/config code; unknown names are rejected.
    pub fn set_envelope_by_name(&mut self, param: &str, value: i64) -> Result<u16> {
        let param: EnvelopeParam = param.parse()?;
        Ok(self.set_envelope(param, value))
    }

    // Flags are owned by the controller, which keeps its sets in step with them.
    pub(crate) fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }

    pub(crate) fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub(crate) fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }
}
