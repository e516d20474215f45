/// Foreground input: discrete events from buttons/encoder mapped onto the core
use crate::sequencer::playback::{
    PlaybackScheduler, MAX_GATE_RATIO, MAX_TEMPO_BPM, MIN_GATE_RATIO, MIN_TEMPO_BPM,
};
use crate::sequencer::step::EnvelopeParam;
use crate::sequencer::{lock_steps, SharedSteps};
use log::debug;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// 1-based step button; `exclusive` replaces the selection.
    StepPressed { number: usize, exclusive: bool },
    EncoderDelta(i32),
    EncoderPressed,
}

/// What the encoder currently edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderTarget {
    #[default]
    Value,
    Velocity,
    Envelope(EnvelopeParam),
    Tempo,
    Transpose,
    GateRatio,
}

impl EncoderTarget {
    /// Order the encoder button walks through.
    pub fn next(self) -> Self {
        match self {
            EncoderTarget::Value => EncoderTarget::Velocity,
            EncoderTarget::Velocity => EncoderTarget::Envelope(EnvelopeParam::Attack),
            EncoderTarget::Envelope(EnvelopeParam::Attack) => EncoderTarget::Envelope(EnvelopeParam::Decay),
            EncoderTarget::Envelope(EnvelopeParam::Decay) => EncoderTarget::Envelope(EnvelopeParam::Sustain),
            EncoderTarget::Envelope(EnvelopeParam::Sustain) => EncoderTarget::Envelope(EnvelopeParam::Release),
            EncoderTarget::Envelope(EnvelopeParam::Release) => EncoderTarget::Tempo,
            EncoderTarget::Tempo => EncoderTarget::Transpose,
            EncoderTarget::Transpose => EncoderTarget::GateRatio,
            EncoderTarget::GateRatio => EncoderTarget::Value,
        }
    }
}

impl fmt::Display for EncoderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderTarget::Value => write!(f, "pitch"),
            EncoderTarget::Velocity => write!(f, "velocity"),
            EncoderTarget::Envelope(param) => write!(f, "{}", param),
            EncoderTarget::Tempo => write!(f, "tempo"),
            EncoderTarget::Transpose => write!(f, "transpose"),
            EncoderTarget::GateRatio => write!(f, "gate"),
        }
    }
}

#[derive(Debug, Default)]
pub struct InputRouter {
    target: EncoderTarget,
}

impl InputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(&self) -> EncoderTarget {
        self.target
    }

    pub fn set_target(&mut self, target: EncoderTarget) {
        self.target = target;
    }

    /// Apply one event. Returns whether anything changed.
    pub fn handle(
        &mut self,
        event: InputEvent,
        steps: &SharedSteps,
        scheduler: &PlaybackScheduler,
    ) -> bool {
        match event {
            InputEvent::StepPressed { number, exclusive } => {
                lock_steps(steps).select_step(number, exclusive)
            }
            InputEvent::EncoderPressed => {
                self.target = self.target.next();
                debug!("Encoder now edits {}", self.target);
                true
            }
            InputEvent::EncoderDelta(0) => false,
            InputEvent::EncoderDelta(delta) => self.apply_delta(delta, steps, scheduler),
        }
    }

    fn apply_delta(&self, delta: i32, steps: &SharedSteps, scheduler: &PlaybackScheduler) -> bool {
        match self.target {
            EncoderTarget::Value => lock_steps(steps).adjust_value(delta),
            EncoderTarget::Velocity => lock_steps(steps).adjust_velocity(delta),
            EncoderTarget::Envelope(param) => lock_steps(steps).adjust_envelope(param, delta),
            EncoderTarget::Tempo => {
                let bpm = (scheduler.tempo_bpm() + delta as f32).clamp(MIN_TEMPO_BPM, MAX_TEMPO_BPM);
                scheduler.set_tempo(bpm).is_ok()
            }
            EncoderTarget::Transpose => {
                let current = scheduler.transpose_semitones();
                scheduler.set_transpose_semitones(current.saturating_add(delta)) != current
            }
            EncoderTarget::GateRatio => {
                let ratio = (scheduler.gate_ratio() + 0.05 * delta as f32)
                    .clamp(MIN_GATE_RATIO, MAX_GATE_RATIO);
                scheduler.set_gate_ratio(ratio).is_ok()
            }
        }
    }
}
