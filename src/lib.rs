/// STEPSEQ - timing and playback core of a hardware step sequencer
///
/// This library provides:
/// - Step data with pitch/frequency, velocity and envelope kept in range
/// - A step controller for selection, mute/solo and bulk edits
/// - Sequential, shuffled and fully random step ordering
/// - A timer-driven playback scheduler emitting MIDI notes
/// - Pattern documents for persistence

pub mod config;
pub mod error;
pub mod input;
pub mod midi;
pub mod sequencer;

// Re-export commonly used types
pub use config::SequencerConfig;
pub use error::{Result, SequencerError};
pub use input::{EncoderTarget, InputEvent, InputRouter};
pub use midi::{midi_note_name, LogTransport, MidiOutputDevice, MidiTransport, NoteEmitter};
pub use sequencer::ordering::{PlayMode, StepOrdering};
pub use sequencer::pattern::{ImportReport, PatternDocument, StepRecord};
pub use sequencer::playback::{PlaybackScheduler, SequencerSnapshot, TransportState};
pub use sequencer::step::{Envelope, EnvelopeParam, Step};
pub use sequencer::{lock_steps, SharedSteps, StepController};
