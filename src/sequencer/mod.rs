/// Core sequencer state - the steps and everything the foreground edits
/// This is length-agnostic: a controller owns a fixed number of steps for its lifetime
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

pub mod ordering;
pub mod pattern;
pub mod playback;
pub mod step;

use pattern::{EnvelopeRecord, ImportReport, PatternDocument, RejectedRecord, StepRecord};
use step::{EnvelopeParam, Step};

/// C major from C4 upward, one note per step.
pub const C_MAJOR_SCALE: [u8; 16] = [60, 62, 64, 65, 67, 69, 71, 72, 74, 76, 77, 79, 81, 83, 84, 86];

/// Handle shared between the foreground and the playback scheduler.
pub type SharedSteps = Arc<Mutex<StepController>>;

/// Lock a shared controller, recovering the data if a previous holder panicked.
pub fn lock_steps(steps: &SharedSteps) -> MutexGuard<'_, StepController> {
    steps.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct StepController {
    steps: Vec<Step>,
    selected: BTreeSet<usize>,
    muted: BTreeSet<usize>,
    solo: BTreeSet<usize>,
    frequency_mode: bool,
}

impl StepController {
    /// A controller always has at least one step.
    pub fn new(total_steps: usize) -> Self {
        let total_steps = total_steps.max(1);
        Self {
            steps: (1..=total_steps).map(Step::new).collect(),
            selected: BTreeSet::new(),
            muted: BTreeSet::new(),
            solo: BTreeSet::new(),
            frequency_mode: false,
        }
    }

    pub fn shared(total_steps: usize) -> SharedSteps {
        Arc::new(Mutex::new(Self::new(total_steps)))
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Step by 1-based number.
    pub fn step(&self, number: usize) -> Option<&Step> {
        number.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    fn step_mut(&mut self, number: usize) -> Option<&mut Step> {
        number.checked_sub(1).and_then(move |i| self.steps.get_mut(i))
    }

    fn in_range(&self, number: usize) -> bool {
        number >= 1 && number <= self.steps.len()
    }

    pub fn frequency_mode(&self) -> bool {
        self.frequency_mode
    }

    pub fn set_frequency_mode(&mut self, enabled: bool) {
        self.frequency_mode = enabled;
    }

    // --- selection -------------------------------------------------------

    pub fn selected(&self) -> &BTreeSet<usize> {
        &self.selected
    }

    pub fn is_selected(&self, number: usize) -> bool {
        self.selected.contains(&number)
    }

    /// Toggle `number`. With `exclusive`, a step that was not yet selected
    /// becomes the only selection. Returns false for unknown steps.
    pub fn select_step(&mut self, number: usize, exclusive: bool) -> bool {
        if !self.in_range(number) {
            return false;
        }
        let was_selected = self.selected.contains(&number);
        if exclusive && !was_selected {
            self.clear_selection();
        }
        self.set_selected(number, !was_selected);
        true
    }

    fn set_selected(&mut self, number: usize, selected: bool) {
        if let Some(step) = self.step_mut(number) {
            step.set_selected(selected);
        }
        if selected {
            self.selected.insert(number);
        } else {
            self.selected.remove(&number);
        }
    }

    /// Selects every step, or clears the selection if everything already is.
    pub fn select_all(&mut self) {
        self.toggle_select_all();
    }

    pub fn toggle_select_all(&mut self) {
        if self.selected.len() == self.steps.len() {
            self.clear_selection();
        } else {
            for number in 1..=self.steps.len() {
                self.set_selected(number, true);
            }
        }
    }

    pub fn clear_selection(&mut self) {
        for number in std::mem::take(&mut self.selected) {
            if let Some(step) = self.step_mut(number) {
                step.set_selected(false);
            }
        }
    }

    // --- mute / solo -----------------------------------------------------

    pub fn muted(&self) -> &BTreeSet<usize> {
        &self.muted
    }

    pub fn soloed(&self) -> &BTreeSet<usize> {
        &self.solo
    }

    fn set_muted(&mut self, number: usize, muted: bool) -> bool {
        let Some(step) = self.step_mut(number) else {
            return false;
        };
        step.set_muted(muted);
        if muted {
            self.muted.insert(number);
        } else {
            self.muted.remove(&number);
        }
        true
    }

    fn set_solo(&mut self, number: usize, solo: bool) -> bool {
        let Some(step) = self.step_mut(number) else {
            return false;
        };
        step.set_solo(solo);
        if solo {
            self.solo.insert(number);
        } else {
            self.solo.remove(&number);
        }
        true
    }

    pub fn mute(&mut self, number: usize) -> bool {
        self.set_muted(number, true)
    }

    pub fn unmute(&mut self, number: usize) -> bool {
        self.set_muted(number, false)
    }

    pub fn mute_all(&mut self) {
        for number in 1..=self.steps.len() {
            self.set_muted(number, true);
        }
    }

    pub fn unmute_all(&mut self) {
        for number in 1..=self.steps.len() {
            self.set_muted(number, false);
        }
    }

    pub fn solo(&mut self, number: usize) -> bool {
        self.set_solo(number, true)
    }

    pub fn unsolo(&mut self, number: usize) -> bool {
        self.set_solo(number, false)
    }

    pub fn solo_all(&mut self) {
        for number in 1..=self.steps.len() {
            self.set_solo(number, true);
        }
    }

    pub fn clear_solo(&mut self) {
        for number in 1..=self.steps.len() {
            self.set_solo(number, false);
        }
    }

    fn selected_numbers(&self) -> Vec<usize> {
        self.selected.iter().copied().collect()
    }

    /// Mute every selected step. False when nothing is selected.
    pub fn mute_selected(&mut self) -> bool {
        let numbers = self.selected_numbers();
        for &number in &numbers {
            self.set_muted(number, true);
        }
        !numbers.is_empty()
    }

    pub fn unmute_selected(&mut self) -> bool {
        let numbers = self.selected_numbers();
        for &number in &numbers {
            self.set_muted(number, false);
        }
        !numbers.is_empty()
    }

    pub fn solo_selected(&mut self) -> bool {
        let numbers = self.selected_numbers();
        for &number in &numbers {
            self.set_solo(number, true);
        }
        !numbers.is_empty()
    }

    pub fn unsolo_selected(&mut self) -> bool {
        let numbers = self.selected_numbers();
        for &number in &numbers {
            self.set_solo(number, false);
        }
        !numbers.is_empty()
    }

    /// Toggle mute on every selected step. False when nothing is selected.
    pub fn toggle_mute_selected(&mut self) -> bool {
        let numbers = self.selected_numbers();
        for &number in &numbers {
            let muted = self.muted.contains(&number);
            self.set_muted(number, !muted);
        }
        !numbers.is_empty()
    }

    pub fn toggle_solo_selected(&mut self) -> bool {
        let numbers = self.selected_numbers();
        for &number in &numbers {
            let solo = self.solo.contains(&number);
            self.set_solo(number, !solo);
        }
        !numbers.is_empty()
    }

    /// Solo overrides mute: with any step soloed, only soloed steps sound.
    pub fn is_audible(&self, number: usize) -> bool {
        if !self.in_range(number) {
            return false;
        }
        if self.solo.is_empty() {
            !self.muted.contains(&number)
        } else {
            self.solo.contains(&number)
        }
    }

    // --- edits -----------------------------------------------------------

    fn for_each_selected(&mut self, mut edit: impl FnMut(&mut Step)) -> bool {
        if self.selected.is_empty() {
            return false;
        }
        for &number in &self.selected {
            if let Some(step) = number.checked_sub(1).and_then(|i| self.steps.get_mut(i)) {
                edit(step);
            }
        }
        true
    }

    /// Encoder edit of the selected steps' pitch (or frequency, ±1 Hz per call).
    pub fn adjust_value(&mut self, delta: i32) -> bool {
        if self.frequency_mode {
            let hz = delta.signum() as f64;
            self.for_each_selected(|step| {
                step.set_frequency(step.frequency() + hz);
            })
        } else {
            self.for_each_selected(|step| step.set_pitch(step.pitch() as i64 + delta as i64))
        }
    }

    pub fn adjust_velocity(&mut self, delta: i32) -> bool {
        let delta = delta as i64 * 5;
        self.for_each_selected(|step| step.set_velocity(step.velocity() as i64 + delta))
    }

    pub fn adjust_envelope(&mut self, param: EnvelopeParam, delta: i32) -> bool {
        let delta = delta as i64 * param.scale();
        self.for_each_selected(|step| {
            let current = step.envelope().get(param) as i64;
            step.set_envelope(param, current.saturating_add(delta));
        })
    }

    /// Absolute velocity for every selected step. Values outside 0..=127
    /// are rejected without touching anything.
    pub fn set_selected_velocity(&mut self, velocity: i64) -> bool {
        if !(0..=127).contains(&velocity) {
            debug!("Rejected velocity {}", velocity);
            return false;
        }
        self.for_each_selected(|step| step.set_velocity(velocity))
    }

    /// Absolute envelope value for every selected step, rejected when
    /// outside the parameter's bounds.
    pub fn set_selected_envelope(&mut self, param: EnvelopeParam, value: i64) -> bool {
        let (lo, hi) = param.bounds();
        if value < lo as i64 || value > hi as i64 {
            debug!("Rejected {} {}", param, value);
            return false;
        }
        self.for_each_selected(|step| {
            step.set_envelope(param, value);
        })
    }

    /// Lay [`C_MAJOR_SCALE`] over the first steps. Steps past the end of the
    /// scale keep their pitch.
    pub fn set_c_major_scale(&mut self) {
        for (step, &note) in self.steps.iter_mut().zip(C_MAJOR_SCALE.iter()) {
            step.set_pitch(note as i64);
        }
        debug!("C major scale applied");
    }

    /// Permanently shift every step's pitch.
    pub fn transpose_all(&mut self, semitones: i32) {
        for step in &mut self.steps {
            step.set_pitch(step.pitch() as i64 + semitones as i64);
        }
        debug!("Transposed {} steps by {}", self.steps.len(), semitones);
    }

    pub fn set_step_pitch(&mut self, number: usize, midi: i64) -> bool {
        self.step_mut(number).map(|s| s.set_pitch(midi)).is_some()
    }

    pub fn set_step_frequency(&mut self, number: usize, hz: f64) -> bool {
        self.step_mut(number).is_some_and(|s| s.set_frequency(hz))
    }

    pub fn set_step_velocity(&mut self, number: usize, velocity: i64) -> bool {
        self.step_mut(number).map(|s| s.set_velocity(velocity)).is_some()
    }

    pub fn set_step_envelope(&mut self, number: usize, param: EnvelopeParam, value: i64) -> bool {
        self.step_mut(number)
            .map(|s| s.set_envelope(param, value))
            .is_some()
    }

    // --- persistence -----------------------------------------------------

    /// Snapshot every step. The pitch is written as `frequency` in frequency
    /// mode and as `midiNote` otherwise.
    pub fn export_pattern(&self) -> PatternDocument {
        let steps = self
            .steps
            .iter()
            .map(|step| {
                let envelope = step.envelope();
                StepRecord {
                    step: step.number() as i64,
                    frequency: self.frequency_mode.then(|| step.frequency()),
                    midi_note: (!self.frequency_mode).then(|| step.pitch() as i64),
                    velocity: Some(step.velocity() as i64),
                    envelope: Some(EnvelopeRecord {
                        attack: Some(envelope.attack() as i64),
                        decay: Some(envelope.decay() as i64),
                        sustain: Some(envelope.sustain() as i64),
                        release: Some(envelope.release() as i64),
                    }),
                }
            })
            .collect();
        PatternDocument { steps }
    }

    /// Apply the fields present in each record. Records for unknown step
    /// numbers are rejected individually; the rest still apply.
    pub fn import_pattern(&mut self, document: &PatternDocument) -> ImportReport {
        let mut report = ImportReport::default();
        let total = self.steps.len() as i64;

        for (index, record) in document.steps.iter().enumerate() {
            if record.step < 1 || record.step > total {
                report.rejected.push(RejectedRecord {
                    index,
                    reason: format!("step {} outside 1..={}", record.step, total),
                });
                continue;
            }
            let Some(step) = self.step_mut(record.step as usize) else {
                continue;
            };

            if let Some(note) = record.midi_note {
                step.set_pitch(note);
            } else if let Some(hz) = record.frequency {
                step.set_frequency(hz);
            }
            if let Some(velocity) = record.velocity {
                step.set_velocity(velocity);
            }
            if let Some(envelope) = &record.envelope {
                for param in EnvelopeParam::ALL {
                    if let Some(value) = envelope.get(param) {
                        step.set_envelope(param, value);
                    }
                }
            }
            report.applied += 1;
        }
        report
    }
}
