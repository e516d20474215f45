/// Playback engine - coordinates timing and triggers
///
/// All scheduler state lives behind one mutex. The timer thread sleeps on a
/// condvar until the earliest armed deadline and fires ticks while holding
/// that same lock, so `start`/`pause`/`stop`/tempo and mode changes are
/// linearizable with tick firing: once `stop()` returns, no queued tick can
/// emit a note or re-arm a timer.
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::SequencerConfig;
use crate::error::{Result, SequencerError};
use crate::midi::{MidiTransport, NoteEmitter};
use crate::sequencer::ordering::{PlayMode, StepOrdering};
use crate::sequencer::{lock_steps, SharedSteps};

pub const MIN_TEMPO_BPM: f32 = 30.0;
pub const MAX_TEMPO_BPM: f32 = 300.0;
pub const DEFAULT_TEMPO_BPM: f32 = 120.0;
pub const MIN_GATE_RATIO: f32 = 0.1;
pub const MAX_GATE_RATIO: f32 = 1.0;
pub const DEFAULT_GATE_RATIO: f32 = 0.5;
pub const MAX_TRANSPOSE: i32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl TransportState {
    fn name(self) -> &'static str {
        match self {
            TransportState::Stopped => "stopped",
            TransportState::Running => "running",
            TransportState::Paused => "paused",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One quarter note per step.
pub fn step_interval(tempo_bpm: f32) -> Duration {
    Duration::from_secs_f64(60.0 / tempo_bpm.max(1.0) as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub number: usize,
    pub pitch: u8,
    pub frequency: f64,
    pub velocity: u8,
    pub selected: bool,
    pub muted: bool,
    pub solo: bool,
    pub audible: bool,
}

/// Read-only view polled by displays and LED strips.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequencerSnapshot {
    pub transport: TransportState,
    pub current_step: usize,
    pub tempo_bpm: f32,
    pub gate_ratio: f32,
    pub transpose: i32,
    pub play_mode: PlayMode,
    pub channel: u8,
    pub frequency_mode: bool,
    pub active_notes: Vec<u8>,
    pub steps: Vec<StepView>,
}

struct SchedulerState {
    transport: TransportState,
    current_step: usize,
    tempo_bpm: f32,
    original_tempo_bpm: f32,
    gate_ratio: f32,
    transpose: i32,
    channel: u8,
    ordering: StepOrdering,
    steps: SharedSteps,
    emitter: NoteEmitter,
    step_deadline: Option<Instant>,
    gate_deadline: Option<Instant>,
    shutdown: bool,
}

enum Due {
    Gate,
    Step(Instant),
}

impl SchedulerState {
    fn interval(&self) -> Duration {
        step_interval(self.tempo_bpm)
    }

    fn total_steps(&self) -> usize {
        lock_steps(&self.steps).total_steps()
    }

    fn disarm(&mut self) {
        self.step_deadline = None;
        self.gate_deadline = None;
    }

    fn rearm_step_timer(&mut self, now: Instant) {
        if self.transport == TransportState::Running {
            self.step_deadline = Some(now + self.interval());
        }
    }

    fn silence(&mut self) {
        if let Err(e) = self.emitter.all_notes_off(self.channel) {
            warn!("All-notes-off failed: {}", e);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.step_deadline, self.gate_deadline) {
            (Some(s), Some(g)) => Some(s.min(g)),
            (s, g) => s.or(g),
        }
    }

    fn due(&self, now: Instant) -> Option<Due> {
        let gate = self.gate_deadline.filter(|&g| g <= now);
        let step = self.step_deadline.filter(|&s| s <= now);
        match (gate, step) {
            (Some(g), Some(s)) if s < g => Some(Due::Step(s)),
            (Some(_), _) => Some(Due::Gate),
            (None, Some(s)) => Some(Due::Step(s)),
            (None, None) => None,
        }
    }

    fn fire_due(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(due) = self.due(now) {
            match due {
                Due::Gate => self.gate_tick(),
                Due::Step(at) => self.step_tick(at, now),
            }
            fired += 1;
        }
        fired
    }

    fn gate_tick(&mut self) {
        self.gate_deadline = None;
        if let Err(e) = self.emitter.release_active(self.channel) {
            warn!("Gate note-off failed: {}", e);
        }
    }

    fn step_tick(&mut self, at: Instant, now: Instant) {
        self.gate_deadline = None;
        if let Err(e) = self.emitter.release_active(self.channel) {
            warn!("Step note-off failed: {}", e);
        }

        let total = self.total_steps();
        if self.current_step >= total {
            warn!(
                "Step index {} out of range for {} steps, clamping",
                self.current_step, total
            );
            self.current_step = total.saturating_sub(1);
        }

        self.current_step = match self.ordering.next_index(self.current_step, total) {
            Some(next) if next < total => next,
            other => {
                warn!(
                    "{} ordering gave {:?} for {} steps, advancing sequentially",
                    self.ordering.mode(),
                    other,
                    total
                );
                (self.current_step + 1) % total.max(1)
            }
        };

        // the gate runs from the actual note-on, the step chain from the schedule
        self.sound_current(now.max(at));

        let mut next = at + self.interval();
        if next <= now {
            // fell behind by a whole interval: re-anchor instead of bursting
            next = now + self.interval();
        }
        self.step_deadline = Some(next);
    }

    fn sound_current(&mut self, sounded_at: Instant) {
        let number = self.current_step + 1;
        let note = {
            let steps = lock_steps(&self.steps);
            match steps.step(number) {
                Some(step) if steps.is_audible(number) => Some((step.pitch(), step.velocity())),
                _ => None,
            }
        };

        let Some((pitch, velocity)) = note else {
            debug!("Step {} silent", number);
            return;
        };
        let note = (pitch as i32 + self.transpose).clamp(0, 127) as u8;
        debug!("Step {} note {} vel {}", number, note, velocity);
        if let Err(e) = self.emitter.note_on(self.channel, note, velocity) {
            warn!("Note-on failed on step {}: {}", number, e);
        }
        if self.gate_ratio < MAX_GATE_RATIO {
            self.gate_deadline = Some(sounded_at + self.interval().mul_f32(self.gate_ratio));
        }
    }

    fn snapshot(&self) -> SequencerSnapshot {
        let steps = lock_steps(&self.steps);
        SequencerSnapshot {
            transport: self.transport,
            current_step: self.current_step,
            tempo_bpm: self.tempo_bpm,
            gate_ratio: self.gate_ratio,
            transpose: self.transpose,
            play_mode: self.ordering.mode(),
            channel: self.channel,
            frequency_mode: steps.frequency_mode(),
            active_notes: self.emitter.active_notes().iter().copied().collect(),
            steps: steps
                .steps()
                .iter()
                .map(|step| StepView {
                    number: step.number(),
                    pitch: step.pitch(),
                    frequency: step.frequency(),
                    velocity: step.velocity(),
                    selected: step.is_selected(),
                    muted: step.is_muted(),
                    solo: step.is_solo(),
                    audible: steps.is_audible(step.number()),
                })
                .collect(),
        }
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    timer_thread: Option<JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Scheduler driven by its own timer thread.
    pub fn spawn(steps: SharedSteps, transport: Box<dyn MidiTransport>) -> Result<Self> {
        let mut scheduler = Self::manual(steps, transport);
        let shared = Arc::clone(&scheduler.shared);
        let handle = thread::Builder::new()
            .name("step-timer".into())
            .spawn(move || run_timer(shared))?;
        scheduler.timer_thread = Some(handle);
        Ok(scheduler)
    }

    /// Scheduler without a timer thread; the caller fires timers with
    /// [`PlaybackScheduler::fire_due`].
    pub fn manual(steps: SharedSteps, transport: Box<dyn MidiTransport>) -> Self {
        let total = lock_steps(&steps).total_steps();
        let state = SchedulerState {
            transport: TransportState::Stopped,
            current_step: 0,
            tempo_bpm: DEFAULT_TEMPO_BPM,
            original_tempo_bpm: DEFAULT_TEMPO_BPM,
            gate_ratio: DEFAULT_GATE_RATIO,
            transpose: 0,
            channel: 0,
            ordering: StepOrdering::new(total),
            steps,
            emitter: NoteEmitter::new(transport),
            step_deadline: None,
            gate_deadline: None,
            shutdown: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wake: Condvar::new(),
            }),
            timer_thread: None,
        }
    }

    pub fn with_ordering(self, ordering: StepOrdering) -> Self {
        self.shared.lock().ordering = ordering;
        self
    }

    pub fn apply_config(&self, config: &SequencerConfig) -> Result<()> {
        config.validate()?;
        self.set_tempo(config.tempo_bpm)?;
        self.set_gate_ratio(config.gate_ratio)?;
        self.set_channel(config.midi_channel)?;
        self.set_transpose_semitones(config.transpose);
        Ok(())
    }

    fn update<R>(&self, f: impl FnOnce(&mut SchedulerState, Instant) -> R) -> R {
        let result = {
            let mut state = self.shared.lock();
            f(&mut state, Instant::now())
        };
        self.shared.wake.notify_all();
        result
    }

    // --- transport -------------------------------------------------------

    /// Start fresh from the first index of the current ordering, or resume
    /// a paused transport where it left off.
    pub fn start(&self) {
        self.update(|state, now| match state.transport {
            TransportState::Running => {}
            TransportState::Paused => {
                state.transport = TransportState::Running;
                state.rearm_step_timer(now);
                info!("Playback resumed at step {}", state.current_step + 1);
            }
            TransportState::Stopped => {
                let total = state.total_steps();
                state.current_step = state.ordering.first_index().min(total.saturating_sub(1));
                state.transport = TransportState::Running;
                state.sound_current(now);
                state.rearm_step_timer(now);
                info!(
                    "Playback started at {} BPM ({})",
                    state.tempo_bpm,
                    state.ordering.mode()
                );
            }
        })
    }

    pub fn pause(&self) -> Result<()> {
        self.update(|state, _| {
            if state.transport != TransportState::Running {
                return Err(SequencerError::InvalidTransition {
                    action: "pause",
                    state: state.transport.name(),
                });
            }
            state.disarm();
            state.silence();
            state.transport = TransportState::Paused;
            info!("Playback paused at step {}", state.current_step + 1);
            Ok(())
        })
    }

    /// Disarms both timers and sends all-notes-off before returning.
    pub fn stop(&self) -> Result<()> {
        self.update(|state, _| {
            if state.transport == TransportState::Stopped {
                return Err(SequencerError::InvalidTransition {
                    action: "stop",
                    state: state.transport.name(),
                });
            }
            state.disarm();
            state.silence();
            state.current_step = 0;
            state.transport = TransportState::Stopped;
            info!("Playback stopped");
            Ok(())
        })
    }

    // --- tempo / gate / transpose ------------------------------------------

    /// A running step timer restarts from now with the new interval.
    pub fn set_tempo(&self, bpm: f32) -> Result<()> {
        if !(MIN_TEMPO_BPM..=MAX_TEMPO_BPM).contains(&bpm) {
            return Err(SequencerError::out_of_range("tempo", bpm));
        }
        self.update(|state, now| {
            state.tempo_bpm = bpm;
            state.original_tempo_bpm = bpm;
            state.rearm_step_timer(now);
            debug!("Tempo set to {} BPM", bpm);
        });
        Ok(())
    }

    pub fn double_tempo(&self) -> f32 {
        self.update(|state, now| {
            state.tempo_bpm = (state.tempo_bpm * 2.0).min(MAX_TEMPO_BPM);
            state.rearm_step_timer(now);
            state.tempo_bpm
        })
    }

    pub fn halve_tempo(&self) -> f32 {
        self.update(|state, now| {
            state.tempo_bpm = (state.tempo_bpm / 2.0).max(MIN_TEMPO_BPM);
            state.rearm_step_timer(now);
            state.tempo_bpm
        })
    }

    /// Back to the tempo of the last successful `set_tempo`.
    pub fn reset_tempo(&self) -> f32 {
        self.update(|state, now| {
            state.tempo_bpm = state.original_tempo_bpm;
            state.rearm_step_timer(now);
            state.tempo_bpm
        })
    }

    /// Applies to gates armed after the call.
    pub fn set_gate_ratio(&self, ratio: f32) -> Result<()> {
        if !(MIN_GATE_RATIO..=MAX_GATE_RATIO).contains(&ratio) {
            return Err(SequencerError::out_of_range("gate ratio", ratio));
        }
        self.update(|state, _| state.gate_ratio = ratio);
        Ok(())
    }

    pub fn set_transpose_semitones(&self, semitones: i32) -> i32 {
        self.update(|state, _| {
            state.transpose = semitones.clamp(-MAX_TRANSPOSE, MAX_TRANSPOSE);
            state.transpose
        })
    }

    pub fn set_channel(&self, channel: u8) -> Result<()> {
        if channel > 15 {
            return Err(SequencerError::out_of_range("MIDI channel", channel));
        }
        self.update(|state, _| {
            if let Err(e) = state.emitter.release_active(state.channel) {
                warn!("Releasing notes before channel change failed: {}", e);
            }
            state.channel = channel;
        });
        Ok(())
    }

    // --- ordering / binding ----------------------------------------------

    pub fn set_play_mode(&self, mode: PlayMode) {
        self.update(|state, _| {
            let total = state.total_steps();
            state.ordering.set_mode(mode, total);
            debug!("Play mode {} order {:?}", mode, state.ordering.order());
        })
    }

    /// Point the scheduler at another controller. Playback keeps running; an
    /// out-of-range current index is clamped on the next tick.
    pub fn rebind(&self, steps: SharedSteps) {
        self.update(|state, _| {
            state.steps = steps;
            info!("Rebound to controller with {} steps", state.total_steps());
        })
    }

    pub fn replace_transport(&self, transport: Box<dyn MidiTransport>) {
        self.update(|state, _| {
            let channel = state.channel;
            state.emitter.replace_transport(transport, channel);
        })
    }

    /// Fire every armed timer due at `now`. Returns how many ticks ran.
    pub fn fire_due(&self, now: Instant) -> usize {
        self.update(|state, _| state.fire_due(now))
    }

    // --- queries -----------------------------------------------------------

    pub fn snapshot(&self) -> SequencerSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn transport_state(&self) -> TransportState {
        self.shared.lock().transport
    }

    pub fn is_running(&self) -> bool {
        self.transport_state() == TransportState::Running
    }

    pub fn current_step(&self) -> usize {
        self.shared.lock().current_step
    }

    pub fn tempo_bpm(&self) -> f32 {
        self.shared.lock().tempo_bpm
    }

    pub fn step_interval(&self) -> Duration {
        self.shared.lock().interval()
    }

    pub fn gate_ratio(&self) -> f32 {
        self.shared.lock().gate_ratio
    }

    pub fn transpose_semitones(&self) -> i32 {
        self.shared.lock().transpose
    }

    pub fn channel(&self) -> u8 {
        self.shared.lock().channel
    }

    pub fn play_mode(&self) -> PlayMode {
        self.shared.lock().ordering.mode()
    }

    pub fn step_order(&self) -> Vec<usize> {
        self.shared.lock().ordering.order().to_vec()
    }

    pub fn active_notes(&self) -> BTreeSet<u8> {
        self.shared.lock().emitter.active_notes().clone()
    }

    pub fn steps(&self) -> SharedSteps {
        Arc::clone(&self.shared.lock().steps)
    }

    pub fn step_deadline(&self) -> Option<Instant> {
        self.shared.lock().step_deadline
    }

    pub fn gate_deadline(&self) -> Option<Instant> {
        self.shared.lock().gate_deadline
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.update(|state, _| {
            if state.transport != TransportState::Stopped {
                state.disarm();
                state.silence();
                state.transport = TransportState::Stopped;
            }
            state.shutdown = true;
        });
        if let Some(handle) = self.timer_thread.take() {
            if handle.join().is_err() {
                warn!("Step timer thread panicked");
            }
        }
    }
}

fn run_timer(shared: Arc<Shared>) {
    debug!("Step timer thread running");
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }
        state.fire_due(Instant::now());
        state = match state.next_deadline() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match shared.wake.wait_timeout(state, timeout) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
            None => shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
        };
    }
    debug!("Step timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::StepController;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl Recorder {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl MidiTransport for Recorder {
        fn send(&mut self, message: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(message.to_vec());
            if self.fail {
                return Err(SequencerError::Transport("port gone".into()));
            }
            Ok(())
        }
    }

    fn scheduler(total: usize) -> (PlaybackScheduler, SharedSteps, Recorder) {
        let steps = StepController::shared(total);
        let rec = Recorder::default();
        let sched = PlaybackScheduler::manual(Arc::clone(&steps), Box::new(rec.clone()))
            .with_ordering(StepOrdering::with_seed(total, 42));
        (sched, steps, rec)
    }

    fn tick(sched: &PlaybackScheduler) -> Instant {
        let at = sched.step_deadline().expect("step timer armed");
        sched.fire_due(at);
        at
    }

    #[test]
    fn test_step_interval() {
        assert_eq!(step_interval(120.0), Duration::from_millis(500));
        assert_eq!(step_interval(60.0), Duration::from_secs(1));
    }

    #[test]
    fn test_start_emits_first_step_immediately() {
        let (sched, _steps, rec) = scheduler(4);
        sched.start();
        assert_eq!(sched.transport_state(), TransportState::Running);
        assert_eq!(sched.current_step(), 0);
        assert_eq!(rec.take(), vec![vec![0x90, 60, 100]]);
        assert!(sched.step_deadline().is_some());
    }

    #[test]
    fn test_sequential_visit_order() {
        let (sched, _steps, _rec) = scheduler(4);
        sched.start();
        let mut visited = vec![sched.current_step()];
        for _ in 0..4 {
            tick(&sched);
            visited.push(sched.current_step());
        }
        assert_eq!(visited, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_note_off_precedes_next_note_on() {
        let (sched, steps, rec) = scheduler(2);
        sched.set_gate_ratio(1.0).unwrap();
        lock_steps(&steps).set_step_pitch(2, 64);
        sched.start();
        assert!(sched.gate_deadline().is_none());
        rec.take();

        tick(&sched);
        assert_eq!(rec.take(), vec![vec![0x80, 60, 0], vec![0x90, 64, 100]]);
        assert_eq!(sched.active_notes().into_iter().collect::<Vec<_>>(), vec![64]);
    }

    #[test]
    fn test_gate_fires_at_half_interval() {
        let (sched, _steps, rec) = scheduler(4);
        sched.set_tempo(120.0).unwrap();
        sched.set_gate_ratio(0.5).unwrap();
        sched.start();
        rec.take();

        let t = tick(&sched);
        assert_eq!(sched.gate_deadline(), Some(t + Duration::from_millis(250)));
        assert_eq!(sched.step_deadline(), Some(t + Duration::from_millis(500)));

        // nothing is due just before the gate
        assert_eq!(sched.fire_due(t + Duration::from_millis(249)), 0);
        assert_eq!(sched.fire_due(t + Duration::from_millis(250)), 1);
        let sent = rec.take();
        assert_eq!(sent.last().unwrap(), &vec![0x80, 60, 0]);
        assert!(sched.active_notes().is_empty());
        assert_eq!(sched.current_step(), 1);
    }

    #[test]
    fn test_late_tick_still_gets_full_gate() {
        let (sched, _steps, rec) = scheduler(4);
        sched.set_tempo(120.0).unwrap();
        sched.set_gate_ratio(1.0).unwrap();
        sched.start();
        sched.set_gate_ratio(0.5).unwrap();
        rec.take();

        let due = sched.step_deadline().unwrap();
        let late = due + Duration::from_millis(300);
        assert_eq!(sched.fire_due(late), 1);
        assert_eq!(rec.take(), vec![vec![0x80, 60, 0], vec![0x90, 60, 100]]);
        assert_eq!(sched.active_notes().into_iter().collect::<Vec<_>>(), vec![60]);
        assert_eq!(sched.gate_deadline(), Some(late + Duration::from_millis(250)));
        // the step chain stays on schedule
        assert_eq!(sched.step_deadline(), Some(due + Duration::from_millis(500)));
    }

    #[test]
    fn test_failing_transport_keeps_playback_going() {
        let steps = StepController::shared(4);
        let rec = Recorder {
            fail: true,
            ..Default::default()
        };
        let sched = PlaybackScheduler::manual(Arc::clone(&steps), Box::new(rec.clone()));
        sched.set_gate_ratio(1.0).unwrap();
        sched.start();
        for _ in 0..5 {
            tick(&sched);
        }
        assert_eq!(sched.current_step(), 1);
        assert_eq!(sched.transport_state(), TransportState::Running);
        assert_eq!(sched.active_notes().into_iter().collect::<Vec<_>>(), vec![60]);
        assert!(!rec.take().is_empty());

        sched.stop().unwrap();
        assert!(sched.active_notes().is_empty());
        assert_eq!(sched.transport_state(), TransportState::Stopped);
        assert_eq!(rec.take().last().unwrap(), &vec![0xB0, 123, 0]);
    }

    #[test]
    fn test_muted_step_emits_nothing() {
        let (sched, steps, rec) = scheduler(4);
        lock_steps(&steps).mute(2);
        sched.start();
        rec.take();
        tick(&sched);
        // only the gate's note-off for step 1 went out
        assert_eq!(rec.take(), vec![vec![0x80, 60, 0]]);
        assert!(sched.active_notes().is_empty());
        assert!(sched.gate_deadline().is_none());
        assert_eq!(sched.current_step(), 1);
    }

    #[test]
    fn test_transpose_applies_only_to_emission() {
        let (sched, steps, rec) = scheduler(2);
        lock_steps(&steps).set_step_pitch(1, 120);
        assert_eq!(sched.set_transpose_semitones(30), 24);
        sched.start();
        assert_eq!(rec.take(), vec![vec![0x90, 127, 100]]);
        assert_eq!(lock_steps(&steps).step(1).unwrap().pitch(), 120);
        assert_eq!(sched.set_transpose_semitones(-99), -24);
    }

    #[test]
    fn test_pause_and_resume_keep_position() {
        let (sched, _steps, rec) = scheduler(4);
        sched.start();
        tick(&sched);
        tick(&sched);
        sched.pause().unwrap();
        assert_eq!(sched.transport_state(), TransportState::Paused);
        assert!(sched.step_deadline().is_none());
        assert!(sched.active_notes().is_empty());
        assert_eq!(rec.take().last().unwrap(), &vec![0xB0, 123, 0]);

        sched.start();
        assert_eq!(sched.current_step(), 2);
        assert!(rec.take().is_empty());
        tick(&sched);
        assert_eq!(sched.current_step(), 3);
    }

    #[test]
    fn test_invalid_transitions() {
        let (sched, _steps, _rec) = scheduler(4);
        assert!(matches!(sched.pause(), Err(SequencerError::InvalidTransition { .. })));
        assert!(sched.stop().is_err());
        sched.start();
        sched.pause().unwrap();
        assert!(sched.pause().is_err());
        sched.stop().unwrap();
    }

    #[test]
    fn test_stop_silences_and_resets() {
        let (sched, _steps, rec) = scheduler(4);
        sched.start();
        tick(&sched);
        assert!(!sched.active_notes().is_empty());
        rec.take();

        sched.stop().unwrap();
        assert!(sched.active_notes().is_empty());
        assert_eq!(rec.take(), vec![vec![0x80, 60, 0], vec![0xB0, 123, 0]]);
        assert_eq!(sched.current_step(), 0);
        assert!(sched.step_deadline().is_none() && sched.gate_deadline().is_none());

        // a tick that was due before stop() now does nothing
        assert_eq!(sched.fire_due(Instant::now() + Duration::from_secs(10)), 0);
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_tempo_validation_and_saturation() {
        let (sched, _steps, _rec) = scheduler(4);
        assert!(sched.set_tempo(29.0).is_err());
        assert!(sched.set_tempo(301.0).is_err());
        assert!(sched.set_tempo(f32::NAN).is_err());
        assert_eq!(sched.tempo_bpm(), DEFAULT_TEMPO_BPM);

        sched.set_tempo(200.0).unwrap();
        assert_eq!(sched.double_tempo(), 300.0);
        sched.set_tempo(40.0).unwrap();
        assert_eq!(sched.halve_tempo(), 30.0);
        assert_eq!(sched.reset_tempo(), 40.0);
    }

    #[test]
    fn test_halving_odd_tempo_is_exact() {
        let (sched, _steps, _rec) = scheduler(4);
        sched.set_tempo(75.0).unwrap();
        assert_eq!(sched.halve_tempo(), 37.5);
        assert_eq!(sched.double_tempo(), 75.0);
        assert_eq!(sched.step_interval().as_millis(), 800);
    }

    #[test]
    fn test_set_tempo_rearms_running_timer() {
        let (sched, _steps, _rec) = scheduler(4);
        sched.start();
        let before = Instant::now();
        sched.set_tempo(60.0).unwrap();
        let deadline = sched.step_deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(1));
    }

    #[test]
    fn test_armed_gate_keeps_its_interval_after_tempo_change() {
        let (sched, _steps, _rec) = scheduler(4);
        sched.set_tempo(120.0).unwrap();
        sched.start();
        let t = tick(&sched);
        sched.set_tempo(60.0).unwrap();
        assert_eq!(sched.gate_deadline(), Some(t + Duration::from_millis(250)));
    }

    #[test]
    fn test_gate_ratio_validation() {
        let (sched, _steps, _rec) = scheduler(4);
        assert!(sched.set_gate_ratio(0.05).is_err());
        assert!(sched.set_gate_ratio(1.5).is_err());
        assert!(sched.set_gate_ratio(f32::NAN).is_err());
        assert_eq!(sched.gate_ratio(), DEFAULT_GATE_RATIO);
        sched.set_gate_ratio(0.1).unwrap();
        assert_eq!(sched.gate_ratio(), 0.1);
    }

    #[test]
    fn test_shuffled_start_uses_permutation_head() {
        let (sched, _steps, _rec) = scheduler(4);
        sched.set_play_mode(PlayMode::Shuffled);
        let order = sched.step_order();
        sched.start();
        let mut visited = vec![sched.current_step()];
        for _ in 0..3 {
            tick(&sched);
            visited.push(sched.current_step());
        }
        assert_eq!(visited, order);
        let mut sorted = visited.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rebind_to_shorter_controller_clamps() {
        let (sched, _steps, _rec) = scheduler(8);
        sched.start();
        for _ in 0..6 {
            tick(&sched);
        }
        assert_eq!(sched.current_step(), 6);

        sched.rebind(StepController::shared(4));
        assert!(sched.is_running());
        tick(&sched);
        // clamped to 3, then advanced sequentially
        assert_eq!(sched.current_step(), 0);
    }

    #[test]
    fn test_rebind_while_shuffled_never_leaves_range() {
        let (sched, _steps, _rec) = scheduler(8);
        sched.set_play_mode(PlayMode::Shuffled);
        sched.start();
        sched.rebind(StepController::shared(3));
        for _ in 0..20 {
            tick(&sched);
            assert!(sched.current_step() < 3);
        }
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let (sched, steps, _rec) = scheduler(4);
        {
            let mut c = lock_steps(&steps);
            c.select_step(2, false);
            c.mute(3);
        }
        sched.set_play_mode(PlayMode::FullyRandom);
        sched.start();
        let snap = sched.snapshot();
        assert_eq!(snap.transport, TransportState::Running);
        assert_eq!(snap.play_mode, PlayMode::FullyRandom);
        assert_eq!(snap.steps.len(), 4);
        assert!(snap.steps[1].selected);
        assert!(snap.steps[2].muted && !snap.steps[2].audible);
        assert_eq!(snap.active_notes, vec![60]);
    }

    #[test]
    fn test_channel_is_used_for_emission() {
        let (sched, _steps, rec) = scheduler(4);
        assert!(sched.set_channel(16).is_err());
        sched.set_channel(9).unwrap();
        sched.start();
        assert_eq!(rec.take(), vec![vec![0x99, 60, 100]]);
    }
}
