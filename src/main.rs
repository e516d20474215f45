#[cfg(feature = "gui")]
use eframe::egui;
#[cfg(feature = "gui")]
use stepseq::sequencer::playback::{MAX_TEMPO_BPM, MIN_TEMPO_BPM};

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stepseq::sequencer::pattern;
use stepseq::{
    lock_steps, LogTransport, MidiOutputDevice, MidiTransport, PlayMode, PlaybackScheduler,
    SequencerConfig, SharedSteps, StepController,
};

#[derive(Parser)]
#[command(name = "stepseq")]
#[command(about = "Step sequencer playback core")]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of steps in the pattern
    #[arg(long)]
    steps: Option<usize>,

    /// Tempo in BPM (30-300)
    #[arg(long)]
    bpm: Option<f32>,

    /// Gate ratio (0.1-1.0)
    #[arg(long)]
    gate: Option<f32>,

    /// MIDI channel (0-15)
    #[arg(long)]
    channel: Option<u8>,

    /// Connect to the first MIDI output whose name contains this text
    #[arg(long)]
    port: Option<String>,

    /// List MIDI output ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Pattern file to load at startup
    #[arg(long)]
    pattern: Option<PathBuf>,

    /// Play mode: sequential, shuffled or random
    #[arg(long, default_value = "sequential")]
    mode: PlayMode,

    /// Run without a window
    #[arg(long)]
    headless: bool,

    /// Seconds to play in headless mode
    #[arg(long, default_value_t = 8)]
    duration: u64,
}

impl Cli {
    fn resolve_config(&self) -> stepseq::Result<SequencerConfig> {
        let mut config = match &self.config {
            Some(path) => SequencerConfig::load(path)?,
            None => SequencerConfig::default(),
        };
        if let Some(steps) = self.steps {
            config.total_steps = steps;
        }
        if let Some(bpm) = self.bpm {
            config.tempo_bpm = bpm;
        }
        if let Some(gate) = self.gate {
            config.gate_ratio = gate;
        }
        if let Some(channel) = self.channel {
            config.midi_channel = channel;
        }
        if let Some(port) = &self.port {
            config.midi_port = Some(port.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

fn open_transport(config: &SequencerConfig, headless: bool) -> Box<dyn MidiTransport> {
    if let Some(name) = &config.midi_port {
        let mut device = MidiOutputDevice::new();
        match device.connect_by_name(name) {
            Ok(()) => return Box::new(device),
            Err(e) => warn!("{}; falling back", e),
        }
    }
    if headless {
        Box::new(LogTransport::new())
    } else {
        Box::new(MidiOutputDevice::new())
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        for (i, name) in MidiOutputDevice::available_ports().iter().enumerate() {
            println!("{}: {}", i, name);
        }
        return;
    }

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let steps = StepController::shared(config.total_steps);
    if let Some(path) = &cli.pattern {
        match pattern::load_pattern(path, &mut lock_steps(&steps)) {
            Ok(report) if !report.is_clean() => {
                warn!("{} pattern records rejected", report.rejected.len())
            }
            Ok(_) => {}
            Err(e) => error!("Could not load {}: {}", path.display(), e),
        }
    }

    let headless = cli.headless || !cfg!(feature = "gui");
    let transport = open_transport(&config, headless);
    let scheduler = match PlaybackScheduler::spawn(Arc::clone(&steps), transport) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Could not start step timer: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = scheduler.apply_config(&config) {
        error!("{}", e);
        std::process::exit(1);
    }
    scheduler.set_play_mode(cli.mode);

    info!("═══════════════════════════════════════");
    info!("  STEPSEQ v{}", env!("CARGO_PKG_VERSION"));
    info!("  Steps: {}  Tempo: {} BPM  Mode: {}", config.total_steps, config.tempo_bpm, cli.mode);
    info!("═══════════════════════════════════════");

    if headless {
        run_headless(&scheduler, Duration::from_secs(cli.duration));
        return;
    }

    #[cfg(feature = "gui")]
    if let Err(e) = run_gui(scheduler, steps) {
        error!("GUI error: {}", e);
        std::process::exit(1);
    }
}

fn run_headless(scheduler: &PlaybackScheduler, duration: Duration) {
    scheduler.start();
    thread::sleep(duration);
    if let Err(e) = scheduler.stop() {
        warn!("{}", e);
    }
    let snapshot = scheduler.snapshot();
    info!("Finished at step {} ({})", snapshot.current_step + 1, snapshot.transport);
}

#[cfg(feature = "gui")]
fn run_gui(scheduler: PlaybackScheduler, steps: SharedSteps) -> Result<(), eframe::Error> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 520.0])
            .with_title("STEPSEQ - Step Sequencer"),
        ..Default::default()
    };

    eframe::run_native(
        "STEPSEQ",
        options,
        Box::new(|_cc| Ok(Box::new(SequencerApp::new(scheduler, steps)))),
    )
}

#[cfg(feature = "gui")]
struct SequencerApp {
    scheduler: PlaybackScheduler,
    steps: SharedSteps,
    router: stepseq::InputRouter,

    // UI state
    available_midi_ports: Vec<String>,
    selected_port: Option<usize>,
    pattern_path: String,
    status: String,
}

#[cfg(feature = "gui")]
impl SequencerApp {
    fn new(scheduler: PlaybackScheduler, steps: SharedSteps) -> Self {
        Self {
            scheduler,
            steps,
            router: stepseq::InputRouter::new(),
            available_midi_ports: MidiOutputDevice::available_ports(),
            selected_port: None,
            pattern_path: "pattern.json".into(),
            status: String::new(),
        }
    }

    fn send(&mut self, event: stepseq::InputEvent) {
        if !self.router.handle(event, &self.steps, &self.scheduler) {
            self.status = "Nothing changed (is a step selected?)".into();
        } else {
            self.status.clear();
        }
    }

    fn save_pattern(&mut self) {
        let document = lock_steps(&self.steps).export_pattern();
        self.status = match pattern::save_pattern_file(self.pattern_path.as_ref(), &document) {
            Ok(()) => format!("Saved {}", self.pattern_path),
            Err(e) => format!("Save failed: {}", e),
        };
    }

    fn load_pattern(&mut self) {
        let path = PathBuf::from(&self.pattern_path);
        self.status = match pattern::load_pattern(&path, &mut lock_steps(&self.steps)) {
            Ok(report) => format!(
                "Loaded {} steps, {} rejected",
                report.applied,
                report.rejected.len()
            ),
            Err(e) => format!("Load failed: {}", e),
        };
    }
}

#[cfg(feature = "gui")]
impl eframe::App for SequencerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        use stepseq::{midi_note_name, InputEvent, TransportState};

        ctx.request_repaint();
        let snapshot = self.scheduler.snapshot();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("STEPSEQ - Step Sequencer");
            ui.add_space(10.0);

            // MIDI Port Selection
            let mut selected_port_changed = None;
            ui.horizontal(|ui| {
                ui.label("MIDI Output:");
                if self.available_midi_ports.is_empty() {
                    ui.label("No MIDI ports available");
                } else {
                    egui::ComboBox::from_id_source("midi_port")
                        .selected_text(
                            self.selected_port
                                .map(|i| self.available_midi_ports[i].as_str())
                                .unwrap_or("Select port..."),
                        )
                        .show_ui(ui, |ui| {
                            for (i, port_name) in self.available_midi_ports.iter().enumerate() {
                                if ui
                                    .selectable_label(self.selected_port == Some(i), port_name)
                                    .clicked()
                                {
                                    selected_port_changed = Some(i);
                                }
                            }
                        });
                }
            });

            if let Some(port_idx) = selected_port_changed {
                let mut device = MidiOutputDevice::new();
                match device.connect(port_idx) {
                    Ok(()) => {
                        self.scheduler.replace_transport(Box::new(device));
                        self.selected_port = Some(port_idx);
                    }
                    Err(e) => self.status = e.to_string(),
                }
            }

            ui.add_space(10.0);

            // Transport controls
            ui.horizontal(|ui| {
                match snapshot.transport {
                    TransportState::Running => {
                        if ui.button("⏸ Pause").clicked() {
                            let _ = self.scheduler.pause();
                        }
                    }
                    TransportState::Paused | TransportState::Stopped => {
                        if ui.button("▶ Play").clicked() {
                            self.scheduler.start();
                        }
                    }
                }
                if ui.button("⏹ Stop").clicked() {
                    let _ = self.scheduler.stop();
                }

                ui.add_space(20.0);

                ui.label("BPM:");
                let mut bpm = snapshot.tempo_bpm;
                let slider = egui::Slider::new(&mut bpm, MIN_TEMPO_BPM..=MAX_TEMPO_BPM).step_by(1.0);
                if ui.add(slider).changed() {
                    let _ = self.scheduler.set_tempo(bpm);
                }
                if ui.button("×2").clicked() {
                    self.scheduler.double_tempo();
                }
                if ui.button("÷2").clicked() {
                    self.scheduler.halve_tempo();
                }
                if ui.button("Reset").clicked() {
                    self.scheduler.reset_tempo();
                }
            });

            ui.horizontal(|ui| {
                ui.label("Gate:");
                let mut gate = snapshot.gate_ratio;
                if ui.add(egui::Slider::new(&mut gate, 0.1..=1.0)).changed() {
                    let _ = self.scheduler.set_gate_ratio(gate);
                }

                ui.label("Transpose:");
                let mut transpose = snapshot.transpose;
                if ui.add(egui::Slider::new(&mut transpose, -24..=24)).changed() {
                    self.scheduler.set_transpose_semitones(transpose);
                }

                ui.label("Mode:");
                egui::ComboBox::from_id_source("play_mode")
                    .selected_text(snapshot.play_mode.to_string())
                    .show_ui(ui, |ui| {
                        for mode in PlayMode::ALL {
                            if ui
                                .selectable_label(snapshot.play_mode == mode, mode.to_string())
                                .clicked()
                            {
                                self.scheduler.set_play_mode(mode);
                            }
                        }
                    });
            });

            ui.add_space(10.0);

            // Encoder + bulk edits
            ui.horizontal(|ui| {
                ui.label(format!("Encoder: {}", self.router.target()));
                if ui.button("◀").clicked() {
                    self.send(InputEvent::EncoderDelta(-1));
                }
                if ui.button("▶").clicked() {
                    self.send(InputEvent::EncoderDelta(1));
                }
                if ui.button("Next param").clicked() {
                    self.send(InputEvent::EncoderPressed);
                }

                ui.add_space(20.0);

                if ui.button("Select all").clicked() {
                    lock_steps(&self.steps).toggle_select_all();
                }
                if ui.button("Mute sel").clicked() && !lock_steps(&self.steps).toggle_mute_selected() {
                    self.status = "No steps selected".into();
                }
                if ui.button("Solo sel").clicked() && !lock_steps(&self.steps).toggle_solo_selected() {
                    self.status = "No steps selected".into();
                }
                if ui.button("C major").clicked() {
                    lock_steps(&self.steps).set_c_major_scale();
                }
                let mut frequency_mode = snapshot.frequency_mode;
                if ui.checkbox(&mut frequency_mode, "Hz").changed() {
                    lock_steps(&self.steps).set_frequency_mode(frequency_mode);
                }
            });

            ui.add_space(20.0);

            // Steps, 8 per row
            ui.label("Steps (shift-click to add to selection):");
            ui.add_space(5.0);

            let additive = ui.input(|i| i.modifiers.shift);
            let is_playing = snapshot.transport == TransportState::Running;
            for row in snapshot.steps.chunks(8) {
                ui.horizontal(|ui| {
                    for view in row {
                        let is_current = is_playing && snapshot.current_step + 1 == view.number;
                        let mut text = format!(
                            "{}\n{} v{}",
                            view.number,
                            midi_note_name(view.pitch),
                            view.velocity
                        );
                        if view.muted {
                            text.push_str(" M");
                        }
                        if view.solo {
                            text.push_str(" S");
                        }

                        let button = egui::Button::new(text)
                            .min_size(egui::vec2(90.0, 50.0))
                            .stroke(if view.selected {
                                egui::Stroke::new(2.0, egui::Color32::WHITE)
                            } else {
                                egui::Stroke::NONE
                            })
                            .fill(if is_current {
                                egui::Color32::from_rgb(100, 200, 100)
                            } else if view.audible {
                                egui::Color32::from_rgb(60, 60, 200)
                            } else {
                                egui::Color32::from_rgb(40, 40, 40)
                            });

                        if ui.add(button).clicked() {
                            self.send(InputEvent::StepPressed {
                                number: view.number,
                                exclusive: !additive,
                            });
                        }
                    }
                });
            }

            ui.separator();
            ui.horizontal(|ui| {
                ui.label("Pattern:");
                ui.text_edit_singleline(&mut self.pattern_path);
                if ui.button("Save").clicked() {
                    self.save_pattern();
                }
                if ui.button("Load").clicked() {
                    self.load_pattern();
                }
            });
            if !self.status.is_empty() {
                ui.colored_label(egui::Color32::YELLOW, &self.status);
            }
        });
    }
}
