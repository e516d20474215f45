/// Session configuration, loadable from JSON
use crate::error::{Result, SequencerError};
use crate::sequencer::playback::{
    DEFAULT_GATE_RATIO, DEFAULT_TEMPO_BPM, MAX_GATE_RATIO, MAX_TEMPO_BPM, MAX_TRANSPOSE,
    MIN_GATE_RATIO, MIN_TEMPO_BPM,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Name the config takes when stored next to pattern files.
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub total_steps: usize,
    pub tempo_bpm: f32,
    pub gate_ratio: f32,
    pub midi_channel: u8,
    pub transpose: i32,
    /// Substring of the MIDI output port name to connect to.
    pub midi_port: Option<String>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            total_steps: 16,
            tempo_bpm: DEFAULT_TEMPO_BPM,
            gate_ratio: DEFAULT_GATE_RATIO,
            midi_channel: 0,
            transpose: 0,
            midi_port: None,
        }
    }
}

impl SequencerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Refuses to write a config that would not load back.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_steps == 0 {
            return Err(SequencerError::Config("total_steps must be at least 1".into()));
        }
        if !(MIN_TEMPO_BPM..=MAX_TEMPO_BPM).contains(&self.tempo_bpm) {
            return Err(SequencerError::Config(format!(
                "tempo_bpm {} outside {}..={}",
                self.tempo_bpm, MIN_TEMPO_BPM, MAX_TEMPO_BPM
            )));
        }
        if !(MIN_GATE_RATIO..=MAX_GATE_RATIO).contains(&self.gate_ratio) {
            return Err(SequencerError::Config(format!(
                "gate_ratio {} outside {}..={}",
                self.gate_ratio, MIN_GATE_RATIO, MAX_GATE_RATIO
            )));
        }
        if self.midi_channel > 15 {
            return Err(SequencerError::Config(format!(
                "midi_channel {} outside 0..=15",
                self.midi_channel
            )));
        }
        if self.transpose.abs() > MAX_TRANSPOSE {
            return Err(SequencerError::Config(format!(
                "transpose {} outside -{1}..={1}",
                self.transpose, MAX_TRANSPOSE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SequencerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tempo_bpm": 90, "midi_port": "IAC"}}"#).unwrap();
        let config = SequencerConfig::load(file.path()).unwrap();
        assert_eq!(config.tempo_bpm, 90.0);
        assert_eq!(config.total_steps, 16);
        assert_eq!(config.midi_port.as_deref(), Some("IAC"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = SequencerConfig {
            total_steps: 8,
            tempo_bpm: 97.5,
            midi_port: Some("IAC".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SequencerConfig::load(&path).unwrap(), config);

        let bad = SequencerConfig {
            midi_channel: 16,
            ..Default::default()
        };
        assert!(bad.save(&dir.path().join("bad.json")).is_err());
        assert!(!dir.path().join("bad.json").exists());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = SequencerConfig {
            gate_ratio: 2.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SequencerError::Config(_))));

        let config = SequencerConfig {
            transpose: -25,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
