/// Pattern documents: the JSON shape shared with the persistence layer
use crate::config::CONFIG_FILE_NAME;
use crate::error::{Result, SequencerError};
use crate::sequencer::step::EnvelopeParam;
use crate::sequencer::StepController;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sustain: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<i64>,
}

impl EnvelopeRecord {
    pub fn get(&self, param: EnvelopeParam) -> Option<i64> {
        match param {
            EnvelopeParam::Attack => self.attack,
            EnvelopeParam::Decay => self.decay,
            EnvelopeParam::Sustain => self.sustain,
            EnvelopeParam::Release => self.release,
        }
    }
}

/// One step's saved fields. Absent fields leave the step untouched on import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub midi_note: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<EnvelopeRecord>,
}

impl StepRecord {
    pub fn new(step: i64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternDocument {
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// Position of the record in the document's `steps` array.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub applied: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A document whose shape was valid, plus the records that failed to parse.
#[derive(Debug, Clone, Default)]
pub struct ParsedPattern {
    pub document: PatternDocument,
    /// Position in the source array of each record in `document`.
    pub positions: Vec<usize>,
    pub rejected: Vec<RejectedRecord>,
}

/// Parse pattern JSON leniently. The outer shape (`steps`, or the
/// `collections` variant) must be valid; individual malformed records are
/// skipped and reported.
pub fn parse_pattern(text: &str) -> Result<ParsedPattern> {
    let value: Value = serde_json::from_str(text)?;
    parse_pattern_value(&value)
}

pub fn parse_pattern_value(value: &Value) -> Result<ParsedPattern> {
    let records = if value.get("steps").is_some() {
        steps_array(value)?.clone()
    } else if value.get("collections").is_some() {
        flatten_collections(value, None, None)?
    } else {
        return Err(SequencerError::Pattern(
            "expected a \"steps\" or \"collections\" key".into(),
        ));
    };

    let mut parsed = ParsedPattern::default();
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<StepRecord>(record) {
            Ok(record) => {
                parsed.document.steps.push(record);
                parsed.positions.push(index);
            }
            Err(e) => {
                warn!("Skipping malformed step record #{}: {}", index, e);
                parsed.rejected.push(RejectedRecord {
                    index,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(parsed)
}

fn steps_array(value: &Value) -> Result<&Vec<Value>> {
    value
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| SequencerError::Pattern("\"steps\" must be an array".into()))
}

/// Reduce a `collections` document to the step records of one mode.
/// `None` picks the first collection / first mode.
pub fn flatten_collections(
    value: &Value,
    collection: Option<&str>,
    mode: Option<&str>,
) -> Result<Vec<Value>> {
    let collections = value
        .get("collections")
        .and_then(Value::as_array)
        .ok_or_else(|| SequencerError::Pattern("\"collections\" must be an array".into()))?;

    let chosen = collections
        .iter()
        .find(|c| match collection {
            Some(name) => c.get("collectionName").and_then(Value::as_str) == Some(name),
            None => true,
        })
        .ok_or_else(|| {
            SequencerError::Pattern(format!("collection not found: {}", collection.unwrap_or("<first>")))
        })?;

    let modes = chosen
        .get("modes")
        .and_then(Value::as_array)
        .ok_or_else(|| SequencerError::Pattern("collection has no \"modes\" array".into()))?;

    let chosen_mode = modes
        .iter()
        .find(|m| match mode {
            Some(name) => m.get("name").and_then(Value::as_str) == Some(name),
            None => true,
        })
        .ok_or_else(|| SequencerError::Pattern(format!("mode not found: {}", mode.unwrap_or("<first>"))))?;

    Ok(steps_array(chosen_mode)?.clone())
}

pub fn load_pattern_file(path: &Path) -> Result<ParsedPattern> {
    let text = fs::read_to_string(path)?;
    parse_pattern(&text)
}

pub fn save_pattern_file(path: &Path, document: &PatternDocument) -> Result<()> {
    let text = serde_json::to_string_pretty(document)?;
    fs::write(path, text)?;
    info!("Saved {} steps to {}", document.steps.len(), path.display());
    Ok(())
}

/// Pattern file names in `dir`, sorted. The config file stored alongside
/// is skipped; a missing directory has no patterns.
pub fn list_patterns(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        debug!("Pattern directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") && name != CONFIG_FILE_NAME {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Read a pattern file and apply it. Nothing is touched if the file cannot
/// be read or its shape is invalid.
pub fn load_pattern(path: &Path, controller: &mut StepController) -> Result<ImportReport> {
    let parsed = load_pattern_file(path)?;
    let mut report = controller.import_pattern(&parsed.document);
    for rejected in &mut report.rejected {
        rejected.index = parsed.positions[rejected.index];
    }
    report.rejected.extend(parsed.rejected);
    report.rejected.sort_by_key(|r| r.index);
    info!(
        "Loaded pattern {}: {} applied, {} rejected",
        path.display(),
        report.applied,
        report.rejected.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_flat_document() {
        let parsed = parse_pattern(r#"{"steps":[{"step":2,"velocity":80}]}"#).unwrap();
        assert!(parsed.rejected.is_empty());
        assert_eq!(parsed.document.steps.len(), 1);
        assert_eq!(parsed.document.steps[0].step, 2);
        assert_eq!(parsed.document.steps[0].velocity, Some(80));
        assert_eq!(parsed.document.steps[0].midi_note, None);
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let text = r#"{"steps":[{"step":1,"velocity":"loud"},{"step":3,"midiNote":64}]}"#;
        let parsed = parse_pattern(text).unwrap();
        assert_eq!(parsed.document.steps.len(), 1);
        assert_eq!(parsed.rejected.len(), 1);
        assert_eq!(parsed.rejected[0].index, 0);
    }

    #[test]
    fn test_bad_shape_is_an_error() {
        assert!(parse_pattern(r#"{"pattern":[]}"#).is_err());
        assert!(parse_pattern(r#"{"steps":5}"#).is_err());
        assert!(parse_pattern("not json").is_err());
    }

    #[test]
    fn test_flatten_collections() {
        let doc = json!({
            "collections": [
                {"collectionName": "A", "modes": [
                    {"name": "major", "steps": [{"step": 1, "midiNote": 60}]},
                    {"name": "minor", "steps": [{"step": 1, "midiNote": 63}]}
                ]},
                {"collectionName": "B", "modes": [
                    {"name": "major", "steps": [{"step": 1, "midiNote": 70}]}
                ]}
            ]
        });

        let first = parse_pattern_value(&doc).unwrap();
        assert_eq!(first.document.steps[0].midi_note, Some(60));

        let minor = flatten_collections(&doc, Some("A"), Some("minor")).unwrap();
        assert_eq!(minor[0]["midiNote"], 63);

        let b = flatten_collections(&doc, Some("B"), None).unwrap();
        assert_eq!(b[0]["midiNote"], 70);

        assert!(flatten_collections(&doc, Some("C"), None).is_err());
    }

    #[test]
    fn test_export_omits_absent_fields() {
        let doc = PatternDocument {
            steps: vec![StepRecord {
                velocity: Some(10),
                ..StepRecord::new(4)
            }],
        };
        let text = serde_json::to_string(&doc).unwrap();
        assert_eq!(text, r#"{"steps":[{"step":4,"velocity":10}]}"#);
    }
}
