/// MIDI output: note emission with active-note bookkeeping, and the midir transport
use crate::error::{Result, SequencerError};
use log::{debug, info, trace, warn};
use midir::{MidiOutput, MidiOutputConnection};
use std::collections::BTreeSet;

const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;
const CONTROL_CHANGE: u8 = 0xB0;
const ALL_NOTES_OFF: u8 = 123;

const CLIENT_NAME: &str = "stepseq MIDI Output";

/// Whatever moves raw MIDI bytes off the box.
pub trait MidiTransport: Send {
    fn send(&mut self, message: &[u8]) -> Result<()>;
}

/// Validates and sends note messages, tracking which notes are sounding.
pub struct NoteEmitter {
    transport: Box<dyn MidiTransport>,
    active_notes: BTreeSet<u8>,
}

fn validate(channel: u8, note: u8, velocity: u8) -> Result<()> {
    if channel > 15 {
        return Err(SequencerError::out_of_range("MIDI channel", channel));
    }
    if note > 127 {
        return Err(SequencerError::out_of_range("MIDI note", note));
    }
    if velocity > 127 {
        return Err(SequencerError::out_of_range("MIDI velocity", velocity));
    }
    Ok(())
}

impl NoteEmitter {
    pub fn new(transport: Box<dyn MidiTransport>) -> Self {
        Self {
            transport,
            active_notes: BTreeSet::new(),
        }
    }

    pub fn active_notes(&self) -> &BTreeSet<u8> {
        &self.active_notes
    }

    /// Swap the transport. Notes still sounding on the old one are released first.
    pub fn replace_transport(&mut self, transport: Box<dyn MidiTransport>, channel: u8) {
        if let Err(e) = self.all_notes_off(channel) {
            warn!("Releasing notes before transport swap failed: {}", e);
        }
        self.transport = transport;
    }

    fn send(&mut self, message: [u8; 3]) -> Result<()> {
        trace!("MIDI out {:02X} {:02X} {:02X}", message[0], message[1], message[2]);
        self.transport.send(&message)
    }

    /// Invalid arguments are dropped without sending anything. A transport
    /// failure still records the note as active.
    pub fn note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<()> {
        if let Err(e) = validate(channel, note, velocity) {
            debug!("Dropping note-on: {}", e);
            return Err(e);
        }
        self.active_notes.insert(note);
        self.send([NOTE_ON | channel, note, velocity])
    }

    pub fn note_off(&mut self, channel: u8, note: u8, velocity: u8) -> Result<()> {
        if let Err(e) = validate(channel, note, velocity) {
            debug!("Dropping note-off: {}", e);
            return Err(e);
        }
        self.active_notes.remove(&note);
        self.send([NOTE_OFF | channel, note, velocity])
    }

    /// Note-off for every tracked note, without the all-notes-off controller.
    pub fn release_active(&mut self, channel: u8) -> Result<()> {
        if channel > 15 {
            return Err(SequencerError::out_of_range("MIDI channel", channel));
        }
        let mut first_error = None;
        for note in std::mem::take(&mut self.active_notes) {
            if let Err(e) = self.send([NOTE_OFF | channel, note, 0]) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Note-off for every tracked note followed by CC 123. The active set is
    /// cleared even when sends fail.
    pub fn all_notes_off(&mut self, channel: u8) -> Result<()> {
        if channel > 15 {
            return Err(SequencerError::out_of_range("MIDI channel", channel));
        }
        let released = self.release_active(channel);
        let controller = self.send([CONTROL_CHANGE | channel, ALL_NOTES_OFF, 0]);
        released.and(controller)
    }
}

pub struct MidiOutputDevice {
    connection: Option<MidiOutputConnection>,
    port_name: Option<String>,
}

impl MidiOutputDevice {
    pub fn new() -> Self {
        Self {
            connection: None,
            port_name: None,
        }
    }

    pub fn available_ports() -> Vec<String> {
        if let Ok(midi_out) = MidiOutput::new(CLIENT_NAME) {
            midi_out
                .ports()
                .iter()
                .filter_map(|p| midi_out.port_name(p).ok())
                .collect()
        } else {
            vec![]
        }
    }

    pub fn connect(&mut self, port_index: usize) -> Result<()> {
        let midi_out = MidiOutput::new(CLIENT_NAME)
            .map_err(|e| SequencerError::Transport(format!("Failed to create MIDI output: {}", e)))?;

        let ports = midi_out.ports();
        let port = ports
            .get(port_index)
            .ok_or_else(|| SequencerError::Transport(format!("Invalid port index {}", port_index)))?;
        let name = midi_out.port_name(port).unwrap_or_else(|_| format!("port {}", port_index));

        let connection = midi_out
            .connect(port, "stepseq")
            .map_err(|e| SequencerError::Transport(format!("Failed to connect: {}", e)))?;

        info!("Connected MIDI output to {}", name);
        self.connection = Some(connection);
        self.port_name = Some(name);
        Ok(())
    }

    /// Connect to the first port whose name contains `pattern`.
    pub fn connect_by_name(&mut self, pattern: &str) -> Result<()> {
        let index = Self::available_ports()
            .iter()
            .position(|name| name.contains(pattern))
            .ok_or_else(|| SequencerError::Transport(format!("No MIDI port matching {:?}", pattern)))?;
        self.connect(index)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
            info!("Disconnected MIDI output");
        }
        self.port_name = None;
    }
}

impl Default for MidiOutputDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiTransport for MidiOutputDevice {
    // A device with no connection swallows messages.
    fn send(&mut self, message: &[u8]) -> Result<()> {
        if let Some(ref mut conn) = self.connection {
            conn.send(message)
                .map_err(|e| SequencerError::Transport(format!("Failed to send: {}", e)))?;
        }
        Ok(())
    }
}

/// Writes every message to the log instead of a port.
#[derive(Debug, Default)]
pub struct LogTransport {
    sent: u64,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MidiTransport for LogTransport {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        self.sent += 1;
        let text = match message {
            [status, note, velocity] if status & 0xF0 == NOTE_ON => {
                format!("note-on  {:<4} vel {}", midi_note_name(*note), velocity)
            }
            [status, note, _] if status & 0xF0 == NOTE_OFF => {
                format!("note-off {}", midi_note_name(*note))
            }
            other => format!("{:02X?}", other),
        };
        info!("[midi #{}] {}", self.sent, text);
        Ok(())
    }
}

pub fn midi_note_name(note: u8) -> String {
    let note_names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i32 - 1;
    let note_index = (note % 12) as usize;
    format!("{}{}", note_names[note_index], octave)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl MidiTransport for Recorder {
        fn send(&mut self, message: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(message.to_vec());
            if self.fail {
                Err(SequencerError::Transport("unplugged".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_wire_format() {
        let rec = Recorder::default();
        let mut emitter = NoteEmitter::new(Box::new(rec.clone()));
        emitter.note_on(2, 60, 100).unwrap();
        emitter.note_off(2, 60, 0).unwrap();
        emitter.all_notes_off(2).unwrap();
        assert_eq!(
            *rec.sent.lock().unwrap(),
            vec![vec![0x92, 60, 100], vec![0x82, 60, 0], vec![0xB2, 123, 0]]
        );
    }

    #[test]
    fn test_invalid_arguments_are_dropped() {
        let rec = Recorder::default();
        let mut emitter = NoteEmitter::new(Box::new(rec.clone()));
        assert!(emitter.note_on(16, 60, 100).is_err());
        assert!(emitter.note_on(0, 128, 100).is_err());
        assert!(emitter.note_off(0, 60, 200).is_err());
        assert!(emitter.all_notes_off(16).is_err());
        assert!(rec.sent.lock().unwrap().is_empty());
        assert!(emitter.active_notes().is_empty());
    }

    #[test]
    fn test_all_notes_off_releases_tracked_notes_first() {
        let rec = Recorder::default();
        let mut emitter = NoteEmitter::new(Box::new(rec.clone()));
        emitter.note_on(0, 60, 100).unwrap();
        emitter.note_on(0, 64, 100).unwrap();
        rec.sent.lock().unwrap().clear();

        emitter.all_notes_off(0).unwrap();
        assert_eq!(
            *rec.sent.lock().unwrap(),
            vec![vec![0x80, 60, 0], vec![0x80, 64, 0], vec![0xB0, 123, 0]]
        );
        assert!(emitter.active_notes().is_empty());
    }

    #[test]
    fn test_transport_failure_keeps_bookkeeping() {
        let rec = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut emitter = NoteEmitter::new(Box::new(rec.clone()));
        assert!(emitter.note_on(0, 60, 100).is_err());
        assert!(emitter.active_notes().contains(&60));

        assert!(emitter.all_notes_off(0).is_err());
        assert!(emitter.active_notes().is_empty());
        // note-off + CC were still attempted
        assert_eq!(rec.sent.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_midi_note_name() {
        assert_eq!(midi_note_name(60), "C4");
        assert_eq!(midi_note_name(69), "A4");
        assert_eq!(midi_note_name(0), "C-1");
    }
}
