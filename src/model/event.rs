use serde::{Deserialize, Serialize};

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const POLY_PRESSURE: u8 = 0xA0;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const CHANNEL_PRESSURE: u8 = 0xD0;
pub const PITCH_BEND: u8 = 0xE0;

pub const META_TRACK_NAME: u8 = 0x03;
pub const META_INSTRUMENT_NAME: u8 = 0x04;
pub const META_END_OF_TRACK: u8 = 0x2F;
pub const META_TEMPO: u8 = 0x51;
pub const META_TIME_SIGNATURE: u8 = 0x58;
pub const META_KEY_SIGNATURE: u8 = 0x59;

pub const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;

/// A short channel-voice message. `command` is the status high nibble (e.g. `0x90`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMessage {
    pub command: u8,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
}

impl ChannelMessage {
    /// Masks every field into range. Two-byte messages (program change, channel pressure) carry no `data2`.
    pub fn new(command: u8, channel: u8, data1: u8, data2: u8) -> Self {
        let command = command & 0xF0;
        let data2 = if Self::data_len(command) == 1 {
            0
        } else {
            data2 & 0x7F
        };

        Self {
            command,
            channel: channel & 0x0F,
            data1: data1 & 0x7F,
            data2,
        }
    }

    pub fn is_channel_command(command: u8) -> bool {
        (NOTE_OFF..=PITCH_BEND).contains(&command) && command & 0x0F == 0
    }

    fn data_len(command: u8) -> usize {
        match command {
            PROGRAM_CHANGE | CHANNEL_PRESSURE => 1,
            _ => 2,
        }
    }

    pub fn status(&self) -> u8 {
        self.command | self.channel
    }

    /// The wire bytes of this message, ready to hand to a MIDI output.
    pub fn to_bytes(&self) -> Vec<u8> {
        match Self::data_len(self.command) {
            1 => vec![self.status(), self.data1],
            _ => vec![self.status(), self.data1, self.data2],
        }
    }

    /// A note-on with velocity 0 is treated as a note-off, like every MIDI receiver does.
    pub fn is_note_on(&self) -> bool {
        self.command == NOTE_ON && self.data2 > 0
    }
}

/// The meta event kinds that get semantic fields in the text format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Tempo,
    TimeSignature,
    KeySignature,
    TrackName,
    InstrumentName,
    EndOfTrack,
}

impl MetaKind {
    pub fn from_type(meta_type: u8) -> Option<Self> {
        match meta_type {
            META_TEMPO => Some(MetaKind::Tempo),
            META_TIME_SIGNATURE => Some(MetaKind::TimeSignature),
            META_KEY_SIGNATURE => Some(MetaKind::KeySignature),
            META_TRACK_NAME => Some(MetaKind::TrackName),
            META_INSTRUMENT_NAME => Some(MetaKind::InstrumentName),
            META_END_OF_TRACK => Some(MetaKind::EndOfTrack),
            _ => None,
        }
    }

    pub fn from_description(description: &str) -> Option<Self> {
        match description {
            "TEMPO" => Some(MetaKind::Tempo),
            "TIME_SIGNATURE" => Some(MetaKind::TimeSignature),
            "KEY_SIGNATURE" => Some(MetaKind::KeySignature),
            "TRACK_NAME" => Some(MetaKind::TrackName),
            "INSTRUMENT_NAME" => Some(MetaKind::InstrumentName),
            "END_OF_TRACK" => Some(MetaKind::EndOfTrack),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            MetaKind::Tempo => "TEMPO",
            MetaKind::TimeSignature => "TIME_SIGNATURE",
            MetaKind::KeySignature => "KEY_SIGNATURE",
            MetaKind::TrackName => "TRACK_NAME",
            MetaKind::InstrumentName => "INSTRUMENT_NAME",
            MetaKind::EndOfTrack => "END_OF_TRACK",
        }
    }

    /// Whether `payload` has the byte layout this kind requires.
    pub fn accepts(&self, payload: &[u8]) -> bool {
        match self {
            MetaKind::Tempo => payload.len() == 3,
            MetaKind::TimeSignature => payload.len() == 4,
            MetaKind::KeySignature => payload.len() == 2,
            MetaKind::TrackName | MetaKind::InstrumentName => true,
            MetaKind::EndOfTrack => payload.is_empty(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetaEvent {
    pub meta_type: u8,
    pub payload: Vec<u8>,
}

impl MetaEvent {
    /// The recognized kind, only if the payload is shaped the way that kind requires.
    pub fn kind(&self) -> Option<MetaKind> {
        MetaKind::from_type(self.meta_type).filter(|kind| kind.accepts(&self.payload))
    }

    /// Microseconds per quarter note, for well-formed tempo events.
    pub fn tempo_mpqn(&self) -> Option<u32> {
        match (self.kind(), self.payload.as_slice()) {
            (Some(MetaKind::Tempo), &[a, b, c]) => {
                Some(((a as u32) << 16) | ((b as u32) << 8) | c as u32)
            }
            _ => None,
        }
    }

    pub fn text(&self) -> Option<String> {
        match self.kind() {
            Some(MetaKind::TrackName | MetaKind::InstrumentName) => {
                Some(String::from_utf8_lossy(&self.payload).into_owned())
            }
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SysexEvent {
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Channel(ChannelMessage),
    Meta(MetaEvent),
    Sysex(SysexEvent),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub tick: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn channel(tick: u64, command: u8, channel: u8, data1: u8, data2: u8) -> Self {
        Self {
            tick,
            kind: EventKind::Channel(ChannelMessage::new(command, channel, data1, data2)),
        }
    }

    pub fn note_on(tick: u64, channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel(tick, NOTE_ON, channel, note, velocity)
    }

    pub fn note_off(tick: u64, channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel(tick, NOTE_OFF, channel, note, velocity)
    }

    pub fn program_change(tick: u64, channel: u8, program: u8) -> Self {
        Self::channel(tick, PROGRAM_CHANGE, channel, program, 0)
    }

    pub fn meta(tick: u64, meta_type: u8, payload: Vec<u8>) -> Self {
        Self {
            tick,
            kind: EventKind::Meta(MetaEvent { meta_type, payload }),
        }
    }

    pub fn tempo(tick: u64, mpqn: u32) -> Self {
        let bytes = mpqn.to_be_bytes();
        Self::meta(tick, META_TEMPO, bytes[1..].to_vec())
    }

    pub fn time_signature(
        tick: u64,
        numerator: u8,
        denominator_pow2: u8,
        clocks_per_click: u8,
        thirty_seconds_per_quarter: u8,
    ) -> Self {
        Self::meta(
            tick,
            META_TIME_SIGNATURE,
            vec![numerator, denominator_pow2, clocks_per_click, thirty_seconds_per_quarter],
        )
    }

    pub fn key_signature(tick: u64, key: i8, scale: u8) -> Self {
        Self::meta(tick, META_KEY_SIGNATURE, vec![key as u8, scale])
    }

    pub fn track_name(tick: u64, name: &str) -> Self {
        Self::meta(tick, META_TRACK_NAME, name.as_bytes().to_vec())
    }

    pub fn end_of_track(tick: u64) -> Self {
        Self::meta(tick, META_END_OF_TRACK, Vec::new())
    }

    pub fn sysex(tick: u64, payload: Vec<u8>) -> Self {
        Self {
            tick,
            kind: EventKind::Sysex(SysexEvent { payload }),
        }
    }

    pub fn as_channel(&self) -> Option<&ChannelMessage> {
        match &self.kind {
            EventKind::Channel(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_meta(&self) -> Option<&MetaEvent> {
        match &self.kind {
            EventKind::Meta(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn is_end_of_track(&self) -> bool {
        self.as_meta()
            .is_some_and(|meta| meta.meta_type == META_END_OF_TRACK)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_fields_are_masked() {
        let msg = ChannelMessage::new(0x93, 17, 200, 130);
        assert_eq!(msg.command, NOTE_ON);
        assert_eq!(msg.channel, 1);
        assert_eq!(msg.data1, 200 & 0x7F);
        assert_eq!(msg.data2, 130 & 0x7F);
    }

    #[test]
    fn two_byte_messages_drop_data2() {
        let msg = ChannelMessage::new(PROGRAM_CHANGE, 2, 41, 99);
        assert_eq!(msg.data2, 0);
        assert_eq!(msg.to_bytes(), vec![0xC2, 41]);

        let msg = ChannelMessage::new(NOTE_ON, 9, 36, 127);
        assert_eq!(msg.to_bytes(), vec![0x99, 36, 127]);
    }

    #[test]
    fn zero_velocity_note_on_is_not_a_note_on() {
        assert!(!ChannelMessage::new(NOTE_ON, 0, 60, 0).is_note_on());
        assert!(ChannelMessage::new(NOTE_ON, 0, 60, 1).is_note_on());
    }

    #[test]
    fn tempo_payload_is_big_endian() {
        let event = Event::tempo(0, 500_000);
        let meta = event.as_meta().unwrap();
        assert_eq!(meta.payload, vec![0x07, 0xA1, 0x20]);
        assert_eq!(meta.tempo_mpqn(), Some(500_000));
    }

    #[test]
    fn misshapen_payload_is_not_recognized() {
        let meta = MetaEvent {
            meta_type: META_TEMPO,
            payload: vec![1, 2],
        };
        assert_eq!(meta.kind(), None);
        assert_eq!(meta.tempo_mpqn(), None);

        let eot = MetaEvent {
            meta_type: META_END_OF_TRACK,
            payload: Vec::new(),
        };
        assert_eq!(eot.kind(), Some(MetaKind::EndOfTrack));
    }

    #[test]
    fn descriptions_round_trip() {
        for kind in [
            MetaKind::Tempo,
            MetaKind::TimeSignature,
            MetaKind::KeySignature,
            MetaKind::TrackName,
            MetaKind::InstrumentName,
            MetaKind::EndOfTrack,
        ] {
            assert_eq!(MetaKind::from_description(kind.description()), Some(kind));
        }
        assert_eq!(MetaKind::from_description("LYRIC"), None);
    }
}
