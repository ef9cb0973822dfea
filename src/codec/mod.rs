//! The line-oriented text format that sequences are exchanged in.
//!
//! ```text
//! MIDI_HEADER|divisionType=0.0|resolution=480
//! TRACKS|count=1
//! TRACK|number=0|events=2
//! EVENT|tick=0|type=ShortMessage|command=144|channel=0|data1=60|data2=100|description=NOTE_ON|note=60|velocity=100
//! EVENT|tick=480|type=ShortMessage|command=128|channel=0|data1=60|data2=0|description=NOTE_OFF|note=60|velocity=0
//! ```
//!
//! Every line is a record tag followed by `|`-separated `key=value` fields. Descriptive fields on
//! channel messages (`note`, `velocity`, `program`) are only a reading aid; the raw
//! `command`/`channel`/`data1`/`data2` are what gets decoded. Recognized meta events are rebuilt
//! from their semantic fields. Anything else carries its bytes in a base64 `data` field.

mod decoder;
mod encoder;

pub use decoder::{Decoder, decode, strip_delimiters};
pub use encoder::{encode, encode_wrapped};

pub const MIDI_START_DELIMITER: &str = "<<MIDI_START>>";
pub const MIDI_END_DELIMITER: &str = "<<MIDI_END>>";

pub(crate) const HEADER_TAG: &str = "MIDI_HEADER";
pub(crate) const TRACKS_TAG: &str = "TRACKS";
pub(crate) const TRACK_TAG: &str = "TRACK";
pub(crate) const EVENT_TAG: &str = "EVENT";

pub(crate) const SHORT_MESSAGE: &str = "ShortMessage";
pub(crate) const META_MESSAGE: &str = "MetaMessage";
pub(crate) const SYSEX_MESSAGE: &str = "SysexMessage";
pub(crate) const SYSEX_DESCRIPTION: &str = "SYSTEM_EXCLUSIVE";

pub(crate) const DEFAULT_CLOCKS_PER_CLICK: u8 = 24;
pub(crate) const DEFAULT_32NDS_PER_QUARTER: u8 = 8;

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::event::*;
    use crate::model::sequence::{PPQ, SMPTE_30DROP, Sequence, Track};

    fn full_sequence() -> Sequence {
        let mut seq = Sequence::new(PPQ, 96).unwrap();

        let conductor: Track = [
            Event::track_name(0, "Conductor"),
            Event::tempo(0, 500_000),
            Event::time_signature(0, 6, 3, 36, 8),
            Event::key_signature(0, -3, 1),
            Event::tempo(384, 600_000),
            Event::end_of_track(768),
        ]
        .into_iter()
        .collect();

        let piano: Track = [
            Event::meta(0, META_INSTRUMENT_NAME, b"Grand Piano".to_vec()),
            Event::program_change(0, 1, 0),
            Event::channel(0, CONTROL_CHANGE, 1, 7, 110),
            Event::note_on(0, 1, 60, 90),
            Event::note_on(0, 1, 64, 90),
            Event::channel(48, PITCH_BEND, 1, 0, 80),
            Event::note_off(96, 1, 60, 0),
            Event::note_on(96, 1, 64, 0),
            Event::meta(100, 0x05, b"la".to_vec()),
            Event::sysex(120, vec![0x7E, 0x7F, 0x09, 0x01, 0xF7]),
            Event::channel(130, CHANNEL_PRESSURE, 1, 33, 0),
            Event::end_of_track(192),
        ]
        .into_iter()
        .collect();

        seq.tracks.push(conductor);
        seq.tracks.push(piano);
        seq
    }

    #[test]
    fn concrete_note_pair() {
        env_logger::try_init().unwrap_or(());

        let mut seq = Sequence::new(PPQ, 480).unwrap();
        seq.tracks.push(
            [Event::note_on(0, 0, 60, 100), Event::note_off(480, 0, 60, 0)]
                .into_iter()
                .collect(),
        );

        let expected = "MIDI_HEADER|divisionType=0.0|resolution=480\n\
                        TRACKS|count=1\n\
                        TRACK|number=0|events=2\n\
                        EVENT|tick=0|type=ShortMessage|command=144|channel=0|data1=60|data2=100|description=NOTE_ON|note=60|velocity=100\n\
                        EVENT|tick=480|type=ShortMessage|command=128|channel=0|data1=60|data2=0|description=NOTE_OFF|note=60|velocity=0\n";

        assert_eq!(encode(&seq), expected);

        let decoded = decode(expected).unwrap();
        assert_eq!(decoded, seq);
        assert_eq!(decoded.tracks[0].events[0].tick, 0);
        assert_eq!(decoded.tracks[0].events[1].tick, 480);
    }

    #[test]
    fn round_trip_every_event_kind() {
        env_logger::try_init().unwrap_or(());

        let seq = full_sequence();
        let decoded = decode(&encode(&seq)).unwrap();
        assert_eq!(decoded, seq);
    }

    #[test]
    fn round_trip_keeps_awkward_payloads() {
        env_logger::try_init().unwrap_or(());

        let mut seq = Sequence::new(PPQ, 480).unwrap();
        let mut track: Track = [500_001, 545_454, 428_571, 652_174, 1_000_003, 0xFF_FFFF]
            .into_iter()
            .enumerate()
            .map(|(i, mpqn)| Event::tempo(i as u64 * 10, mpqn))
            .collect();
        track.push(Event::track_name(100, "Piano "));
        track.push(Event::meta(100, META_INSTRUMENT_NAME, b"  Strings\t".to_vec()));
        seq.tracks.push(track);

        let decoded = decode(&encode(&seq)).unwrap();
        assert_eq!(decoded, seq);
    }

    #[test]
    fn round_trip_is_a_fixed_point() {
        env_logger::try_init().unwrap_or(());

        let mut seq = Sequence::new(SMPTE_30DROP, 80).unwrap();
        seq.tracks.push(
            [Event::tempo(0, 483_871), Event::note_on(5, 2, 70, 64)]
                .into_iter()
                .collect(),
        );

        let first = encode(&decode(&encode(&seq)).unwrap());
        let second = encode(&decode(&first).unwrap());
        let third = encode(&decode(&second).unwrap());
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert!(first.starts_with("MIDI_HEADER|divisionType=29.97|resolution=80\n"));
    }

    #[test]
    fn decoded_ticks_are_ordered() {
        let seq = decode(&encode(&full_sequence())).unwrap();
        for track in seq.tracks.iter() {
            assert!(track.events.windows(2).all(|w| w[0].tick <= w[1].tick));
        }

        // ties keep the order they were written in
        let piano = &seq.tracks[1];
        let at_zero: Vec<&EventKind> = piano
            .events
            .iter()
            .filter(|e| e.tick == 0)
            .map(|e| &e.kind)
            .collect();
        assert_eq!(at_zero.len(), 5);
        assert!(matches!(at_zero[0], EventKind::Meta(_)));
        assert!(matches!(at_zero[4], EventKind::Channel(m) if m.data1 == 64));
    }

    #[test]
    fn wrapped_output_decodes() {
        let seq = full_sequence();
        let wrapped = encode_wrapped(&seq);
        assert!(wrapped.starts_with(MIDI_START_DELIMITER));
        assert!(wrapped.trim_end().ends_with(MIDI_END_DELIMITER));

        let response = format!("Sure! Here is the edited piece:\n\n{}\nEnjoy the new groove.", wrapped);
        assert_eq!(decode(&response).unwrap(), seq);
    }
}
