use super::*;
use crate::model::event::{
    ChannelMessage, Event, EventKind, MICROSECONDS_PER_MINUTE, MetaEvent, MetaKind, NOTE_OFF,
    NOTE_ON, PROGRAM_CHANGE,
};
use crate::model::sequence::Sequence;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt::Write;

/// Serializes a sequence to the text format. Pure; events come out in track order.
pub fn encode(sequence: &Sequence) -> String {
    let mut out = String::with_capacity(64 + sequence.event_count() * 96);

    let _ = writeln!(
        out,
        "{}|divisionType={:?}|resolution={}",
        HEADER_TAG, sequence.division_type, sequence.resolution
    );
    let _ = writeln!(out, "{}|count={}", TRACKS_TAG, sequence.tracks.len());

    for (number, track) in sequence.tracks.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}|number={}|events={}",
            TRACK_TAG,
            number,
            track.len()
        );

        for event in track.events.iter() {
            write_event(&mut out, event);
            out.push('\n');
        }
    }

    out
}

/// Same as [`encode`], surrounded by the start/end delimiters for embedding in a larger document.
pub fn encode_wrapped(sequence: &Sequence) -> String {
    format!(
        "{}\n{}{}\n",
        MIDI_START_DELIMITER,
        encode(sequence),
        MIDI_END_DELIMITER
    )
}

fn write_event(out: &mut String, event: &Event) {
    let _ = write!(out, "{}|tick={}", EVENT_TAG, event.tick);

    match &event.kind {
        EventKind::Channel(msg) => write_channel(out, msg),
        EventKind::Meta(meta) => write_meta(out, meta),
        EventKind::Sysex(sysex) => {
            let _ = write!(
                out,
                "|type={}|description={}",
                SYSEX_MESSAGE, SYSEX_DESCRIPTION
            );
            write_data(out, &sysex.payload);
        }
    }
}

fn write_channel(out: &mut String, msg: &ChannelMessage) {
    let _ = write!(
        out,
        "|type={}|command={}|channel={}|data1={}|data2={}",
        SHORT_MESSAGE, msg.command, msg.channel, msg.data1, msg.data2
    );

    match msg.command {
        NOTE_ON | NOTE_OFF => {
            let _ = write!(
                out,
                "|description={}|note={}|velocity={}",
                if msg.command == NOTE_ON { "NOTE_ON" } else { "NOTE_OFF" },
                msg.data1,
                msg.data2
            );
        }
        PROGRAM_CHANGE => {
            let _ = write!(out, "|description=PROGRAM_CHANGE|program={}", msg.data1);
        }
        _ => {}
    }
}

fn write_meta(out: &mut String, meta: &MetaEvent) {
    let _ = write!(out, "|type={}|metaType={}", META_MESSAGE, meta.meta_type);

    match semantic_fields(meta) {
        Some((kind, fields)) => {
            let _ = write!(out, "|description={}{}", kind.description(), fields);
        }
        None => write_data(out, &meta.payload),
    }
}

/// The description and semantic fields for a recognized meta event, or `None` when its payload
/// cannot be expressed that way and has to travel as raw data.
fn semantic_fields(meta: &MetaEvent) -> Option<(MetaKind, String)> {
    let kind = meta.kind()?;
    let payload = meta.payload.as_slice();

    let fields = match kind {
        MetaKind::Tempo => {
            let mpqn = meta.tempo_mpqn().filter(|&m| m > 0)?;
            let bpm = (MICROSECONDS_PER_MINUTE as f32) / mpqn as f32;
            format!("|bpm={:.2}|mpqn={}", bpm, mpqn)
        }
        MetaKind::TimeSignature => {
            let &[numerator, power, clocks, thirty_seconds] = payload else {
                return None;
            };
            let denominator = 1u32.checked_shl(power as u32)?;
            format!(
                "|numerator={}|denominator={}|clocksPerClick={}|thirtySecondsPerQuarter={}",
                numerator, denominator, clocks, thirty_seconds
            )
        }
        MetaKind::KeySignature => {
            let &[key, scale] = payload else {
                return None;
            };
            format!("|key={}|scale={}", key as i8, scale)
        }
        MetaKind::TrackName | MetaKind::InstrumentName => {
            // names that would break the line grammar or lose edge whitespace go out as raw data
            let name = std::str::from_utf8(payload).ok()?;
            if name.contains(['|', '\n', '\r']) || name.trim() != name {
                return None;
            }
            format!("|name={}", name)
        }
        MetaKind::EndOfTrack => String::new(),
    };

    Some((kind, fields))
}

fn write_data(out: &mut String, payload: &[u8]) {
    if !payload.is_empty() {
        let _ = write!(out, "|data={}", STANDARD.encode(payload));
    }
}
