use crate::error::{Error, Result};
use crate::model::event::*;
use crate::model::sequence::{PPQ, SMPTE_24, SMPTE_25, SMPTE_30, SMPTE_30DROP, Sequence, Track};
use log::{debug, info, warn};
use midly::num::{u4, u7, u14, u15, u24, u28};
use midly::{
    Format, Fps, Header, MetaMessage, MidiMessage, PitchBend, Smf, SmpteTime, Timing, TrackEvent,
    TrackEventKind,
};
use std::fs;
use std::path::Path;

const META_TRACK_NUMBER: u8 = 0x00;
const META_TEXT: u8 = 0x01;
const META_COPYRIGHT: u8 = 0x02;
const META_LYRIC: u8 = 0x05;
const META_MARKER: u8 = 0x06;
const META_CUE_POINT: u8 = 0x07;
const META_PROGRAM_NAME: u8 = 0x08;
const META_DEVICE_NAME: u8 = 0x09;
const META_MIDI_CHANNEL: u8 = 0x20;
const META_MIDI_PORT: u8 = 0x21;
const META_SMPTE_OFFSET: u8 = 0x54;
const META_SEQUENCER_SPECIFIC: u8 = 0x7F;

const MAX_DELTA_TICKS: u64 = (1 << 28) - 1;
const MAX_PPQ: u32 = 0x7FFF;

/// Reads a Standard MIDI File from disk.
pub fn read_sequence<P: AsRef<Path>>(path: P) -> Result<Sequence> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }

    let bytes = fs::read(path)?;
    let sequence = parse_sequence(&bytes)?;

    info!(
        "Loaded MIDI file '{}': {} track(s), {} ticks, {:.3} seconds..!",
        path.display(),
        sequence.tracks.len(),
        sequence.tick_length(),
        sequence.duration().as_secs_f64()
    );

    Ok(sequence)
}

pub fn parse_sequence(bytes: &[u8]) -> Result<Sequence> {
    let smf = Smf::parse(bytes)?;

    let (division_type, resolution) = match smf.header.timing {
        Timing::Metrical(t) => (PPQ, t.as_int() as u32),
        Timing::Timecode(fps, subframe) => (fps_division(fps), subframe as u32),
    };

    debug!(
        "MIDI format: {:?}, tracks: {}, division: {:?}, resolution: {}",
        smf.header.format,
        smf.tracks.len(),
        division_type,
        resolution
    );

    let mut sequence = Sequence::new(division_type, resolution)?;

    for track in smf.tracks.iter() {
        let mut abs_tick: u64 = 0;
        let mut events = Vec::with_capacity(track.len());

        for event in track.iter() {
            abs_tick = abs_tick.saturating_add(event.delta.as_int() as u64);

            let kind = match &event.kind {
                TrackEventKind::Midi { channel, message } => {
                    EventKind::Channel(channel_from_midly(channel.as_int(), message))
                }
                TrackEventKind::Meta(meta) => {
                    let (meta_type, payload) = meta_from_midly(meta);
                    EventKind::Meta(MetaEvent { meta_type, payload })
                }
                TrackEventKind::SysEx(data) => EventKind::Sysex(SysexEvent {
                    payload: data.to_vec(),
                }),
                TrackEventKind::Escape(data) => {
                    debug!("Keeping escape sequence at tick {} as SysEx..!", abs_tick);
                    EventKind::Sysex(SysexEvent {
                        payload: data.to_vec(),
                    })
                }
            };

            events.push(Event {
                tick: abs_tick,
                kind,
            });
        }

        // already in tick order, so no insertion sort needed
        sequence.tracks.push(Track { events });
    }

    Ok(sequence)
}

/// Writes `sequence` as a type 1 (parallel) Standard MIDI File.
pub fn write_sequence<P: AsRef<Path>>(sequence: &Sequence, path: P) -> Result<()> {
    let bytes = sequence_to_bytes(sequence)?;
    fs::write(path.as_ref(), bytes)?;

    info!(
        "Wrote MIDI file '{}' with {} track(s)..!",
        path.as_ref().display(),
        sequence.tracks.len()
    );

    Ok(())
}

pub fn sequence_to_bytes(sequence: &Sequence) -> Result<Vec<u8>> {
    let timing = timing_for(sequence)?;
    let mut smf = Smf::new(Header::new(Format::Parallel, timing));

    for (i, track) in sequence.tracks.iter().enumerate() {
        let mut out: Vec<TrackEvent> = Vec::with_capacity(track.len() + 1);
        let mut last_tick = 0u64;

        for event in track.events.iter() {
            let delta = event.tick.saturating_sub(last_tick);
            if delta > MAX_DELTA_TICKS {
                return Err(Error::Unsupported(format!(
                    "track {} has a gap of {} ticks, larger than a delta-time can hold",
                    i, delta
                )));
            }
            last_tick = last_tick.max(event.tick);

            let kind = match &event.kind {
                EventKind::Channel(msg) => TrackEventKind::Midi {
                    channel: u4::new(msg.channel),
                    message: channel_to_midly(msg),
                },
                EventKind::Meta(meta) => TrackEventKind::Meta(meta_to_midly(meta)),
                EventKind::Sysex(sysex) => TrackEventKind::SysEx(&sysex.payload),
            };

            out.push(TrackEvent {
                delta: u28::new(delta as u32),
                kind,
            });
        }

        if !track.events.last().is_some_and(Event::is_end_of_track) {
            debug!("Appending END_OF_TRACK to track {}..!", i);
            out.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            });
        }

        smf.tracks.push(out);
    }

    let mut bytes = Vec::new();
    smf.write_std(&mut bytes)?;
    Ok(bytes)
}

fn fps_division(fps: Fps) -> f32 {
    match fps {
        Fps::Fps24 => SMPTE_24,
        Fps::Fps25 => SMPTE_25,
        Fps::Fps29 => SMPTE_30DROP,
        Fps::Fps30 => SMPTE_30,
    }
}

fn timing_for(sequence: &Sequence) -> Result<Timing> {
    if sequence.is_ppq() {
        if sequence.resolution > MAX_PPQ {
            return Err(Error::Unsupported(format!(
                "resolution {} does not fit in a MIDI file header",
                sequence.resolution
            )));
        }
        return Ok(Timing::Metrical(u15::new(sequence.resolution as u16)));
    }

    let fps = match sequence.division_type {
        d if d == SMPTE_24 => Fps::Fps24,
        d if d == SMPTE_25 => Fps::Fps25,
        d if d == SMPTE_30DROP => Fps::Fps29,
        d if d == SMPTE_30 => Fps::Fps30,
        d => {
            return Err(Error::Unsupported(format!("divisionType {:?}", d)));
        }
    };

    let subframe = u8::try_from(sequence.resolution).map_err(|_| {
        Error::Unsupported(format!(
            "SMPTE resolution {} does not fit in a MIDI file header",
            sequence.resolution
        ))
    })?;

    Ok(Timing::Timecode(fps, subframe))
}

fn channel_from_midly(channel: u8, message: &MidiMessage) -> ChannelMessage {
    let (command, data1, data2) = match *message {
        MidiMessage::NoteOff { key, vel } => (NOTE_OFF, key.as_int(), vel.as_int()),
        MidiMessage::NoteOn { key, vel } => (NOTE_ON, key.as_int(), vel.as_int()),
        MidiMessage::Aftertouch { key, vel } => (POLY_PRESSURE, key.as_int(), vel.as_int()),
        MidiMessage::Controller { controller, value } => {
            (CONTROL_CHANGE, controller.as_int(), value.as_int())
        }
        MidiMessage::ProgramChange { program } => (PROGRAM_CHANGE, program.as_int(), 0),
        MidiMessage::ChannelAftertouch { vel } => (CHANNEL_PRESSURE, vel.as_int(), 0),
        MidiMessage::PitchBend { bend } => {
            let value = bend.0.as_int();
            (PITCH_BEND, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
        }
    };

    ChannelMessage::new(command, channel, data1, data2)
}

fn channel_to_midly(msg: &ChannelMessage) -> MidiMessage {
    let d1 = u7::new(msg.data1);
    let d2 = u7::new(msg.data2);

    match msg.command {
        NOTE_OFF => MidiMessage::NoteOff { key: d1, vel: d2 },
        NOTE_ON => MidiMessage::NoteOn { key: d1, vel: d2 },
        POLY_PRESSURE => MidiMessage::Aftertouch { key: d1, vel: d2 },
        CONTROL_CHANGE => MidiMessage::Controller {
            controller: d1,
            value: d2,
        },
        PROGRAM_CHANGE => MidiMessage::ProgramChange { program: d1 },
        CHANNEL_PRESSURE => MidiMessage::ChannelAftertouch { vel: d1 },
        _ => {
            let value = ((msg.data2 as u16) << 7) | msg.data1 as u16;
            MidiMessage::PitchBend {
                bend: PitchBend(u14::new(value)),
            }
        }
    }
}

fn meta_from_midly(meta: &MetaMessage) -> (u8, Vec<u8>) {
    match *meta {
        MetaMessage::TrackNumber(number) => (
            META_TRACK_NUMBER,
            number.map(|n| n.to_be_bytes().to_vec()).unwrap_or_default(),
        ),
        MetaMessage::Text(b) => (META_TEXT, b.to_vec()),
        MetaMessage::Copyright(b) => (META_COPYRIGHT, b.to_vec()),
        MetaMessage::TrackName(b) => (META_TRACK_NAME, b.to_vec()),
        MetaMessage::InstrumentName(b) => (META_INSTRUMENT_NAME, b.to_vec()),
        MetaMessage::Lyric(b) => (META_LYRIC, b.to_vec()),
        MetaMessage::Marker(b) => (META_MARKER, b.to_vec()),
        MetaMessage::CuePoint(b) => (META_CUE_POINT, b.to_vec()),
        MetaMessage::ProgramName(b) => (META_PROGRAM_NAME, b.to_vec()),
        MetaMessage::DeviceName(b) => (META_DEVICE_NAME, b.to_vec()),
        MetaMessage::MidiChannel(ch) => (META_MIDI_CHANNEL, vec![ch.as_int()]),
        MetaMessage::MidiPort(port) => (META_MIDI_PORT, vec![port.as_int()]),
        MetaMessage::EndOfTrack => (META_END_OF_TRACK, Vec::new()),
        MetaMessage::Tempo(mpqn) => (META_TEMPO, mpqn.as_int().to_be_bytes()[1..].to_vec()),
        MetaMessage::SmpteOffset(time) => {
            let rate = match time.fps() {
                Fps::Fps24 => 0u8,
                Fps::Fps25 => 1,
                Fps::Fps29 => 2,
                Fps::Fps30 => 3,
            };
            (
                META_SMPTE_OFFSET,
                vec![
                    (rate << 5) | time.hour(),
                    time.minute(),
                    time.second(),
                    time.frame(),
                    time.subframe(),
                ],
            )
        }
        MetaMessage::TimeSignature(num, den, clocks, thirty_seconds) => (
            META_TIME_SIGNATURE,
            vec![num, den, clocks, thirty_seconds],
        ),
        MetaMessage::KeySignature(key, minor) => (META_KEY_SIGNATURE, vec![key as u8, minor as u8]),
        MetaMessage::SequencerSpecific(b) => (META_SEQUENCER_SPECIFIC, b.to_vec()),
        MetaMessage::Unknown(meta_type, b) => (meta_type, b.to_vec()),
    }
}

/// Falls back to an untyped meta message whenever the payload does not fit the typed variant.
fn meta_to_midly(meta: &MetaEvent) -> MetaMessage<'_> {
    let payload = meta.payload.as_slice();

    match (meta.meta_type, payload) {
        (META_TRACK_NUMBER, &[]) => MetaMessage::TrackNumber(None),
        (META_TRACK_NUMBER, &[hi, lo]) => {
            MetaMessage::TrackNumber(Some(u16::from_be_bytes([hi, lo])))
        }
        (META_TEXT, b) => MetaMessage::Text(b),
        (META_COPYRIGHT, b) => MetaMessage::Copyright(b),
        (META_TRACK_NAME, b) => MetaMessage::TrackName(b),
        (META_INSTRUMENT_NAME, b) => MetaMessage::InstrumentName(b),
        (META_LYRIC, b) => MetaMessage::Lyric(b),
        (META_MARKER, b) => MetaMessage::Marker(b),
        (META_CUE_POINT, b) => MetaMessage::CuePoint(b),
        (META_PROGRAM_NAME, b) => MetaMessage::ProgramName(b),
        (META_DEVICE_NAME, b) => MetaMessage::DeviceName(b),
        (META_MIDI_CHANNEL, &[ch]) if ch < 16 => MetaMessage::MidiChannel(u4::new(ch)),
        (META_MIDI_PORT, &[port]) if port < 128 => MetaMessage::MidiPort(u7::new(port)),
        (META_END_OF_TRACK, &[]) => MetaMessage::EndOfTrack,
        (META_TEMPO, &[a, b, c]) => {
            MetaMessage::Tempo(u24::new(u32::from_be_bytes([0, a, b, c])))
        }
        (META_SMPTE_OFFSET, &[hr, min, sec, frame, subframe]) => {
            let fps = match hr >> 5 {
                0 => Fps::Fps24,
                1 => Fps::Fps25,
                2 => Fps::Fps29,
                _ => Fps::Fps30,
            };
            match SmpteTime::new(hr & 0x1F, min, sec, frame, subframe, fps) {
                Some(time) => MetaMessage::SmpteOffset(time),
                None => {
                    warn!("Invalid SMPTE offset payload, writing it untyped..!");
                    MetaMessage::Unknown(META_SMPTE_OFFSET, payload)
                }
            }
        }
        (META_TIME_SIGNATURE, &[num, den, clocks, thirty_seconds]) => {
            MetaMessage::TimeSignature(num, den, clocks, thirty_seconds)
        }
        (META_KEY_SIGNATURE, &[key, scale]) => MetaMessage::KeySignature(key as i8, scale != 0),
        (META_SEQUENCER_SPECIFIC, b) => MetaMessage::SequencerSpecific(b),
        (meta_type, b) => MetaMessage::Unknown(meta_type, b),
    }
}
