use super::*;
use crate::error::{Error, Result};
use crate::model::event::{ChannelMessage, Event, MICROSECONDS_PER_MINUTE, MetaKind};
use crate::model::sequence::{Sequence, Track};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, warn};
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::FromStr;

/// Parses the text format back into a [`Sequence`].
///
/// A strict decoder (the default) rejects text whose `TRACKS|count`, `TRACK|number` or
/// `TRACK|events` claims disagree with the lines that follow. A lenient decoder logs those
/// mismatches and keeps going, which suits text that has been rewritten by a language model.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    strict: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::strict()
    }
}

/// Decodes with a strict [`Decoder`].
pub fn decode(text: &str) -> Result<Sequence> {
    Decoder::strict().decode(text)
}

/// Returns the payload between the start/end delimiters, or the whole text when there are none.
pub fn strip_delimiters(text: &str) -> &str {
    let Some(start) = text.find(MIDI_START_DELIMITER) else {
        return text;
    };

    let body = &text[start + MIDI_START_DELIMITER.len()..];
    match body.find(MIDI_END_DELIMITER) {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// One `|`-separated record: its tag and `key=value` fields. Later duplicates win.
struct Record<'a> {
    line: usize,
    tag: &'a str,
    fields: HashMap<&'a str, &'a str>,
}

impl<'a> Record<'a> {
    fn parse(line: usize, text: &'a str) -> Self {
        let mut parts = text.split('|');
        let tag = parts.next().unwrap_or_default().trim();

        let fields = parts
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                (!key.is_empty()).then_some((key.trim(), value))
            })
            .collect();

        Self { line, tag, fields }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.fields.get(key).copied()
    }

    /// A field every event of this type needs; missing or unparsable is a decode error.
    fn required<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self
            .get(key)
            .ok_or_else(|| Error::decode(self.line, format!("missing field '{}'", key)))?;

        raw.trim().parse::<T>().map_err(|_| {
            Error::decode(
                self.line,
                format!("field '{}' has invalid value '{}'", key, raw),
            )
        })
    }

    fn optional<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(_) => self.required(key).map(Some),
            None => Ok(None),
        }
    }

    /// Structural fields (header, tracks) fail the whole payload rather than a single line.
    fn structural<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.optional(key).map_err(|_| {
            Error::Format(format!(
                "line {}: {} field '{}' is not valid",
                self.line, self.tag, key
            ))
        })
    }

    fn data(&self) -> Result<Vec<u8>> {
        match self.get("data") {
            Some(raw) => STANDARD.decode(raw.trim()).map_err(|e| {
                Error::decode(self.line, format!("field 'data' is not base64: {}", e))
            }),
            None => Ok(Vec::new()),
        }
    }
}

impl Decoder {
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn lenient() -> Self {
        Self { strict: false }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn decode(&self, text: &str) -> Result<Sequence> {
        let payload = strip_delimiters(text);

        let mut records = payload
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty())
            .map(|(i, line)| Record::parse(i, line))
            .peekable();

        let mut sequence = match records.next() {
            Some(header) if header.tag == HEADER_TAG => {
                let division_type: f32 = header.structural("divisionType")?.ok_or_else(|| {
                    Error::Format("header is missing divisionType".into())
                })?;
                let resolution: u32 = header
                    .structural("resolution")?
                    .ok_or_else(|| Error::Format("header is missing resolution".into()))?;

                Sequence::new(division_type, resolution)?
            }
            _ => return Err(Error::Format("missing MIDI_HEADER line".into())),
        };

        let (claimed_tracks, tracks_line): (usize, usize) = match records.next() {
            Some(tracks) if tracks.tag == TRACKS_TAG => (
                tracks
                    .structural("count")?
                    .ok_or_else(|| Error::Format("TRACKS line is missing count".into()))?,
                tracks.line,
            ),
            _ => return Err(Error::Format("missing TRACKS line".into())),
        };

        while let Some(record) = records.next() {
            match record.tag {
                TRACK_TAG => {
                    let track = self.decode_track(&record, sequence.tracks.len(), &mut records)?;
                    sequence.tracks.push(track);
                }
                EVENT_TAG => {
                    return Err(Error::Format(format!(
                        "line {}: EVENT outside of a TRACK",
                        record.line
                    )));
                }
                other => {
                    if self.strict {
                        return Err(Error::Format(format!(
                            "line {}: unexpected '{}' record",
                            record.line, other
                        )));
                    }
                    warn!(
                        "Stopping at unexpected '{}' record on line {}..!",
                        other, record.line
                    );
                    break;
                }
            }
        }

        self.check_claim(
            "TRACKS count",
            claimed_tracks,
            sequence.tracks.len(),
            tracks_line,
        )?;

        debug!(
            "Decoded {} track(s) with {} events at resolution {}..!",
            sequence.tracks.len(),
            sequence.event_count(),
            sequence.resolution
        );

        Ok(sequence)
    }

    fn decode_track<'a, I>(
        &self,
        record: &Record<'a>,
        index: usize,
        records: &mut Peekable<I>,
    ) -> Result<Track>
    where
        I: Iterator<Item = Record<'a>>,
    {
        if let Some(number) = record.structural::<usize>("number")? {
            self.check_claim("TRACK number", number, index, record.line)?;
        }
        let claimed_events = record.structural::<usize>("events")?;

        let mut track = Track::new();
        while let Some(event) = records.next_if(|r| r.tag == EVENT_TAG) {
            track.push(decode_event(&event)?);
        }

        if let Some(claimed) = claimed_events {
            self.check_claim("TRACK events", claimed, track.len(), record.line)?;
        }

        Ok(track)
    }

    fn check_claim(&self, what: &str, claimed: usize, actual: usize, line: usize) -> Result<()> {
        if claimed == actual {
            return Ok(());
        }

        if self.strict {
            return Err(Error::Format(format!(
                "line {}: {} claims {} but found {}",
                line, what, claimed, actual
            )));
        }

        warn!(
            "Line {}: {} claims {} but found {}, continuing anyway..!",
            line, what, claimed, actual
        );
        Ok(())
    }
}

fn decode_event(record: &Record) -> Result<Event> {
    let tick: u64 = record.required("tick")?;
    let kind: String = record.required("type")?;

    match kind.as_str() {
        SHORT_MESSAGE => {
            let command: u8 = record.required("command")?;
            let channel: u8 = record.required("channel")?;
            let data1: u8 = record.required("data1")?;
            let data2: u8 = record.required("data2")?;

            if !ChannelMessage::is_channel_command(command) {
                return Err(Error::decode(
                    record.line,
                    format!("command {} is not a channel message", command),
                ));
            }
            if channel > 0x0F {
                return Err(Error::decode(
                    record.line,
                    format!("channel {} is out of range", channel),
                ));
            }

            let msg = ChannelMessage::new(command, channel, data1, data2);
            let data2_used = msg.to_bytes().len() == 3;
            if data1 > 0x7F || (data2_used && data2 > 0x7F) {
                return Err(Error::decode(record.line, "data bytes must be below 128"));
            }

            Ok(Event::channel(tick, command, channel, data1, data2))
        }
        META_MESSAGE => {
            let meta_type: u8 = record.required("metaType")?;

            // the description decides how the payload is rebuilt, whatever the raw type says
            let payload = match record.get("description").and_then(MetaKind::from_description) {
                Some(kind) => meta_payload(record, kind)?,
                None => record.data()?,
            };

            Ok(Event::meta(tick, meta_type, payload))
        }
        SYSEX_MESSAGE => Ok(Event::sysex(tick, record.data()?)),
        other => Err(Error::decode(
            record.line,
            format!("unknown event type '{}'", other),
        )),
    }
}

fn meta_payload(record: &Record, kind: MetaKind) -> Result<Vec<u8>> {
    let payload = match kind {
        MetaKind::Tempo => {
            // exact mpqn when present, bpm is only a fallback for hand-edited text
            let mpqn = match record.optional::<u32>("mpqn")? {
                Some(mpqn) => mpqn,
                None => {
                    let bpm: f64 = record.required("bpm")?;
                    if !(bpm > 0.0) {
                        return Err(Error::decode(record.line, "bpm must be positive"));
                    }
                    (MICROSECONDS_PER_MINUTE / bpm).round() as u32
                }
            };
            if mpqn == 0 || mpqn > 0xFF_FFFF {
                return Err(Error::decode(
                    record.line,
                    format!("mpqn {} does not fit a tempo event", mpqn),
                ));
            }

            mpqn.to_be_bytes()[1..].to_vec()
        }
        MetaKind::TimeSignature => {
            let numerator: u8 = record.required("numerator")?;
            let denominator: u32 = record.required("denominator")?;
            let clocks = record
                .optional("clocksPerClick")?
                .unwrap_or(DEFAULT_CLOCKS_PER_CLICK);
            let thirty_seconds = record
                .optional("thirtySecondsPerQuarter")?
                .unwrap_or(DEFAULT_32NDS_PER_QUARTER);

            let mut power = 0u8;
            while power < 31 && (1u32 << power) < denominator {
                power += 1;
            }

            vec![numerator, power, clocks, thirty_seconds]
        }
        MetaKind::KeySignature => {
            let key: i8 = record.required("key")?;
            let scale: u8 = record.required("scale")?;
            vec![key as u8, scale]
        }
        MetaKind::TrackName | MetaKind::InstrumentName => {
            let name = record
                .get("name")
                .ok_or_else(|| Error::decode(record.line, "missing field 'name'"))?;
            name.as_bytes().to_vec()
        }
        MetaKind::EndOfTrack => Vec::new(),
    };

    Ok(payload)
}
