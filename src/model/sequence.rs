use crate::error::{Error, Result};
use crate::model::event::{Event, EventKind, META_TRACK_NAME, NOTE_ON};
use crate::model::tempo::TempoMap;
use crate::util::note_name;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

/// Division type for tempo-based timing, where `resolution` is ticks per quarter note.
pub const PPQ: f32 = 0.0;
pub const SMPTE_24: f32 = 24.0;
pub const SMPTE_25: f32 = 25.0;
pub const SMPTE_30DROP: f32 = 29.97;
pub const SMPTE_30: f32 = 30.0;

const DIVISION_TYPES: [f32; 5] = [PPQ, SMPTE_24, SMPTE_25, SMPTE_30DROP, SMPTE_30];

/// An ordered list of events, kept in non-decreasing tick order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Track {
    pub events: Vec<Event>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts after every event with a tick less than or equal to `event.tick`, so ties keep insertion order.
    pub fn push(&mut self, event: Event) {
        let idx = self.events.partition_point(|e| e.tick <= event.tick);
        self.events.insert(idx, event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_tick(&self) -> u64 {
        self.events.last().map(|e| e.tick).unwrap_or(0)
    }

    pub fn name(&self) -> Option<String> {
        self.events
            .iter()
            .filter_map(Event::as_meta)
            .find(|meta| meta.meta_type == META_TRACK_NAME)
            .map(|meta| String::from_utf8_lossy(&meta.payload).into_owned())
    }

    pub fn note_on_count(&self) -> usize {
        self.events
            .iter()
            .filter_map(Event::as_channel)
            .filter(|msg| msg.is_note_on())
            .count()
    }
}

impl FromIterator<Event> for Track {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        let mut track = Track::new();
        for event in iter {
            track.push(event);
        }
        track
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sequence {
    pub division_type: f32,
    pub resolution: u32,
    pub tracks: Vec<Track>,
}

impl Sequence {
    pub fn new(division_type: f32, resolution: u32) -> Result<Self> {
        if resolution == 0 {
            return Err(Error::Format("resolution must be greater than 0".into()));
        }

        if !DIVISION_TYPES.contains(&division_type) {
            return Err(Error::Format(format!(
                "unsupported divisionType {:?}",
                division_type
            )));
        }

        Ok(Self {
            division_type,
            resolution,
            tracks: Vec::new(),
        })
    }

    pub fn is_ppq(&self) -> bool {
        self.division_type == PPQ
    }

    /// The tick of the last event across all tracks.
    pub fn tick_length(&self) -> u64 {
        self.tracks.iter().map(Track::last_tick).max().unwrap_or(0)
    }

    pub fn tempo_map(&self) -> TempoMap {
        TempoMap::new(self)
    }

    pub fn duration(&self) -> Duration {
        let micros = self.tempo_map().tick_to_micros(self.tick_length());
        Duration::from_secs_f64(micros / 1_000_000.0)
    }

    pub fn event_count(&self) -> usize {
        self.tracks.iter().map(Track::len).sum()
    }

    /// A one-track sequence at 480 PPQ: program change, then a single note held for `duration_ticks`.
    pub fn single_note(note: u8, velocity: u8, duration_ticks: u64) -> Self {
        let track: Track = [
            Event::program_change(0, 0, 0),
            Event::note_on(0, 0, note, velocity),
            Event::note_off(duration_ticks, 0, note, 0),
        ]
        .into_iter()
        .collect();

        Self {
            division_type: PPQ,
            resolution: 480,
            tracks: vec![track],
        }
    }

    /// Human-readable report: timing, length, and per-track name and note counts.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Division Type: {:?}", self.division_type);
        let _ = writeln!(
            out,
            "Resolution: {} ticks per {}",
            self.resolution,
            if self.is_ppq() { "beat" } else { "frame" }
        );
        let _ = writeln!(out, "Length: {} ticks", self.tick_length());
        let _ = writeln!(out, "Duration: {:.3} seconds", self.duration().as_secs_f64());
        let _ = writeln!(out, "Tracks: {}", self.tracks.len());

        for (i, track) in self.tracks.iter().enumerate() {
            let _ = writeln!(out, "Track {}: {} events", i, track.len());
            if let Some(name) = track.name() {
                let _ = writeln!(out, "  Name: {}", name);
            }
            let _ = writeln!(out, "  Note events: {}", track.note_on_count());

            let range = track
                .events
                .iter()
                .filter_map(|e| match &e.kind {
                    EventKind::Channel(msg) if msg.command == NOTE_ON => Some(msg.data1),
                    _ => None,
                })
                .fold(None, |acc: Option<(u8, u8)>, n| match acc {
                    Some((lo, hi)) => Some((lo.min(n), hi.max(n))),
                    None => Some((n, n)),
                });

            if let Some((lo, hi)) = range {
                let _ = writeln!(out, "  Range: {} - {}", note_name(lo), note_name(hi));
            }
        }

        out
    }
}
