use crate::model::sequence::Sequence;
use log::debug;

pub const DEFAULT_MPQN: u32 = 500_000;

#[derive(Debug, Clone)]
struct TempoSegment {
    start_tick: u64,
    mpqn: u32,
    us_at_start: f64,
}

/// Maps ticks to wall-clock microseconds for a sequence, honoring every tempo change in every track.
#[derive(Debug, Clone)]
pub struct TempoMap {
    resolution: f64,
    /// Fixed ticks-per-second for SMPTE sequences, where tempo events do not apply.
    smpte_ticks_per_second: Option<f64>,
    segments: Vec<TempoSegment>,
}

impl Default for TempoMap {
    /// 480 PPQ at the default tempo.
    fn default() -> Self {
        Self {
            resolution: 480.0,
            smpte_ticks_per_second: None,
            segments: Vec::new(),
        }
    }
}

impl TempoMap {
    pub fn new(sequence: &Sequence) -> Self {
        let resolution = sequence.resolution.max(1) as f64;

        if !sequence.is_ppq() {
            return Self {
                resolution,
                smpte_ticks_per_second: Some(sequence.division_type as f64 * resolution),
                segments: Vec::new(),
            };
        }

        let mut changes: Vec<(u64, u32)> = sequence
            .tracks
            .iter()
            .flat_map(|track| track.events.iter())
            .filter_map(|event| {
                let mpqn = event.as_meta()?.tempo_mpqn()?;
                Some((event.tick, mpqn))
            })
            .filter(|(_, mpqn)| *mpqn > 0)
            .collect();

        // default tempo (120bpm) until a tempo meta appears
        changes.insert(0, (0, DEFAULT_MPQN));
        changes.sort_by_key(|(tick, _)| *tick);

        let mut segments: Vec<TempoSegment> = Vec::with_capacity(changes.len());
        let mut last_tick = 0u64;
        let mut last_mpqn = DEFAULT_MPQN;
        let mut us_accum = 0.0f64;

        for (tick, mpqn) in changes.into_iter() {
            if tick > last_tick {
                us_accum += (tick - last_tick) as f64 * last_mpqn as f64 / resolution;
            }

            // a later change at the same tick wins
            if let Some(seg) = segments.last_mut()
                && seg.start_tick == tick
            {
                seg.mpqn = mpqn;
            } else {
                segments.push(TempoSegment {
                    start_tick: tick,
                    mpqn,
                    us_at_start: us_accum,
                });
            }

            last_tick = tick;
            last_mpqn = mpqn;
        }

        debug!("Built tempo map with {} segment(s)..!", segments.len());

        Self {
            resolution,
            smpte_ticks_per_second: None,
            segments,
        }
    }

    fn segment_for_tick(&self, tick: u64) -> Option<&TempoSegment> {
        self.segments
            .iter()
            .rfind(|seg| seg.start_tick <= tick)
            .or(self.segments.first())
    }

    pub fn tick_to_micros(&self, tick: u64) -> f64 {
        if let Some(tps) = self.smpte_ticks_per_second {
            return tick as f64 * 1_000_000.0 / tps;
        }

        match self.segment_for_tick(tick) {
            Some(seg) => {
                let delta_ticks = tick.saturating_sub(seg.start_tick) as f64;
                seg.us_at_start + delta_ticks * seg.mpqn as f64 / self.resolution
            }
            None => tick as f64 * DEFAULT_MPQN as f64 / self.resolution,
        }
    }

    pub fn micros_to_tick(&self, micros: f64) -> u64 {
        let micros = micros.max(0.0);

        if let Some(tps) = self.smpte_ticks_per_second {
            return (micros * tps / 1_000_000.0) as u64;
        }

        match self.segments.iter().rfind(|seg| seg.us_at_start <= micros) {
            Some(seg) => {
                let delta_us = micros - seg.us_at_start;
                seg.start_tick + (delta_us * self.resolution / seg.mpqn as f64) as u64
            }
            None => (micros * self.resolution / DEFAULT_MPQN as f64) as u64,
        }
    }
}
