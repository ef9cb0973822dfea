use crate::engine::{EndOfTrackCallback, MidiSink, Sequencer};
use crate::error::{Error, Result};
use crate::model::event::EventKind;
use crate::model::sequence::Sequence;
use crate::model::tempo::TempoMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

const MAX_SLEEP_CHUNK_S: f64 = 0.010;

enum ControlMsg {
    Stop,
}

#[derive(Debug, Clone)]
struct ScheduledEvent {
    tick: u64,
    message: Vec<u8>,
}

/// Playback position shared with the worker. A worker only writes while `generation` still
/// matches the one it was started with, so a stopped worker can never move the cursor.
#[derive(Debug, Default)]
struct Cursor {
    generation: u64,
    tick: u64,
    running: bool,
}

/// Everything a worker needs, snapshotted at start so a later `set_sequence` cannot race it.
struct Playback {
    schedule: Arc<Vec<ScheduledEvent>>,
    tempo: Arc<TempoMap>,
    end_tick: u64,
}

/// A [`Sequencer`] that plays on a dedicated thread, pacing events off the sequence's tempo map
/// and writing raw bytes to a [`MidiSink`].
pub struct ThreadSequencer<K: MidiSink> {
    sink: Arc<Mutex<K>>,
    schedule: Arc<Vec<ScheduledEvent>>,
    tempo: Arc<TempoMap>,
    end_tick: u64,
    cursor: Arc<Mutex<Cursor>>,
    control_tx: Option<Sender<ControlMsg>>,
    on_end: Option<EndOfTrackCallback>,
    opened: bool,
    #[cfg(test)]
    refuse_spawn: bool,
}

impl<K: MidiSink> ThreadSequencer<K> {
    pub fn new(sink: K) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            schedule: Arc::new(Vec::new()),
            tempo: Arc::new(TempoMap::default()),
            end_tick: 0,
            cursor: Arc::new(Mutex::new(Cursor::default())),
            control_tx: None,
            on_end: None,
            opened: false,
            #[cfg(test)]
            refuse_spawn: false,
        }
    }

    /// Shared handle to the sink, e.g. to inspect what was sent.
    pub fn sink(&self) -> Arc<Mutex<K>> {
        Arc::clone(&self.sink)
    }

    fn halt(&mut self) {
        let was_running = {
            let mut cursor = self.cursor.lock();
            cursor.generation += 1;
            std::mem::replace(&mut cursor.running, false)
        };

        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(ControlMsg::Stop);
        }

        if was_running && let Err(why) = self.sink.lock().all_notes_off() {
            warn!("Failed to silence output: {}..!", why);
        }
    }

    fn spawn_worker(&mut self) -> Result<()> {
        #[cfg(test)]
        if self.refuse_spawn {
            return Err(Error::Io(std::io::Error::other("thread spawn refused")));
        }

        let (generation, from_tick) = {
            let mut cursor = self.cursor.lock();
            cursor.generation += 1;
            cursor.running = true;
            (cursor.generation, cursor.tick)
        };

        let (tx, rx) = mpsc::channel::<ControlMsg>();
        let playback = Playback {
            schedule: Arc::clone(&self.schedule),
            tempo: Arc::clone(&self.tempo),
            end_tick: self.end_tick,
        };
        let sink = Arc::clone(&self.sink);
        let cursor = Arc::clone(&self.cursor);
        let on_end = self.on_end.clone();

        let spawned = thread::Builder::new()
            .name("sequencer".into())
            .spawn(move || {
                run_worker(playback, sink, cursor, on_end, rx, generation, from_tick)
            });

        match spawned {
            Ok(_) => {
                self.control_tx = Some(tx);
                Ok(())
            }
            Err(why) => {
                self.cursor.lock().running = false;
                Err(Error::Io(why))
            }
        }
    }
}

impl<K: MidiSink> Sequencer for ThreadSequencer<K> {
    fn open(&mut self) -> Result<()> {
        if !self.opened {
            self.sink.lock().open()?;
            self.opened = true;
            debug!("Sequencer opened..!");
        }
        Ok(())
    }

    fn set_sequence(&mut self, sequence: Arc<Sequence>) -> Result<()> {
        let schedule = Arc::new(build_schedule(&sequence));
        let tempo = Arc::new(sequence.tempo_map());
        let end_tick = sequence.tick_length();

        let was_running = self.is_running();
        self.halt();

        let previous_schedule = std::mem::replace(&mut self.schedule, schedule);
        let previous_tempo = std::mem::replace(&mut self.tempo, tempo);
        let previous_end = std::mem::replace(&mut self.end_tick, end_tick);
        let previous_tick = std::mem::replace(&mut self.cursor.lock().tick, 0);

        debug!(
            "Sequencer loaded {} scheduled events over {} ticks..!",
            self.schedule.len(),
            self.end_tick
        );

        if !was_running {
            return Ok(());
        }

        // a failed restart must not leave the new sequence half installed
        if let Err(why) = self.spawn_worker() {
            warn!("Could not restart playback, keeping the previous sequence..!");
            self.schedule = previous_schedule;
            self.tempo = previous_tempo;
            self.end_tick = previous_end;
            self.cursor.lock().tick = previous_tick;

            if let Err(resume) = self.spawn_worker() {
                warn!("Failed to resume the previous sequence: {}..!", resume);
            }
            return Err(why);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.opened {
            return Err(Error::TransportUnavailable("sequencer is not open".into()));
        }
        if self.is_running() {
            return Ok(());
        }
        self.spawn_worker()
    }

    fn stop(&mut self) {
        self.halt();
    }

    fn set_tick_position(&mut self, tick: u64) -> Result<()> {
        let tick = tick.min(self.end_tick);
        if self.is_running() {
            self.halt();
            self.cursor.lock().tick = tick;
            self.spawn_worker()
        } else {
            self.cursor.lock().tick = tick;
            Ok(())
        }
    }

    fn tick_position(&self) -> u64 {
        self.cursor.lock().tick
    }

    fn is_running(&self) -> bool {
        self.cursor.lock().running
    }

    fn set_end_of_track_callback(&mut self, callback: EndOfTrackCallback) {
        self.on_end = Some(callback);
    }
}

impl<K: MidiSink> Drop for ThreadSequencer<K> {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Channel and SysEx messages of every track in one tick-ordered list. Meta events never
/// reach the wire.
fn build_schedule(sequence: &Sequence) -> Vec<ScheduledEvent> {
    let mut schedule: Vec<ScheduledEvent> = Vec::new();
    for track in sequence.tracks.iter() {
        for event in track.events.iter() {
            let message = match &event.kind {
                EventKind::Channel(msg) => msg.to_bytes(),
                EventKind::Sysex(sysex) => {
                    let mut bytes = Vec::with_capacity(sysex.payload.len() + 2);
                    bytes.push(0xF0);
                    bytes.extend_from_slice(&sysex.payload);
                    if bytes.last() != Some(&0xF7) {
                        bytes.push(0xF7);
                    }
                    bytes
                }
                EventKind::Meta(_) => continue,
            };
            schedule.push(ScheduledEvent {
                tick: event.tick,
                message,
            });
        }
    }

    // stable, so same-tick events keep track order
    schedule.sort_by_key(|e| e.tick);
    schedule
}

fn run_worker<K: MidiSink>(
    playback: Playback,
    sink: Arc<Mutex<K>>,
    cursor: Arc<Mutex<Cursor>>,
    on_end: Option<EndOfTrackCallback>,
    ctrl_rx: Receiver<ControlMsg>,
    generation: u64,
    from_tick: u64,
) {
    let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
    let tempo = &playback.tempo;

    // wall clock is anchored so that `from_tick` lands at `start`
    let start = Instant::now();
    let origin_us = tempo.tick_to_micros(from_tick);
    let first = playback.schedule.partition_point(|e| e.tick < from_tick);

    let advance = |tick: u64| -> bool {
        let mut cursor = cursor.lock();
        if cursor.generation != generation {
            return false;
        }
        cursor.tick = tick;
        true
    };

    debug!("Playback worker {} started at tick {}..!", generation, from_tick);

    let targets = playback.schedule[first..]
        .iter()
        .map(|e| (e.tick, Some(e)))
        .chain(std::iter::once((playback.end_tick, None)));

    for (tick, event) in targets {
        let target_us = (tempo.tick_to_micros(tick) - origin_us).max(0.0);

        loop {
            if ctrl_rx.try_recv().is_ok() {
                debug!("Playback worker {} stopped via control message..!", generation);
                return;
            }

            let elapsed_us = start.elapsed().as_secs_f64() * 1_000_000.0;
            if elapsed_us >= target_us {
                break;
            }

            let now_tick = tempo.micros_to_tick(origin_us + elapsed_us).min(tick);
            if !advance(now_tick) {
                return;
            }

            let remaining = (target_us - elapsed_us) / 1_000_000.0;
            sleeper.sleep(Duration::from_secs_f64(remaining.min(MAX_SLEEP_CHUNK_S)));
        }

        if !advance(tick) {
            return;
        }

        if let Some(event) = event {
            let mut sink = sink.lock();
            // re-checked under the sink lock so nothing is emitted after a stop silenced the output
            if cursor.lock().generation != generation {
                return;
            }
            if let Err(why) = sink.send(&event.message) {
                warn!("Failed to send {:02X?} at tick {}: {}..!", event.message, tick, why);
            }
        }
    }

    {
        let mut cursor = cursor.lock();
        if cursor.generation != generation {
            return;
        }
        cursor.running = false;
        cursor.tick = playback.end_tick;
    }

    info!("Playback reached end of sequence..!");
    if let Some(on_end) = on_end {
        on_end();
    }
}
