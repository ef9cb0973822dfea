use crate::codec;
use crate::engine::Sequencer;
use crate::error::{Error, Result};
use crate::midi_file::read_sequence;
use crate::model::sequence::Sequence;
use crate::model::tempo::TempoMap;
use crate::session::Identity;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// How often `PositionChanged` is broadcast while playing.
pub const POSITION_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// Notifications broadcast to every subscriber. Sent from whichever thread caused them, so
/// receivers should not assume a particular one.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Started {
        identity: Identity,
    },
    Paused {
        identity: Identity,
    },
    Stopped {
        identity: Option<Identity>,
    },
    Finished {
        identity: Identity,
    },
    PositionChanged {
        identity: Identity,
        position_ticks: u64,
        total_ticks: u64,
    },
}

struct Inner<S: Sequencer> {
    sequencer: S,
    state: TransportState,
    identity: Option<Identity>,
    sequence: Option<Arc<Sequence>>,
    total_ticks: u64,
    /// Dropping this ends the position broadcast thread.
    ticker: Option<Sender<()>>,
}

struct Shared<S: Sequencer> {
    inner: Mutex<Inner<S>>,
    listeners: Mutex<Vec<Sender<TransportEvent>>>,
    just_finished: AtomicBool,
}

/// The one playback state machine of the process, wrapped around a host [`Sequencer`].
///
/// Cloning gives another handle to the same transport. All operations are serialized on an
/// internal lock; listener notification happens under that lock so subscribers see transitions
/// in order.
pub struct Transport<S: Sequencer> {
    shared: Arc<Shared<S>>,
}

impl<S: Sequencer> Clone for Transport<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Sequencer> Transport<S> {
    /// Opens the sequencer and takes ownership of it. Fails with `TransportUnavailable` when the
    /// host facility cannot be acquired.
    pub fn new(mut sequencer: S) -> Result<Self> {
        sequencer.open()?;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<S>>| {
            let weak = weak.clone();
            sequencer.set_end_of_track_callback(Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    handle_finished(&shared);
                }
            }));

            Shared {
                inner: Mutex::new(Inner {
                    sequencer,
                    state: TransportState::Stopped,
                    identity: None,
                    sequence: None,
                    total_ticks: 0,
                    ticker: None,
                }),
                listeners: Mutex::new(Vec::new()),
                just_finished: AtomicBool::new(false),
            }
        });

        debug!("Transport ready..!");
        Ok(Self { shared })
    }

    /// Registers a new listener. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> Receiver<TransportEvent> {
        let (tx, rx) = channel::unbounded();
        self.shared.listeners.lock().push(tx);
        rx
    }

    /// Loads `sequence` under `identity`. Returns `false` without touching anything when that
    /// identity is already loaded, so the current position survives.
    pub fn load(&self, identity: Identity, sequence: Sequence) -> Result<bool> {
        let mut inner = self.shared.inner.lock();

        if inner.identity.as_ref() == Some(&identity) {
            debug!("'{}' is already loaded, keeping position..!", identity);
            return Ok(false);
        }

        let sequence = Arc::new(sequence);
        // rewinds to tick 0; on failure the sequencer keeps what it had
        inner.sequencer.set_sequence(Arc::clone(&sequence))?;

        inner.total_ticks = sequence.tick_length();
        inner.sequence = Some(sequence);
        info!(
            "Loaded '{}' ({} ticks)..!",
            identity, inner.total_ticks
        );
        inner.identity = Some(identity);

        Ok(true)
    }

    /// Loads a MIDI file unless that path is already loaded.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<bool> {
        let identity = Identity::File(path.as_ref().to_path_buf());
        if self.is_loaded(&identity) {
            return Ok(false);
        }

        let sequence = read_sequence(path)?;
        self.load(identity, sequence)
    }

    /// Decodes `text` and loads it as session `session_id`, unless that session is already
    /// loaded. A decoding failure leaves the transport untouched.
    pub fn load_text(&self, session_id: &str, text: &str) -> Result<bool> {
        let identity = Identity::Session(session_id.to_string());
        if self.is_loaded(&identity) {
            return Ok(false);
        }

        let sequence = codec::decode(text)?;
        self.load(identity, sequence)
    }

    /// Starts or resumes when stopped or paused, pauses when playing. Returns whether the
    /// transport is now playing.
    pub fn play_pause(&self) -> Result<bool> {
        let mut inner = self.shared.inner.lock();

        let Some(identity) = inner.identity.clone() else {
            return Err(Error::NothingLoaded);
        };

        match inner.state {
            TransportState::Playing => {
                inner.sequencer.stop();
                inner.state = TransportState::Paused;
                inner.ticker = None;
                self.shared.just_finished.store(false, Ordering::SeqCst);

                info!("Paused '{}'..!", identity);
                self.shared.emit(TransportEvent::Paused { identity });
                Ok(false)
            }
            TransportState::Stopped | TransportState::Paused => {
                let ticker = spawn_ticker(Arc::downgrade(&self.shared))?;
                inner.sequencer.start()?;
                inner.state = TransportState::Playing;
                inner.ticker = Some(ticker);
                self.shared.just_finished.store(false, Ordering::SeqCst);

                info!(
                    "Playing '{}' from tick {}..!",
                    identity,
                    inner.sequencer.tick_position()
                );
                self.shared.emit(TransportEvent::Started { identity });
                Ok(true)
            }
        }
    }

    /// Stops and rewinds. The sequence stays loaded.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();

        inner.sequencer.stop();
        inner.sequencer.set_tick_position(0)?;
        inner.state = TransportState::Stopped;
        inner.ticker = None;
        self.shared.just_finished.store(false, Ordering::SeqCst);

        info!("Stopped..!");
        let identity = inner.identity.clone();
        self.shared.emit(TransportEvent::Stopped { identity });
        Ok(())
    }

    /// Moves to `fraction` of the loaded sequence, clamped to `[0, 1]`. Valid in any state.
    pub fn seek(&self, fraction: f64) -> Result<()> {
        let mut inner = self.shared.inner.lock();

        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let tick = (fraction * inner.total_ticks as f64).round() as u64;

        debug!("Seeking to tick {} of {}..!", tick, inner.total_ticks);
        inner.sequencer.set_tick_position(tick)
    }

    /// Position as a fraction of the loaded sequence; 0.0 when nothing or an empty sequence is loaded.
    pub fn position(&self) -> f64 {
        let inner = self.shared.inner.lock();
        if inner.total_ticks == 0 {
            return 0.0;
        }
        inner.sequencer.tick_position() as f64 / inner.total_ticks as f64
    }

    pub fn position_ticks(&self) -> u64 {
        self.shared.inner.lock().sequencer.tick_position()
    }

    pub fn total_ticks(&self) -> u64 {
        self.shared.inner.lock().total_ticks
    }

    /// Wall-clock length of the loaded sequence.
    pub fn duration(&self) -> Duration {
        let inner = self.shared.inner.lock();
        match &inner.sequence {
            Some(sequence) => {
                let micros = TempoMap::new(sequence).tick_to_micros(inner.total_ticks);
                Duration::from_secs_f64(micros / 1_000_000.0)
            }
            None => Duration::ZERO,
        }
    }

    pub fn state(&self) -> TransportState {
        self.shared.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    pub fn loaded_identity(&self) -> Option<Identity> {
        self.shared.inner.lock().identity.clone()
    }

    pub fn is_loaded(&self, identity: &Identity) -> bool {
        self.shared.inner.lock().identity.as_ref() == Some(identity)
    }

    /// True once after playback ran to the end on its own, false on every later call.
    pub fn take_just_finished(&self) -> bool {
        self.shared.just_finished.swap(false, Ordering::SeqCst)
    }
}

impl<S: Sequencer> Shared<S> {
    fn emit(&self, event: TransportEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

fn handle_finished<S: Sequencer>(shared: &Shared<S>) {
    let mut inner = shared.inner.lock();

    // stale notification from a run that was already paused, stopped or restarted
    if inner.state != TransportState::Playing || inner.sequencer.is_running() {
        debug!("Ignoring end of track outside of playback..!");
        return;
    }

    let Some(identity) = inner.identity.clone() else {
        return;
    };

    inner.state = TransportState::Stopped;
    inner.ticker = None;
    if let Err(why) = inner.sequencer.set_tick_position(0) {
        warn!("Failed to rewind after playback finished: {}..!", why);
    }
    shared.just_finished.store(true, Ordering::SeqCst);

    info!("Finished playing '{}'..!", identity);
    shared.emit(TransportEvent::Finished { identity });
}

/// Broadcasts the position every [`POSITION_INTERVAL`] until the returned sender is dropped.
fn spawn_ticker<S: Sequencer>(shared: Weak<Shared<S>>) -> Result<Sender<()>> {
    let (stop_tx, stop_rx) = channel::bounded::<()>(0);
    let ticks = channel::tick(POSITION_INTERVAL);

    thread::Builder::new()
        .name("transport-position".into())
        .spawn(move || {
            loop {
                let stopped = channel::select! {
                    recv(stop_rx) -> _ => true,
                    recv(ticks) -> _ => false,
                };

                if stopped || !broadcast_position(&shared, &stop_rx) {
                    break;
                }
            }
            debug!("Position broadcast ended..!");
        })?;

    Ok(stop_tx)
}

/// Returns false once the broadcast should end.
fn broadcast_position<S: Sequencer>(shared: &Weak<Shared<S>>, stop_rx: &Receiver<()>) -> bool {
    let Some(shared) = shared.upgrade() else {
        return false;
    };
    let inner = shared.inner.lock();

    // the sender is dropped under this lock, so this catches a stop that raced with the tick
    if matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected)) {
        return false;
    }

    if inner.state == TransportState::Playing
        && let Some(identity) = inner.identity.clone()
    {
        shared.emit(TransportEvent::PositionChanged {
            identity,
            position_ticks: inner.sequencer.tick_position(),
            total_ticks: inner.total_ticks,
        });
    }
    true
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::engine::{EndOfTrackCallback, ThreadSequencer};
    use crate::engine::test_support::RecordingSink;
    use crate::model::event::Event;
    use crate::model::sequence::{PPQ, Track};
    use std::path::PathBuf;

    /// Sequencer driven by hand: nothing moves unless the test moves it.
    #[derive(Default)]
    pub(crate) struct ManualSequencer {
        pub(crate) state: Arc<Mutex<ManualState>>,
    }

    #[derive(Default)]
    pub(crate) struct ManualState {
        pub(crate) tick: u64,
        pub(crate) running: bool,
        pub(crate) end: u64,
        pub(crate) starts: usize,
        pub(crate) on_end: Option<EndOfTrackCallback>,
        pub(crate) refuse_sequence: bool,
    }

    impl ManualSequencer {
        /// Plays up to `tick`, and runs off the end when `tick` reaches the end of the sequence.
        pub(crate) fn advance_to(state: &Arc<Mutex<ManualState>>, tick: u64) {
            let on_end = {
                let mut s = state.lock();
                s.tick = tick.min(s.end);
                if s.tick < s.end {
                    return;
                }
                s.running = false;
                s.on_end.clone()
            };
            if let Some(on_end) = on_end {
                on_end();
            }
        }
    }

    impl Sequencer for ManualSequencer {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_sequence(&mut self, sequence: Arc<Sequence>) -> Result<()> {
            let mut s = self.state.lock();
            if s.refuse_sequence {
                return Err(Error::TransportUnavailable("sequence rejected".into()));
            }
            s.end = sequence.tick_length();
            s.tick = 0;
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            let mut s = self.state.lock();
            s.running = true;
            s.starts += 1;
            Ok(())
        }

        fn stop(&mut self) {
            self.state.lock().running = false;
        }

        fn set_tick_position(&mut self, tick: u64) -> Result<()> {
            let mut s = self.state.lock();
            s.tick = tick.min(s.end);
            Ok(())
        }

        fn tick_position(&self) -> u64 {
            self.state.lock().tick
        }

        fn is_running(&self) -> bool {
            self.state.lock().running
        }

        fn set_end_of_track_callback(&mut self, callback: EndOfTrackCallback) {
            self.state.lock().on_end = Some(callback);
        }
    }

    struct UnavailableSequencer;

    impl Sequencer for UnavailableSequencer {
        fn open(&mut self) -> Result<()> {
            Err(Error::TransportUnavailable("no synthesizer".into()))
        }
        fn set_sequence(&mut self, _sequence: Arc<Sequence>) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn set_tick_position(&mut self, _tick: u64) -> Result<()> {
            Ok(())
        }
        fn tick_position(&self) -> u64 {
            0
        }
        fn is_running(&self) -> bool {
            false
        }
        fn set_end_of_track_callback(&mut self, _callback: EndOfTrackCallback) {}
    }

    pub(crate) fn manual_transport() -> (Transport<ManualSequencer>, Arc<Mutex<ManualState>>) {
        let sequencer = ManualSequencer::default();
        let state = Arc::clone(&sequencer.state);
        (Transport::new(sequencer).unwrap(), state)
    }

    fn file(name: &str) -> Identity {
        Identity::File(PathBuf::from(name))
    }

    fn drain(rx: &Receiver<TransportEvent>) -> Vec<TransportEvent> {
        rx.try_iter()
            .filter(|e| !matches!(e, TransportEvent::PositionChanged { .. }))
            .collect()
    }

    #[test]
    fn play_pause_toggles_and_notifies() {
        env_logger::try_init().unwrap_or(());

        let (transport, _) = manual_transport();
        let events = transport.subscribe();

        assert!(matches!(transport.play_pause(), Err(Error::NothingLoaded)));

        assert!(transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap());
        assert_eq!(transport.state(), TransportState::Stopped);

        assert!(transport.play_pause().unwrap());
        assert_eq!(transport.state(), TransportState::Playing);
        assert!(!transport.play_pause().unwrap());
        assert_eq!(transport.state(), TransportState::Paused);

        assert_eq!(
            drain(&events),
            vec![
                TransportEvent::Started { identity: file("a.mid") },
                TransportEvent::Paused { identity: file("a.mid") },
            ]
        );
    }

    #[test]
    fn reloading_same_identity_resumes_from_position() {
        env_logger::try_init().unwrap_or(());

        let (transport, state) = manual_transport();
        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.play_pause().unwrap();
        ManualSequencer::advance_to(&state, 200);
        transport.play_pause().unwrap();
        assert_eq!(transport.state(), TransportState::Paused);

        assert!(!transport.load(file("a.mid"), Sequence::single_note(72, 1, 10)).unwrap());
        assert!(transport.play_pause().unwrap());
        assert_eq!(transport.position_ticks(), 200);
        assert_eq!(transport.total_ticks(), 480);
    }

    #[test]
    fn loading_new_identity_resets_position_but_not_state() {
        let (transport, state) = manual_transport();
        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.play_pause().unwrap();
        ManualSequencer::advance_to(&state, 300);

        assert!(transport.load(file("b.mid"), Sequence::single_note(62, 100, 960)).unwrap());
        assert_eq!(transport.position_ticks(), 0);
        assert_eq!(transport.total_ticks(), 960);
        assert_eq!(transport.state(), TransportState::Playing);
        assert!(transport.is_loaded(&file("b.mid")));
        assert!(!transport.is_loaded(&file("a.mid")));
    }

    #[test]
    fn failed_load_keeps_previous_identity() {
        let (transport, state) = manual_transport();
        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.play_pause().unwrap();
        ManualSequencer::advance_to(&state, 100);

        state.lock().refuse_sequence = true;
        assert!(transport.load(file("b.mid"), Sequence::single_note(62, 100, 960)).is_err());

        assert!(transport.is_loaded(&file("a.mid")));
        assert_eq!(transport.total_ticks(), 480);
        assert_eq!(transport.position_ticks(), 100);
        assert_eq!(transport.state(), TransportState::Playing);
    }

    #[test]
    fn stop_rewinds_and_keeps_sequence() {
        let (transport, state) = manual_transport();
        let events = transport.subscribe();
        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.play_pause().unwrap();
        ManualSequencer::advance_to(&state, 120);

        transport.stop().unwrap();
        assert_eq!(transport.state(), TransportState::Stopped);
        assert_eq!(transport.position_ticks(), 0);
        assert!(!state.lock().running);
        assert!(transport.is_loaded(&file("a.mid")));
        assert!(drain(&events).contains(&TransportEvent::Stopped {
            identity: Some(file("a.mid"))
        }));

        assert!(transport.play_pause().unwrap());
    }

    #[test]
    fn seek_and_position() {
        let (transport, _) = manual_transport();
        assert_eq!(transport.position(), 0.0);

        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.seek(0.25).unwrap();
        assert_eq!(transport.position_ticks(), 120);
        assert_eq!(transport.position(), 0.25);

        transport.seek(1.5).unwrap();
        assert_eq!(transport.position_ticks(), 480);
        transport.seek(-1.0).unwrap();
        assert_eq!(transport.position_ticks(), 0);
        transport.seek(f64::NAN).unwrap();
        assert_eq!(transport.position_ticks(), 0);

        // 1/3 of 480 ticks rounds to 160
        transport.seek(1.0 / 3.0).unwrap();
        assert_eq!(transport.position_ticks(), 160);
    }

    #[test]
    fn position_of_empty_sequence_is_zero() {
        let (transport, _) = manual_transport();
        let mut empty = Sequence::new(PPQ, 480).unwrap();
        empty.tracks.push(Track::new());
        transport.load(file("empty.mid"), empty).unwrap();
        transport.seek(0.5).unwrap();
        assert_eq!(transport.position(), 0.0);
    }

    #[test]
    fn natural_completion_resets_and_flags_once() {
        env_logger::try_init().unwrap_or(());

        let (transport, state) = manual_transport();
        let events = transport.subscribe();
        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.play_pause().unwrap();

        ManualSequencer::advance_to(&state, 480);

        assert_eq!(transport.state(), TransportState::Stopped);
        assert_eq!(transport.position_ticks(), 0);
        assert!(transport.take_just_finished());
        assert!(!transport.take_just_finished());
        assert_eq!(
            drain(&events).last(),
            Some(&TransportEvent::Finished { identity: file("a.mid") })
        );
    }

    #[test]
    fn end_of_track_while_paused_is_ignored() {
        let (transport, state) = manual_transport();
        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.play_pause().unwrap();
        ManualSequencer::advance_to(&state, 100);
        transport.play_pause().unwrap();

        let on_end = state.lock().on_end.clone().unwrap();
        on_end();

        assert_eq!(transport.state(), TransportState::Paused);
        assert_eq!(transport.position_ticks(), 100);
        assert!(!transport.take_just_finished());
    }

    #[test]
    fn failed_text_load_keeps_previous_session() {
        let (transport, _) = manual_transport();
        let text = codec::encode(&Sequence::single_note(60, 100, 480));
        assert!(transport.load_text("s1", &text).unwrap());
        transport.seek(0.5).unwrap();

        assert!(matches!(
            transport.load_text("s2", "not midi data"),
            Err(Error::Format(_))
        ));
        assert!(transport.is_loaded(&Identity::Session("s1".into())));
        assert_eq!(transport.position_ticks(), 240);

        // already loaded: text is not even decoded
        assert!(!transport.load_text("s1", "garbage").unwrap());
    }

    #[test]
    fn missing_file_is_not_found() {
        let (transport, _) = manual_transport();
        assert!(matches!(
            transport.load_file("/definitely/not/here.mid"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(transport.loaded_identity(), None);
    }

    #[test]
    fn unavailable_sequencer_fails_fast() {
        assert!(matches!(
            Transport::new(UnavailableSequencer),
            Err(Error::TransportUnavailable(_))
        ));
    }

    #[test]
    fn broadcasts_position_while_playing() {
        env_logger::try_init().unwrap_or(());

        let (transport, state) = manual_transport();
        let events = transport.subscribe();
        transport.load(file("a.mid"), Sequence::single_note(60, 100, 480)).unwrap();
        transport.play_pause().unwrap();
        ManualSequencer::advance_to(&state, 240);

        let update = events
            .iter()
            .find(|e| matches!(e, TransportEvent::PositionChanged { .. }))
            .unwrap();
        assert_eq!(
            update,
            TransportEvent::PositionChanged {
                identity: file("a.mid"),
                position_ticks: 240,
                total_ticks: 480,
            }
        );

        transport.play_pause().unwrap();
        thread::sleep(POSITION_INTERVAL * 3);
        let _ = events.try_iter().count();
        thread::sleep(POSITION_INTERVAL * 3);
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let (transport, _) = manual_transport();
        let rx = transport.subscribe();
        drop(rx);
        transport.stop().unwrap();
        assert!(transport.shared.listeners.lock().is_empty());
    }

    #[test]
    fn threaded_sequencer_plays_to_completion() {
        env_logger::try_init().unwrap_or(());

        let mut seq = Sequence::new(PPQ, 480).unwrap();
        seq.tracks.push(
            [
                Event::note_on(0, 0, 60, 100),
                Event::note_off(96, 0, 60, 0),
            ]
            .into_iter()
            .collect::<Track>(),
        );

        let transport = Transport::new(ThreadSequencer::new(RecordingSink::default())).unwrap();
        let events = transport.subscribe();
        transport.load(file("short.mid"), seq).unwrap();
        transport.play_pause().unwrap();

        let finished = events
            .iter()
            .find(|e| matches!(e, TransportEvent::Finished { .. }));
        assert_eq!(
            finished,
            Some(TransportEvent::Finished { identity: file("short.mid") })
        );
        assert_eq!(transport.state(), TransportState::Stopped);
        assert_eq!(transport.position_ticks(), 0);
        assert!(transport.take_just_finished());
    }
}
