use crate::error::Result;
use crate::model::sequence::Sequence;
use std::sync::Arc;

mod scheduler;
mod sink;

pub use scheduler::ThreadSequencer;
pub use sink::LogSink;
#[cfg(feature = "midi-out")]
pub use sink::MidirSink;

/// Invoked from the sequencer's own thread when playback runs off the end of the sequence.
pub type EndOfTrackCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Where the sequencer sends raw MIDI bytes.
pub trait MidiSink: Send + 'static {
    /// Acquire the output. Failure here means nothing can be played.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, message: &[u8]) -> Result<()>;

    /// Silence every channel (CC 123, All Notes Off).
    fn all_notes_off(&mut self) -> Result<()> {
        for channel in 0..16u8 {
            self.send(&[0xB0 | channel, 123, 0])?;
        }
        Ok(())
    }
}

/// The host sequencing facility the transport drives: it owns timing and runs playback on its
/// own thread. Positions are in ticks of the currently set sequence.
pub trait Sequencer: Send + 'static {
    fn open(&mut self) -> Result<()>;

    /// Replaces the sequence and rewinds to tick 0. Keeps running if it was running.
    fn set_sequence(&mut self, sequence: Arc<Sequence>) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn set_tick_position(&mut self, tick: u64) -> Result<()>;

    fn tick_position(&self) -> u64;

    fn is_running(&self) -> bool;

    fn set_end_of_track_callback(&mut self, callback: EndOfTrackCallback);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::MidiSink;
    use crate::error::Result;

    /// Collects everything sent to it.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Vec<Vec<u8>>,
    }

    impl MidiSink for RecordingSink {
        fn send(&mut self, message: &[u8]) -> Result<()> {
            self.sent.push(message.to_vec());
            Ok(())
        }
    }

    #[test]
    fn all_notes_off_covers_every_channel() {
        let mut sink = RecordingSink::default();
        sink.all_notes_off().unwrap();
        assert_eq!(sink.sent.len(), 16);
        assert_eq!(sink.sent[0], vec![0xB0, 123, 0]);
        assert_eq!(sink.sent[15], vec![0xBF, 123, 0]);
    }
}
