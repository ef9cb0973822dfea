use crate::codec;
use crate::engine::Sequencer;
use crate::error::Result;
use crate::midi_file::read_sequence;
use crate::transport::Transport;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// What is loaded into the transport: a file on disk or an in-memory text session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    File(PathBuf),
    Session(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::File(path) => write!(f, "{}", path.display()),
            Identity::Session(id) => write!(f, "session:{}", id),
        }
    }
}

/// Serialized text registered as a playable session, not yet loaded into the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSession {
    pub name: String,
    pub session_id: String,
    pub text: String,
    pub duration: Duration,
}

impl TextSession {
    pub fn identity(&self) -> Identity {
        Identity::Session(self.session_id.clone())
    }
}

/// Answers whether a target is the one currently loaded, so callers can skip a reload that
/// would rewind it.
pub struct SessionRegistry<S: Sequencer> {
    transport: Transport<S>,
}

impl<S: Sequencer> Clone for SessionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<S: Sequencer> SessionRegistry<S> {
    pub fn new(transport: Transport<S>) -> Self {
        Self { transport }
    }

    pub fn is_loaded(&self, identity: &Identity) -> bool {
        self.transport.is_loaded(identity)
    }

    pub fn is_file_loaded<P: AsRef<Path>>(&self, path: P) -> bool {
        self.is_loaded(&Identity::File(path.as_ref().to_path_buf()))
    }

    pub fn is_session_loaded(&self, session_id: &str) -> bool {
        self.is_loaded(&Identity::Session(session_id.to_string()))
    }
}

/// Play/pause/seek by target, for callers that think in files and text sessions rather than
/// transport states. Each call loads its target only when it is not already loaded.
pub struct PlaybackService<S: Sequencer> {
    transport: Transport<S>,
    registry: SessionRegistry<S>,
}

impl<S: Sequencer> Clone for PlaybackService<S> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S: Sequencer> PlaybackService<S> {
    pub fn new(transport: Transport<S>) -> Self {
        Self {
            registry: SessionRegistry::new(transport.clone()),
            transport,
        }
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    pub fn registry(&self) -> &SessionRegistry<S> {
        &self.registry
    }

    /// Toggles playback of `path`, loading it first if another target is loaded.
    /// Returns whether it is now playing.
    pub fn play_pause_file<P: AsRef<Path>>(&self, path: P) -> Result<bool> {
        if !self.registry.is_file_loaded(&path) {
            self.transport.load_file(&path)?;
        } else {
            debug!("'{}' already loaded..!", path.as_ref().display());
        }
        self.transport.play_pause()
    }

    /// Toggles playback of text session `session_id`. `text` is only decoded when the session
    /// is not already loaded.
    pub fn play_pause_text(&self, text: &str, session_id: &str) -> Result<bool> {
        if !self.registry.is_session_loaded(session_id) {
            self.transport.load_text(session_id, text)?;
        } else {
            debug!("Session '{}' already loaded..!", session_id);
        }
        self.transport.play_pause()
    }

    pub fn seek_file<P: AsRef<Path>>(&self, path: P, fraction: f64) -> Result<()> {
        if !self.registry.is_file_loaded(&path) {
            self.transport.load_file(&path)?;
        }
        self.transport.seek(fraction)
    }

    pub fn seek_session(&self, text: &str, session_id: &str, fraction: f64) -> Result<()> {
        if !self.registry.is_session_loaded(session_id) {
            self.transport.load_text(session_id, text)?;
        }
        self.transport.seek(fraction)
    }

    pub fn stop(&self) -> Result<()> {
        self.transport.stop()
    }

    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    pub fn position(&self) -> f64 {
        self.transport.position()
    }

    pub fn duration(&self) -> Duration {
        self.transport.duration()
    }

    /// Decodes `text` to check it and measure it, and hands back a fresh session for it. The
    /// transport is not touched.
    pub fn create_session(&self, text: &str, base_name: &str) -> Result<TextSession> {
        let duration = self.duration_of_text(text)?;
        let session_id = format!("session_{}", Uuid::new_v4().simple());
        let name = format!("{}_{}", base_name, session_id);

        info!("Created '{}' ({:.1} seconds)..!", name, duration.as_secs_f64());
        Ok(TextSession {
            name,
            session_id,
            text: text.to_string(),
            duration,
        })
    }

    /// Length of a MIDI file without loading it for playback.
    pub fn duration_of_file<P: AsRef<Path>>(&self, path: P) -> Result<Duration> {
        Ok(read_sequence(path)?.duration())
    }

    /// Length of serialized text without loading it for playback.
    pub fn duration_of_text(&self, text: &str) -> Result<Duration> {
        Ok(codec::decode(text)?.duration())
    }

    /// Consumes the one-shot flag raised when playback ran to the end.
    pub fn has_playback_just_finished(&self) -> bool {
        self.transport.take_just_finished()
    }
}
