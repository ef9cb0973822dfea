use crate::engine::MidiSink;
use crate::error::Result;
use log::debug;

/// Logs every outgoing message at debug level instead of producing sound.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    sent: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl MidiSink for LogSink {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        self.sent += 1;
        debug!("MIDI out #{}: {:02X?}", self.sent, message);
        Ok(())
    }
}

#[cfg(feature = "midi-out")]
pub use midir_sink::MidirSink;

#[cfg(feature = "midi-out")]
mod midir_sink {
    use crate::engine::MidiSink;
    use crate::error::{Error, Result};
    use log::info;
    use midir::{MidiOutput, MidiOutputConnection};

    const CLIENT_NAME: &str = "midi_scribe";

    /// Sends to a system MIDI output port. Picks the first port whose name contains `port_hint`,
    /// or the first port when no hint is given.
    pub struct MidirSink {
        port_hint: Option<String>,
        connection: Option<MidiOutputConnection>,
    }

    impl MidirSink {
        pub fn new(port_hint: Option<String>) -> Self {
            Self {
                port_hint,
                connection: None,
            }
        }
    }

    impl MidiSink for MidirSink {
        fn open(&mut self) -> Result<()> {
            let output = MidiOutput::new(CLIENT_NAME)
                .map_err(|e| Error::TransportUnavailable(e.to_string()))?;

            let ports = output.ports();
            let port = ports
                .iter()
                .find(|port| match (&self.port_hint, output.port_name(port)) {
                    (Some(hint), Ok(name)) => name.contains(hint.as_str()),
                    (None, _) => true,
                    _ => false,
                })
                .ok_or_else(|| {
                    Error::TransportUnavailable(match &self.port_hint {
                        Some(hint) => format!("no MIDI output port matching '{}'", hint),
                        None => "no MIDI output ports available".into(),
                    })
                })?;

            let name = output.port_name(port).unwrap_or_else(|_| "<unknown>".into());
            let connection = output
                .connect(port, CLIENT_NAME)
                .map_err(|e| Error::TransportUnavailable(e.to_string()))?;

            info!("Connected to MIDI output '{}'..!", name);
            self.connection = Some(connection);
            Ok(())
        }

        fn send(&mut self, message: &[u8]) -> Result<()> {
            let Some(connection) = self.connection.as_mut() else {
                return Err(Error::TransportUnavailable("MIDI output is not open".into()));
            };

            connection
                .send(message)
                .map_err(|e| Error::TransportUnavailable(e.to_string()))
        }
    }
}
