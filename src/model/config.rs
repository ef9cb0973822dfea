use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "midi_scribe",
    about = "Convert MIDI files to and from a line-based text format, and play them back."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serialize a MIDI file to text.
    Encode {
        /// Path to the source MIDI file.
        midi: PathBuf,

        /// Where to write the text. Prints to stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Surround the text with the start/end delimiters.
        #[arg(short, long, default_value_t = false)]
        wrap: bool,
    },

    /// Rebuild a MIDI file from text.
    Decode {
        /// Path to the text file.
        text: PathBuf,

        /// Where to write the MIDI file. Defaults to the input path with a `.mid` extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Accept track and event count mismatches instead of failing.
        #[arg(short, long, default_value_t = false)]
        lenient: bool,
    },

    /// Convert in whichever direction the input calls for, writing the result next to it.
    Convert {
        file: PathBuf,
    },

    /// Print timing, length and per-track details of a MIDI file.
    Info {
        midi: PathBuf,
    },

    /// Play a MIDI or text file to the end. Ctrl-C stops playback.
    Play {
        file: PathBuf,

        /// Start at this fraction of the sequence (0.0..=1.0).
        #[arg(long, default_value_t = 0.0)]
        from: f64,

        /// Name (or part of a name) of the MIDI output port. Needs the `midi-out` feature.
        #[arg(short, long)]
        port: Option<String>,
    },

    /// Print the composition prompt that would be sent to a language model.
    Prompt {
        midi: PathBuf,

        /// What to change about the piece.
        #[arg(required = true, num_args = 1..)]
        instructions: Vec<String>,
    },
}
