use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, warn};
use midi_scribe::codec::{self, Decoder};
use midi_scribe::llm::build_composition_prompt;
use midi_scribe::{
    Args, Command, MidiSink, PlaybackService, ThreadSequencer, Transport, TransportEvent,
    is_midi_path, read_sequence, write_sequence,
};
use std::fs;
use std::path::Path;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Encode { midi, output, wrap } => {
            let sequence = read_sequence(&midi)?;
            let text = if wrap {
                codec::encode_wrapped(&sequence)
            } else {
                codec::encode(&sequence)
            };

            match output {
                Some(path) => {
                    fs::write(&path, text)
                        .with_context(|| format!("writing '{}'", path.display()))?;
                    info!("Wrote '{}'..!", path.display());
                }
                None => print!("{}", text),
            }
        }
        Command::Decode {
            text,
            output,
            lenient,
        } => {
            let output = output.unwrap_or_else(|| text.with_extension("mid"));
            decode_file(&text, &output, lenient)?;
        }
        Command::Convert { file } => convert(&file)?,
        Command::Info { midi } => {
            let sequence = read_sequence(&midi)?;
            println!("File: {}", midi.display());
            print!("{}", sequence.summary());
        }
        Command::Play { file, from, port } => play_file(&file, from, port)?,
        Command::Prompt { midi, instructions } => {
            let sequence = read_sequence(&midi)?;
            let prompt = build_composition_prompt(&codec::encode(&sequence), &instructions.join(" "));
            println!("{}", prompt);
        }
    }

    Ok(())
}

fn decode_file(text: &Path, output: &Path, lenient: bool) -> Result<()> {
    let contents =
        fs::read_to_string(text).with_context(|| format!("reading '{}'", text.display()))?;

    let decoder = if lenient {
        Decoder::lenient()
    } else {
        Decoder::strict()
    };
    let sequence = decoder.decode(&contents)?;

    write_sequence(&sequence, output)?;
    info!(
        "Wrote '{}' ({} tracks, {} events)..!",
        output.display(),
        sequence.tracks.len(),
        sequence.event_count()
    );
    Ok(())
}

/// MIDI files become `.txt`, text that starts with a header becomes `.mid`.
fn convert(file: &Path) -> Result<()> {
    if is_midi_path(file) {
        let sequence = read_sequence(file)?;
        let output = file.with_extension("txt");
        fs::write(&output, codec::encode(&sequence))
            .with_context(|| format!("writing '{}'", output.display()))?;
        info!("Serialized '{}' to '{}'..!", file.display(), output.display());
        return Ok(());
    }

    let contents =
        fs::read_to_string(file).with_context(|| format!("reading '{}'", file.display()))?;
    let first = contents.lines().map(str::trim).find(|l| !l.is_empty());

    match first {
        Some(line) if line.starts_with("MIDI_HEADER") => {
            decode_file(file, &file.with_extension("mid"), false)
        }
        _ => bail!(
            "'{}' is neither a MIDI file nor serialized MIDI text..!",
            file.display()
        ),
    }
}

#[cfg(feature = "midi-out")]
fn play_file(file: &Path, from: f64, port: Option<String>) -> Result<()> {
    play(midi_scribe::MidirSink::new(port), file, from)
}

#[cfg(not(feature = "midi-out"))]
fn play_file(file: &Path, from: f64, port: Option<String>) -> Result<()> {
    if let Some(port) = port {
        warn!(
            "Built without MIDI output support, ignoring port '{}' and logging instead..!",
            port
        );
    }
    play(midi_scribe::LogSink::new(), file, from)
}

fn play<K: MidiSink>(sink: K, file: &Path, from: f64) -> Result<()> {
    let transport = Transport::new(ThreadSequencer::new(sink))?;
    let service = PlaybackService::new(transport.clone());
    let events = transport.subscribe();

    if is_midi_path(file) {
        service.seek_file(file, from)?;
    } else {
        let text =
            fs::read_to_string(file).with_context(|| format!("reading '{}'", file.display()))?;
        service.seek_session(&text, &file.display().to_string(), from)?;
    }

    let transport_for_handler = transport.clone();
    ctrlc::set_handler(move || {
        warn!("Ctrl-C received, stopping playback..!");
        let _ = transport_for_handler.stop();
    })
    .context("setting Ctrl-C handler")?;

    info!(
        "Playing '{}' ({:.1} seconds)..!",
        file.display(),
        service.duration().as_secs_f64()
    );
    transport.play_pause()?;

    for event in events.iter() {
        match event {
            TransportEvent::PositionChanged {
                position_ticks,
                total_ticks,
                ..
            } => debug!("Position: {}/{} ticks", position_ticks, total_ticks),
            TransportEvent::Finished { .. } => {
                info!("Playback finished, exiting..!");
                break;
            }
            TransportEvent::Stopped { .. } => {
                info!("Playback stopped, exiting..!");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
