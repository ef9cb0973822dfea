use crate::codec::{self, Decoder, HEADER_TAG, MIDI_END_DELIMITER, MIDI_START_DELIMITER};
use crate::error::{Error, Result};
use crate::model::event::Event;
use crate::model::sequence::{PPQ, Sequence, Track};
use log::{debug, info};
use std::fmt::Write;

const FORMAT_EXPLANATION: &str = "You are a MIDI composition assistant. You will receive a serialized MIDI file and a composition request.

SERIALIZED MIDI FORMAT:
The MIDI data is represented in a text format with pipe-separated key-value pairs:
- MIDI_HEADER|divisionType=X|resolution=Y
- TRACKS|count=N
- TRACK|number=X|events=Y
- EVENT|tick=T|type=MessageType|command=C|channel=Ch|data1=D1|data2=D2|description=DESC|additional_fields...

IMPORTANT RESPONSE REQUIREMENTS:
1. Your response MUST include the complete modified MIDI data in the EXACT same serialized format
2. Preserve the original structure and formatting precisely
3. Make only the changes requested in the composition prompt
4. Ensure all tick timing, channels, and MIDI commands are valid
5. Start your response with the modified serialized MIDI data
6. You may add explanatory text AFTER the serialized data

";

/// A text-in, text-out model that rewrites serialized MIDI on request.
pub trait Transformer {
    fn transform(&self, prompt: &str) -> Result<String>;

    fn name(&self) -> &str {
        "transformer"
    }
}

/// The full prompt: format rules, the original data between delimiters, then the request.
pub fn build_composition_prompt(serialized: &str, instructions: &str) -> String {
    let mut prompt = String::with_capacity(FORMAT_EXPLANATION.len() + serialized.len() + 256);

    prompt.push_str(FORMAT_EXPLANATION);
    let _ = write!(
        prompt,
        "ORIGINAL MIDI DATA:\n{}\n{}\n{}\n\n",
        MIDI_START_DELIMITER,
        serialized.trim_end(),
        MIDI_END_DELIMITER
    );
    let _ = write!(prompt, "COMPOSITION REQUEST:\n{}\n\n", instructions.trim());
    prompt.push_str(
        "Please modify the MIDI data according to the composition request and provide the complete modified serialized MIDI data in your response.",
    );

    prompt
}

/// Pulls serialized MIDI out of a model response.
///
/// Delimited payloads win. Otherwise the block starting at the first `MIDI_HEADER` line is
/// collected, skipping code fences, until the first line that is clearly prose.
pub fn extract_serialized(response: &str) -> Result<String> {
    if response.trim().is_empty() {
        return Err(Error::Format("response is empty".into()));
    }

    if response.contains(MIDI_START_DELIMITER) {
        let inner = codec::strip_delimiters(response);
        if inner.starts_with(HEADER_TAG) {
            return Ok(inner.to_string());
        }
    }

    let header = format!("{}|", HEADER_TAG);
    let mut found = String::new();
    let mut inside = false;

    for line in response.lines().map(str::trim) {
        if line.starts_with(&header) {
            if inside {
                break;
            }
            inside = true;
            found.push_str(line);
            found.push('\n');
        } else if inside {
            if line.starts_with("TRACKS|") || line.starts_with("TRACK|") || line.starts_with("EVENT|")
            {
                found.push_str(line);
                found.push('\n');
            } else if !line.is_empty() && !line.starts_with("```") && !line.contains('|') {
                break;
            }
        }
    }

    if found.is_empty() {
        return Err(Error::Format("no valid MIDI data found in response".into()));
    }
    Ok(found)
}

/// Sends `sequence` through `transformer` with `instructions` and decodes what comes back.
/// Model output is decoded leniently, since counts in hand-edited text are often off by one.
pub fn transform_sequence<T: Transformer + ?Sized>(
    sequence: &Sequence,
    instructions: &str,
    transformer: &T,
) -> Result<Sequence> {
    let prompt = build_composition_prompt(&codec::encode(sequence), instructions);
    debug!(
        "Sending {} character prompt to {}..!",
        prompt.len(),
        transformer.name()
    );

    let response = transformer.transform(&prompt)?;
    let extracted = extract_serialized(&response)?;
    let result = Decoder::lenient().decode(&extracted)?;

    info!(
        "{} returned {} track(s), {} event(s)..!",
        transformer.name(),
        result.tracks.len(),
        result.event_count()
    );
    Ok(result)
}

/// A four-bar kick and snare pattern on the drum channel, for requests that start from nothing.
pub fn starter_sequence() -> Sequence {
    const KICK: u8 = 36;
    const SNARE: u8 = 38;
    const DRUMS: u8 = 9;

    let mut track = Track::new();
    track.push(Event::track_name(0, "Drums"));
    track.push(Event::program_change(0, DRUMS, 0));

    for beat in 0..8u64 {
        let tick = beat * 480;
        let (note, velocity) = if beat % 2 == 0 { (KICK, 100) } else { (SNARE, 90) };
        track.push(Event::note_on(tick, DRUMS, note, velocity));
        track.push(Event::note_off(tick + 480, DRUMS, note, 0));
    }
    track.push(Event::end_of_track(8 * 480));

    Sequence {
        division_type: PPQ,
        resolution: 480,
        tracks: vec![track],
    }
}

/// Like [`transform_sequence`], starting from [`starter_sequence`].
pub fn compose<T: Transformer + ?Sized>(instructions: &str, transformer: &T) -> Result<Sequence> {
    transform_sequence(&starter_sequence(), instructions, transformer)
}
