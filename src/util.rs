use std::path::Path;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Scientific pitch name, e.g. 60 -> "C4".
pub fn note_name(note: u8) -> String {
    let note = note & 0x7F;
    let octave = (note / 12) as i32 - 1;
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], octave)
}

/// Equal-tempered frequency in Hz, A4 (69) = 440Hz.
pub fn note_frequency(note: u8) -> f64 {
    440.0 * 2f64.powf((note as f64 - 69.0) / 12.0)
}

pub fn frequency_to_note(frequency: f64) -> Option<u8> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return None;
    }

    let note = (69.0 + 12.0 * (frequency / 440.0).log2()).round();
    (0.0..=127.0).contains(&note).then_some(note as u8)
}

pub fn is_midi_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("mid") || ext.eq_ignore_ascii_case("midi"))
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(69), "A4");
        assert_eq!(note_name(0), "C-1");
        assert_eq!(note_name(127), "G9");
    }

    #[test]
    fn frequencies() {
        assert!((note_frequency(69) - 440.0).abs() < 1e-9);
        assert!((note_frequency(81) - 880.0).abs() < 1e-9);
        assert_eq!(frequency_to_note(440.0), Some(69));
        assert_eq!(frequency_to_note(261.63), Some(60));
        assert_eq!(frequency_to_note(-1.0), None);
        assert_eq!(frequency_to_note(1_000_000.0), None);
    }

    #[test]
    fn midi_paths() {
        assert!(is_midi_path(Path::new("songs/twinkle.MID")));
        assert!(is_midi_path(Path::new("a.midi")));
        assert!(!is_midi_path(Path::new("a.txt")));
        assert!(!is_midi_path(Path::new("mid")));
    }
}
