use std::fmt;

/// MIDI number of the tuning reference (A4).
pub const REFERENCE_MIDI: i32 = 69;
/// Frequency of the tuning reference in Hz.
pub const REFERENCE_HZ: f64 = 440.0;

/// Musical note names (chromatic scale, sharp spelling)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteName {
    C,
    CSharp,
    D,
    DSharp,
    E,
    F,
    FSharp,
    G,
    GSharp,
    A,
    ASharp,
    B,
}

impl NoteName {
    const CHROMATIC: [NoteName; 12] = [
        NoteName::C,
        NoteName::CSharp,
        NoteName::D,
        NoteName::DSharp,
        NoteName::E,
        NoteName::F,
        NoteName::FSharp,
        NoteName::G,
        NoteName::GSharp,
        NoteName::A,
        NoteName::ASharp,
        NoteName::B,
    ];

    /// MIDI note number within an octave (C=0, B=11)
    pub fn semitone(self) -> i32 {
        match self {
            NoteName::C => 0,
            NoteName::CSharp => 1,
            NoteName::D => 2,
            NoteName::DSharp => 3,
            NoteName::E => 4,
            NoteName::F => 5,
            NoteName::FSharp => 6,
            NoteName::G => 7,
            NoteName::GSharp => 8,
            NoteName::A => 9,
            NoteName::ASharp => 10,
            NoteName::B => 11,
        }
    }

    fn from_semitone(semitone: i32) -> Self {
        Self::CHROMATIC[semitone.rem_euclid(12) as usize]
    }

    fn label(self) -> &'static str {
        match self {
            NoteName::C => "C",
            NoteName::CSharp => "C#",
            NoteName::D => "D",
            NoteName::DSharp => "D#",
            NoteName::E => "E",
            NoteName::F => "F",
            NoteName::FSharp => "F#",
            NoteName::G => "G",
            NoteName::GSharp => "G#",
            NoteName::A => "A",
            NoteName::ASharp => "A#",
            NoteName::B => "B",
        }
    }

    /// Convert to MIDI note number given an octave.
    /// Middle C (C4) = MIDI 60, C0 = MIDI 12
    pub fn to_midi(self, octave: i32) -> i32 {
        (octave + 1) * 12 + self.semitone()
    }

    /// Frequency in Hz (A4 = 440 Hz)
    pub fn to_freq(self, octave: i32) -> f64 {
        midi_to_freq(self.to_midi(octave))
    }
}

/// Equal-tempered frequency of a MIDI note number.
pub fn midi_to_freq(midi: i32) -> f64 {
    REFERENCE_HZ * 2.0_f64.powf((midi - REFERENCE_MIDI) as f64 / 12.0)
}

/// Highest octave a spelling may name; keeps the MIDI math in range.
pub const MAX_OCTAVE: i32 = 99;

/// A resolved pitch: pitch class plus octave, after enharmonic normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pitch {
    pub name: NoteName,
    pub octave: i32,
}

impl Pitch {
    pub const A4: Pitch = Pitch {
        name: NoteName::A,
        octave: 4,
    };

    /// Parse a spelling such as `G4`, `C#5`, `Bb3` or `E#5`.
    ///
    /// Accidentals shift the letter's semitone before the octave is applied,
    /// so spellings that cross a C boundary carry into the neighbouring
    /// octave: `B#4` is `C5` and `Cb5` is `B4`.
    pub fn parse(spelling: &str) -> Option<Pitch> {
        let mut chars = spelling.chars();
        let letter = match chars.next()? {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };

        let rest = chars.as_str();
        let (accidental, digits) = match rest.as_bytes().first()? {
            b'#' => (1, &rest[1..]),
            b'b' => (-1, &rest[1..]),
            _ => (0, rest),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let octave: i32 = digits.parse().ok()?;
        if octave > MAX_OCTAVE {
            return None;
        }

        Some(Pitch::from_midi((octave + 1) * 12 + letter + accidental))
    }

    pub fn from_midi(midi: i32) -> Pitch {
        Pitch {
            name: NoteName::from_semitone(midi),
            octave: midi.div_euclid(12) - 1,
        }
    }

    pub fn midi(self) -> i32 {
        self.name.to_midi(self.octave)
    }

    pub fn frequency(self) -> f64 {
        self.name.to_freq(self.octave)
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name.label(), self.octave)
    }
}

/// A note as delivered by the level provider, kept verbatim.
///
/// The raw spelling matters: button assignment hashes the string itself, so
/// `E#5` and `F5` may land on different buttons even though they sound alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Note(String);

impl Note {
    pub fn new(spelling: impl Into<String>) -> Self {
        Self(spelling.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolved pitch, falling back to A4 for spellings that do not parse.
    pub fn pitch(&self) -> Pitch {
        Pitch::parse(&self.0).unwrap_or(Pitch::A4)
    }

    pub fn frequency(&self) -> f64 {
        self.pitch().frequency()
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Note {
    fn from(s: &str) -> Self {
        Note::new(s)
    }
}

/// What must be played back for one level, and how fast.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSheet {
    pub level: u32,
    pub notes: Vec<Note>,
    pub tempo_bpm: u32,
}

impl LevelSheet {
    pub fn new(level: u32, notes: Vec<Note>, tempo_bpm: u32) -> Self {
        Self {
            level,
            notes,
            tempo_bpm,
        }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn freq(s: &str) -> f64 {
        Note::from(s).frequency()
    }

    #[test]
    fn test_middle_c_midi() {
        assert_eq!(NoteName::C.to_midi(4), 60);
        assert_eq!(NoteName::C.to_midi(0), 12);
    }

    #[test]
    fn test_a4_frequency() {
        assert!((freq("A4") - 440.0).abs() < 1e-9);
        assert!((NoteName::A.to_freq(5) - 880.0).abs() < 1e-9);
    }

    #[test]
    fn test_semitones() {
        assert_eq!(NoteName::C.semitone(), 0);
        assert_eq!(NoteName::B.semitone(), 11);
    }

    #[test]
    fn enharmonic_spellings_share_a_pitch() {
        assert_eq!(freq("E#5"), freq("F5"));
        assert_eq!(freq("B#4"), freq("C5"));
        assert_eq!(freq("Cb5"), freq("B4"));
        assert_eq!(freq("Fb4"), freq("E4"));
        assert_eq!(freq("Bb3"), freq("A#3"));
    }

    #[test]
    fn octave_carries_across_the_c_boundary() {
        assert_eq!(Pitch::parse("B#4").map(|p| p.to_string()), Some("C5".into()));
        assert_eq!(Pitch::parse("Cb5").map(|p| p.to_string()), Some("B4".into()));
        assert_eq!(Pitch::parse("E#5").map(|p| p.to_string()), Some("F5".into()));
    }

    #[test]
    fn malformed_spellings_fall_back_to_a4() {
        for bad in ["", "H4", "g4", "C", "C#", "C#x", "4C", " C4", "C4 ", "C-1",
            "C100", "C999999999", "B#99999999999"] {
            assert_eq!(Pitch::parse(bad), None, "{bad:?} should not parse");
            assert!((freq(bad) - REFERENCE_HZ).abs() < 1e-9);
        }
    }

    #[test]
    fn multi_digit_octaves_parse() {
        let p = Pitch::parse("C10").unwrap();
        assert_eq!(p.midi(), 132);
        assert_eq!(Pitch::parse("B#99").map(Pitch::midi), Some(1212));
        assert!(Note::from("C99").frequency().is_finite());
    }
}
