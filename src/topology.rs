//! Button layout for a level: how many buttons, how they are arranged, and
//! which button each sheet note lights up.

use crate::note::Note;

/// Upper bound on buttons for any level.
pub const MAX_BUTTONS: usize = 32;

const BUTTONS_PER_BAND: usize = 4;
const LEVELS_PER_BAND: u32 = 5;
const MAX_COLUMNS: usize = 4;

/// Button colors, cycled by index or by row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonColor {
    Red,
    Yellow,
    Green,
    Blue,
    Orange,
    Purple,
    Pink,
    Cyan,
}

pub const PALETTE: [ButtonColor; 8] = [
    ButtonColor::Red,
    ButtonColor::Yellow,
    ButtonColor::Green,
    ButtonColor::Blue,
    ButtonColor::Orange,
    ButtonColor::Purple,
    ButtonColor::Pink,
    ButtonColor::Cyan,
];

impl ButtonColor {
    pub fn name(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::Orange => "orange",
            Self::Purple => "purple",
            Self::Pink => "pink",
            Self::Cyan => "cyan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub cols: usize,
    pub rows: usize,
}

/// Number of buttons shown for a level.
///
/// Levels 1 and below get 2, levels 2-5 get 4. From level 6 on, every band of
/// five levels adds four buttons, starting at 8 and stopping at 32.
pub fn button_count_for(level: u32) -> usize {
    match level {
        0 | 1 => 2,
        2..=5 => 4,
        _ => {
            let band = ((level - 6) / LEVELS_PER_BAND) as usize + 2;
            (band * BUTTONS_PER_BAND).min(MAX_BUTTONS)
        }
    }
}

pub fn grid_for(button_count: usize) -> Grid {
    if button_count <= 2 {
        return Grid { cols: 1, rows: 2 };
    }
    if button_count <= 4 {
        return Grid { cols: 2, rows: 2 };
    }
    let cols = MAX_COLUMNS.min(button_count);
    Grid {
        cols,
        rows: button_count.div_ceil(cols),
    }
}

/// Sum of the note's UTF-16 code units, reduced modulo the button count.
///
/// Collisions are expected; the formula is kept as is so every client lights
/// the same buttons for the same sheet.
pub fn note_to_button_index(note: &str, button_count: usize) -> usize {
    if button_count == 0 {
        return 0;
    }
    let hash: usize = note.encode_utf16().map(usize::from).sum();
    hash % button_count
}

/// Small layouts color every button on its own; larger ones color by row.
pub fn color_for(index: usize, button_count: usize, cols: usize) -> ButtonColor {
    let slot = if button_count <= 4 || cols == 0 {
        index
    } else {
        index / cols
    };
    PALETTE[slot % PALETTE.len()]
}

/// Resolved layout for one level sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub button_count: usize,
    pub grid: Grid,
    /// Button index for each sheet position.
    pub sequence: Vec<usize>,
    /// First sheet note mapped to each button, used for press feedback.
    button_notes: Vec<Option<Note>>,
}

impl Topology {
    pub fn for_level(level: u32, sheet: &[Note]) -> Self {
        Self::with_button_count(button_count_for(level), sheet)
    }

    pub fn with_button_count(button_count: usize, sheet: &[Note]) -> Self {
        let button_count = button_count.max(1);
        let mut button_notes: Vec<Option<Note>> = vec![None; button_count];
        let sequence = sheet
            .iter()
            .map(|note| {
                let index = note_to_button_index(note.as_str(), button_count);
                button_notes[index].get_or_insert_with(|| note.clone());
                index
            })
            .collect();

        Self {
            button_count,
            grid: grid_for(button_count),
            sequence,
            button_notes,
        }
    }

    /// Button expected at input position `cursor`.
    pub fn expected(&self, cursor: usize) -> Option<usize> {
        self.sequence.get(cursor).copied()
    }

    pub fn note_for_button(&self, index: usize) -> Option<&Note> {
        self.button_notes.get(index).and_then(Option::as_ref)
    }

    pub fn color(&self, index: usize) -> ButtonColor {
        color_for(index, self.button_count, self.grid.cols)
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.button_count
    }
}
