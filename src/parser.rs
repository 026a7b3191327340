//! Offline level sheets (`.sheet` files) for practice without a server.
//!
//! ```text
//! # level 3 from the rehearsal build
//! level: 3
//! speed: 100
//! G4 A4 C5
//! E#5 D5
//! ```

use std::fs;
use std::path::Path;

use crate::api::LevelProvider;
use crate::error::{ApiError, SheetError};
use crate::note::{LevelSheet, Note};

const DEFAULT_SPEED: u32 = 120;

fn parse_error(line: usize, message: impl Into<String>) -> SheetError {
    SheetError::Parse {
        line,
        message: message.into(),
    }
}

/// Parse a `.sheet` document into a LevelSheet
pub fn parse(input: &str) -> Result<LevelSheet, SheetError> {
    let mut level = 1;
    let mut speed = DEFAULT_SPEED;
    let mut notes = Vec::new();

    for (line_idx, line) in input.lines().enumerate() {
        let line_num = line_idx + 1;
        let trimmed = line.trim();

        // Skip empty lines and comments
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(value) = trimmed.strip_prefix("level:") {
            level = value
                .trim()
                .parse()
                .map_err(|_| parse_error(line_num, format!("invalid level: {}", value.trim())))?;
            if level == 0 {
                return Err(parse_error(line_num, "level must be positive"));
            }
            continue;
        }
        if let Some(value) = trimmed
            .strip_prefix("speed:")
            .or_else(|| trimmed.strip_prefix("tempo:"))
        {
            speed = value
                .trim()
                .parse()
                .map_err(|_| parse_error(line_num, format!("invalid speed: {}", value.trim())))?;
            if speed == 0 {
                return Err(parse_error(line_num, "speed must be positive"));
            }
            continue;
        }

        for token in trimmed.split_whitespace() {
            if !token.starts_with(|c: char| ('A'..='G').contains(&c)) {
                return Err(parse_error(line_num, format!("not a note: {token}")));
            }
            notes.push(Note::new(token));
        }
    }

    Ok(LevelSheet::new(level, notes, speed))
}

pub fn load(path: &Path) -> Result<LevelSheet, SheetError> {
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// A single sheet file served for whatever level is asked.
pub struct SheetFile {
    sheet: LevelSheet,
}

impl SheetFile {
    pub fn new(sheet: LevelSheet) -> Self {
        Self { sheet }
    }
}

impl LevelProvider for SheetFile {
    fn level_sheet(&self, level: u32) -> Result<LevelSheet, ApiError> {
        if level != self.sheet.level {
            return Err(ApiError::Status {
                status: 404,
                message: "level not found".into(),
            });
        }
        Ok(self.sheet.clone())
    }
}
