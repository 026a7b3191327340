use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Color, Print, PrintStyledContent, Stylize};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{execute, queue};
use tracing::{info, warn};

use crate::api::{LevelProvider, SubmitResponse};
use crate::session::{GameSession, LevelContext, Phase, Progress, Toolbar};
use crate::topology::{ButtonColor, MAX_BUTTONS};

/// Button keys in grid order, four per row.
pub const BUTTON_KEYS: [char; MAX_BUTTONS] = [
    '1', '2', '3', '4', 'q', 'w', 'e', 'r', 'a', 's', 'd', 'f', 'z', 'x', 'c', 'v', '5', '6', '7',
    '8', 't', 'y', 'u', 'i', 'g', 'h', 'j', 'k', 'b', 'n', 'm', ',',
];

const POLL: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Press(usize),
    Play,
    Hint,
    /// Retry after a miss, next level after a clear.
    Advance,
    Quit,
}

pub fn action_for(code: KeyCode, button_count: usize) -> Option<Action> {
    match code {
        KeyCode::Esc => Some(Action::Quit),
        KeyCode::Enter => Some(Action::Advance),
        KeyCode::Char(' ') => Some(Action::Play),
        KeyCode::Char('?') | KeyCode::Char('/') => Some(Action::Hint),
        KeyCode::Char(c) => {
            let c = c.to_ascii_lowercase();
            BUTTON_KEYS
                .iter()
                .take(button_count)
                .position(|&k| k == c)
                .map(Action::Press)
        }
        _ => None,
    }
}

pub fn button_key(index: usize) -> char {
    BUTTON_KEYS.get(index).copied().unwrap_or('?')
}

fn terminal_color(color: ButtonColor) -> Color {
    match color {
        ButtonColor::Red => Color::Rgb { r: 239, g: 68, b: 68 },
        ButtonColor::Yellow => Color::Rgb { r: 234, g: 179, b: 8 },
        ButtonColor::Green => Color::Rgb { r: 34, g: 197, b: 94 },
        ButtonColor::Blue => Color::Rgb { r: 59, g: 130, b: 246 },
        ButtonColor::Orange => Color::Rgb { r: 249, g: 115, b: 22 },
        ButtonColor::Purple => Color::Rgb { r: 168, g: 85, b: 247 },
        ButtonColor::Pink => Color::Rgb { r: 236, g: 72, b: 153 },
        ButtonColor::Cyan => Color::Rgb { r: 6, g: 182, b: 212 },
    }
}

/// Context for `level + 1`, carrying forward whatever progress the server
/// last reported.
pub fn next_context(ctx: &LevelContext, submitted: Option<&SubmitResponse>) -> LevelContext {
    let progress = submitted
        .map(|resp| Progress {
            current_level: resp.current_level,
            unlock_level: resp.unlock_level,
        })
        .or(ctx.progress);
    LevelContext {
        level: ctx.level + 1,
        progress,
    }
}

fn status_text(phase: Phase) -> &'static str {
    match phase {
        Phase::Idle => "Press Space to listen",
        Phase::Playing => "Listen...",
        Phase::Input => "Your turn",
        Phase::Success => "Cleared! Enter for the next level",
        Phase::Fail => "Missed. Enter to retry, ? for a hint",
    }
}

/// Everything drawn on screen; redraw only when it changes.
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    level: u32,
    phase: Phase,
    cursor: usize,
    active: Option<usize>,
    submission: Option<String>,
    notice: Option<String>,
}

impl Frame {
    fn capture(session: &GameSession, notice: &Option<String>) -> Self {
        let sub = session.submission();
        let submission = if sub.in_flight() {
            Some("Saving progress...".to_string())
        } else if let Some(err) = sub.error() {
            Some(format!("Could not save progress: {err}"))
        } else {
            sub.result().map(|resp| {
                let mut line = format!("Unlocked up to level {}", resp.unlock_level);
                if !resp.coupons.is_empty() {
                    let total: i64 = resp.coupons.iter().map(|c| c.price).sum();
                    line.push_str(&format!(
                        ", {} coupon(s) worth {total}",
                        resp.coupons.len()
                    ));
                }
                line
            })
        };
        Self {
            level: session.context().level,
            phase: session.phase(),
            cursor: session.cursor(),
            active: session.active_button(),
            submission,
            notice: notice.clone(),
        }
    }
}

/// Restores the terminal even when the loop bails out early.
struct TerminalGuard;

impl TerminalGuard {
    fn enter(stdout: &mut io::Stdout) -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        execute!(stdout, EnterAlternateScreen, Hide).context("alternate screen")?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(io::stdout(), Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

/// Run the interactive console until the player quits.
pub fn run(mut session: GameSession, levels: &dyn LevelProvider) -> Result<()> {
    let mut stdout = io::stdout();
    let _guard = TerminalGuard::enter(&mut stdout)?;
    let mut toolbar = session.toolbar();

    info!(level = session.context().level, "console started");
    let result = event_loop(&mut session, &mut toolbar, levels, &mut stdout);
    info!(level = session.context().level, "console closed");
    result
}

fn event_loop(
    session: &mut GameSession,
    toolbar: &mut Toolbar,
    levels: &dyn LevelProvider,
    stdout: &mut io::Stdout,
) -> Result<()> {
    let mut notice: Option<String> = None;
    let mut last: Option<Frame> = None;

    loop {
        session.pump();

        let frame = Frame::capture(session, &notice);
        if last.as_ref() != Some(&frame) {
            draw(stdout, session, &frame)?;
            last = Some(frame);
        }

        if !event::poll(POLL).context("event poll error")? {
            continue;
        }

        let Event::Key(KeyEvent {
            code,
            kind: KeyEventKind::Press,
            modifiers,
            ..
        }) = event::read().context("event read error")?
        else {
            continue;
        };

        if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
            return Ok(());
        }

        match action_for(code, session.topology().button_count) {
            Some(Action::Quit) => return Ok(()),
            Some(Action::Press(button)) => {
                session.press(button);
            }
            Some(Action::Play) => {
                notice = None;
                toolbar.request_play();
            }
            Some(Action::Hint) => {
                notice = None;
                toolbar.request_hint();
            }
            Some(Action::Advance) => match session.phase() {
                Phase::Fail => {
                    notice = None;
                    session.retry();
                }
                Phase::Success => notice = Some(advance(session, toolbar, levels)),
                _ => {}
            },
            None => {}
        }
    }
}

fn advance(session: &mut GameSession, toolbar: &mut Toolbar, levels: &dyn LevelProvider) -> String {
    let next = next_context(session.context(), session.submission().result());
    if next.is_locked() {
        info!(level = next.level, "next level locked");
        return format!("Level {} is still locked", next.level);
    }
    match levels.level_sheet(next.level) {
        Ok(sheet) => {
            session.change_level(next, sheet);
            toolbar.reset();
            format!("Level {}", next.level)
        }
        Err(err) => {
            warn!(level = next.level, %err, "failed to load next level");
            format!("Could not load level {}: {err}", next.level)
        }
    }
}

fn draw(stdout: &mut io::Stdout, session: &GameSession, frame: &Frame) -> Result<()> {
    let topology = session.topology();
    let sheet = session.sheet();
    let mode = if session.context().progress.is_some() {
        if session.context().is_replay() { "replay" } else { "ranked" }
    } else {
        "practice"
    };

    queue!(stdout, Clear(ClearType::All), MoveTo(2, 1))?;
    queue!(
        stdout,
        Print(format!(
            "fieldbeat  level {}  ({mode})  {} bpm  {} notes",
            frame.level,
            sheet.tempo_bpm,
            sheet.len()
        ))
    )?;

    let mut row: u16 = 3;
    for r in 0..topology.grid.rows {
        queue!(stdout, MoveTo(2, row))?;
        for c in 0..topology.grid.cols {
            let index = r * topology.grid.cols + c;
            if !topology.contains(index) {
                break;
            }
            let label = format!("   {}   ", button_key(index));
            let cell = if frame.active == Some(index) {
                label.with(Color::Black).on(Color::White)
            } else {
                label.with(Color::Black).on(terminal_color(topology.color(index)))
            };
            queue!(stdout, PrintStyledContent(cell), Print("  "))?;
        }
        row += 2;
    }

    let total = topology.sequence.len();
    let dots: String = (0..total)
        .map(|i| if i < frame.cursor { '●' } else { '○' })
        .collect();
    queue!(
        stdout,
        MoveTo(2, row),
        Print(status_text(frame.phase)),
        MoveTo(2, row + 1),
        Print(format!("{dots}  {}/{total}", frame.cursor)),
    )?;

    if let Some(line) = &frame.submission {
        queue!(stdout, MoveTo(2, row + 3), Print(line))?;
    }
    if let Some(line) = &frame.notice {
        queue!(stdout, MoveTo(2, row + 4), Print(line))?;
    }
    queue!(
        stdout,
        MoveTo(2, row + 6),
        Print("Space play   ? hint   Enter retry/next   Esc quit")
    )?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_grid_order() {
        assert_eq!(action_for(KeyCode::Char('1'), 4), Some(Action::Press(0)));
        assert_eq!(action_for(KeyCode::Char('4'), 4), Some(Action::Press(3)));
        assert_eq!(action_for(KeyCode::Char('q'), 8), Some(Action::Press(4)));
        assert_eq!(action_for(KeyCode::Char('Q'), 8), Some(Action::Press(4)));
        assert_eq!(action_for(KeyCode::Char(','), 32), Some(Action::Press(31)));
    }

    #[test]
    fn keys_beyond_button_count_do_nothing() {
        assert_eq!(action_for(KeyCode::Char('q'), 4), None);
        assert_eq!(action_for(KeyCode::Char('3'), 2), None);
    }

    #[test]
    fn toolbar_keys() {
        assert_eq!(action_for(KeyCode::Char(' '), 4), Some(Action::Play));
        assert_eq!(action_for(KeyCode::Char('?'), 4), Some(Action::Hint));
        assert_eq!(action_for(KeyCode::Char('/'), 4), Some(Action::Hint));
        assert_eq!(action_for(KeyCode::Enter, 4), Some(Action::Advance));
        assert_eq!(action_for(KeyCode::Esc, 4), Some(Action::Quit));
    }

    #[test]
    fn button_keys_are_unique() {
        for (i, k) in BUTTON_KEYS.iter().enumerate() {
            assert!(!BUTTON_KEYS[i + 1..].contains(k), "duplicate key {k}");
            assert!(!['?', '/', ' '].contains(k));
        }
        assert_eq!(button_key(5), 'w');
        assert_eq!(button_key(40), '?');
    }

    #[test]
    fn next_level_uses_latest_progress() {
        let ctx = LevelContext::with_progress(3, 3, 3);
        let resp = SubmitResponse {
            current_level: 4,
            unlock_level: 4,
            coupons: Vec::new(),
        };
        let next = next_context(&ctx, Some(&resp));
        assert_eq!(next, LevelContext::with_progress(4, 4, 4));
        assert!(!next.is_locked());

        // Without a fresh submission the old unlock level applies
        assert!(next_context(&ctx, None).is_locked());
    }

    #[test]
    fn practice_never_locks() {
        let next = next_context(&LevelContext::practice(9), None);
        assert_eq!(next.level, 10);
        assert!(!next.is_locked());
    }
}
