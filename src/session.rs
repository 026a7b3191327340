//! One level visit: phase lifecycle, input judging and clear submission.
//!
//! The session is the only owner of its state. Playback, press feedback,
//! toolbar requests and gateway results all arrive as [`SessionEvent`]s on a
//! channel and are applied on the caller's thread by [`GameSession::pump`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::api::{ProgressGateway, SubmitResponse};
use crate::note::LevelSheet;
use crate::scheduler::{PlaybackHandle, PlaybackScheduler, PlaybackSink, PlaybackTiming, Sleeper};
use crate::synth::TonePlayer;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Playing,
    Input,
    Success,
    Fail,
}

impl Phase {
    pub fn can_play(self) -> bool {
        matches!(self, Phase::Idle | Phase::Fail)
    }

    pub fn can_hint(self) -> bool {
        matches!(self, Phase::Idle | Phase::Input | Phase::Fail)
    }
}

/// Toolbar requests. `seq` only ever grows; a repeated value is a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play { seq: u64 },
    Hint { seq: u64 },
}

#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    Highlight { run: u64, button: Option<usize> },
    PlaybackDone { run: u64 },
    Submitted {
        round: u64,
        outcome: Result<SubmitResponse, String>,
    },
    FeedbackOff { press: u64 },
}

/// Play/hint buttons living outside the session.
pub struct Toolbar {
    tx: Sender<SessionEvent>,
    play_seq: u64,
    hint_seq: u64,
}

impl Toolbar {
    pub fn request_play(&mut self) {
        self.play_seq += 1;
        let _ = self.tx.send(SessionEvent::Command(Command::Play { seq: self.play_seq }));
    }

    pub fn request_hint(&mut self) {
        self.hint_seq += 1;
        let _ = self.tx.send(SessionEvent::Command(Command::Hint { seq: self.hint_seq }));
    }

    pub fn reset(&mut self) {
        self.play_seq = 0;
        self.hint_seq = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current_level: u32,
    pub unlock_level: u32,
}

/// Which level is being played and where the player stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelContext {
    pub level: u32,
    /// `None` in practice mode; such sessions never submit.
    pub progress: Option<Progress>,
}

impl LevelContext {
    pub fn practice(level: u32) -> Self {
        Self {
            level,
            progress: None,
        }
    }

    pub fn with_progress(level: u32, current_level: u32, unlock_level: u32) -> Self {
        Self {
            level,
            progress: Some(Progress {
                current_level,
                unlock_level,
            }),
        }
    }

    pub fn is_replay(&self) -> bool {
        self.progress.is_some_and(|p| self.level < p.current_level)
    }

    pub fn is_max_level(&self) -> bool {
        self.progress.is_some_and(|p| self.level >= p.unlock_level)
    }

    pub fn is_locked(&self) -> bool {
        self.progress.is_some_and(|p| self.level > p.unlock_level)
    }

    pub fn submits_progress(&self) -> bool {
        self.progress.is_some() && !self.is_replay() && !self.is_max_level()
    }
}

/// Outcome of the clear submission for the current round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Submission {
    attempted: bool,
    in_flight: bool,
    result: Option<SubmitResponse>,
    error: Option<String>,
}

impl Submission {
    pub fn attempted(&self) -> bool {
        self.attempted
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn result(&self) -> Option<&SubmitResponse> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub hint_resets_progress: bool,
    /// How long a pressed button stays lit and sounds.
    pub feedback: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            hint_resets_progress: false,
            feedback: Duration::from_millis(150),
        }
    }
}

/// What a session needs from the outside world.
pub struct SessionDeps {
    pub tones: Arc<dyn TonePlayer>,
    pub sleeper: Arc<dyn Sleeper>,
    pub timing: PlaybackTiming,
    pub gateway: Option<Arc<dyn ProgressGateway>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOutcome {
    /// Not accepting input; nothing changed.
    Ignored,
    Correct { cursor: usize },
    Cleared,
    Missed,
}

struct SessionSink {
    tx: Sender<SessionEvent>,
    run: u64,
}

impl PlaybackSink for SessionSink {
    fn highlight(&mut self, button: Option<usize>) {
        let _ = self.tx.send(SessionEvent::Highlight {
            run: self.run,
            button,
        });
    }

    fn complete(&mut self) {
        let _ = self.tx.send(SessionEvent::PlaybackDone { run: self.run });
    }
}

pub struct GameSession {
    ctx: LevelContext,
    sheet: LevelSheet,
    topology: Topology,

    phase: Phase,
    cursor: usize,
    highlight: Option<usize>,
    flash: Option<(u64, usize)>,

    /// Playback generation; events from older runs are dropped.
    run: u64,
    /// Bumped on reset; gateway results from older rounds are dropped.
    round: u64,
    presses: u64,
    last_play: u64,
    last_hint: u64,
    submission: Submission,

    settings: SessionSettings,
    scheduler: PlaybackScheduler,
    playback: Option<PlaybackHandle>,
    sleeper: Arc<dyn Sleeper>,
    tones: Arc<dyn TonePlayer>,
    gateway: Option<Arc<dyn ProgressGateway>>,
    tx: Sender<SessionEvent>,
    rx: Receiver<SessionEvent>,
}

impl GameSession {
    pub fn new(ctx: LevelContext, sheet: LevelSheet, deps: SessionDeps, settings: SessionSettings) -> Self {
        let (tx, rx) = unbounded();
        let topology = Topology::for_level(ctx.level, &sheet.notes);
        let scheduler = PlaybackScheduler::new(Arc::clone(&deps.tones), Arc::clone(&deps.sleeper), deps.timing);

        info!(
            level = ctx.level,
            buttons = topology.button_count,
            notes = sheet.len(),
            tempo = sheet.tempo_bpm,
            "session opened"
        );

        Self {
            ctx,
            sheet,
            topology,
            phase: Phase::Idle,
            cursor: 0,
            highlight: None,
            flash: None,
            run: 0,
            round: 0,
            presses: 0,
            last_play: 0,
            last_hint: 0,
            submission: Submission::default(),
            settings,
            scheduler,
            playback: None,
            sleeper: deps.sleeper,
            tones: deps.tones,
            gateway: deps.gateway,
            tx,
            rx,
        }
    }

    pub fn toolbar(&self) -> Toolbar {
        Toolbar {
            tx: self.tx.clone(),
            play_seq: 0,
            hint_seq: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn context(&self) -> &LevelContext {
        &self.ctx
    }

    pub fn sheet(&self) -> &LevelSheet {
        &self.sheet
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    /// Button to draw lit: press feedback wins over playback.
    pub fn active_button(&self) -> Option<usize> {
        self.flash.map(|(_, button)| button).or(self.highlight)
    }

    /// Back to a fresh idle round on the same level.
    pub fn reset(&mut self) {
        self.stop_playback();
        self.run += 1;
        self.round += 1;
        self.phase = Phase::Idle;
        self.cursor = 0;
        self.highlight = None;
        self.flash = None;
        self.last_play = 0;
        self.last_hint = 0;
        self.submission = Submission::default();

        let stale = self.rx.try_iter().count();
        debug!(level = self.ctx.level, stale, "session reset");
    }

    /// Switch to another level. Always resets.
    pub fn change_level(&mut self, ctx: LevelContext, sheet: LevelSheet) {
        self.topology = Topology::for_level(ctx.level, &sheet.notes);
        self.ctx = ctx;
        self.sheet = sheet;
        self.reset();
        info!(
            level = ctx.level,
            buttons = self.topology.button_count,
            notes = self.sheet.len(),
            "level changed"
        );
    }

    /// Start the round from the idle overlay or the toolbar play button.
    pub fn play(&mut self) {
        if !self.phase.can_play() {
            debug!(phase = ?self.phase, "play ignored");
            return;
        }
        self.start_playback(true);
    }

    /// Replay the sequence as a memory aid.
    pub fn hint(&mut self) {
        if !self.phase.can_hint() {
            debug!(phase = ?self.phase, "hint ignored");
            return;
        }
        let keep_cursor = self.phase == Phase::Input && !self.settings.hint_resets_progress;
        self.start_playback(!keep_cursor);
    }

    /// Try again after a miss.
    pub fn retry(&mut self) {
        if self.phase != Phase::Fail {
            debug!(phase = ?self.phase, "retry ignored");
            return;
        }
        self.submission.result = None;
        self.submission.error = None;
        self.start_playback(true);
    }

    pub fn press(&mut self, button: usize) -> PressOutcome {
        if self.phase != Phase::Input || self.submission.in_flight || !self.topology.contains(button) {
            return PressOutcome::Ignored;
        }
        self.feedback(button);

        let Some(expected) = self.topology.expected(self.cursor) else {
            return PressOutcome::Ignored;
        };
        if button != expected {
            info!(level = self.ctx.level, cursor = self.cursor, button, expected, "wrong button");
            self.phase = Phase::Fail;
            return PressOutcome::Missed;
        }

        self.cursor += 1;
        if self.cursor == self.topology.sequence.len() {
            self.complete_round();
            return PressOutcome::Cleared;
        }
        PressOutcome::Correct {
            cursor: self.cursor,
        }
    }

    /// Apply everything queued so far without blocking.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for an event, then apply the rest of the queue.
    pub fn wait(&mut self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle(event);
                1 + self.pump()
            }
            Err(_) => 0,
        }
    }

    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(Command::Play { seq }) => {
                if seq <= self.last_play {
                    debug!(seq, last = self.last_play, "duplicate play request");
                    return;
                }
                self.last_play = seq;
                self.play();
            }
            SessionEvent::Command(Command::Hint { seq }) => {
                if seq <= self.last_hint {
                    debug!(seq, last = self.last_hint, "duplicate hint request");
                    return;
                }
                self.last_hint = seq;
                self.hint();
            }
            SessionEvent::Highlight { run, button } => {
                if run == self.run && self.phase == Phase::Playing {
                    self.highlight = button;
                }
            }
            SessionEvent::PlaybackDone { run } => {
                if run == self.run && self.phase == Phase::Playing {
                    self.highlight = None;
                    self.phase = Phase::Input;
                    debug!(level = self.ctx.level, cursor = self.cursor, "awaiting input");
                }
            }
            SessionEvent::Submitted { round, outcome } => {
                if round != self.round {
                    return;
                }
                self.submission.in_flight = false;
                match outcome {
                    Ok(resp) => {
                        info!(
                            current_level = resp.current_level,
                            unlock_level = resp.unlock_level,
                            coupons = resp.coupons.len(),
                            "clear submitted"
                        );
                        self.submission.result = Some(resp);
                    }
                    Err(message) => {
                        warn!(%message, "clear submission failed");
                        self.submission.error = Some(message);
                    }
                }
            }
            SessionEvent::FeedbackOff { press } => {
                if self.flash.is_some_and(|(latest, _)| latest == press) {
                    self.flash = None;
                }
            }
        }
    }

    fn start_playback(&mut self, reset_cursor: bool) {
        if self.sheet.is_empty() {
            debug!(level = self.ctx.level, "empty sheet, nothing to play");
            return;
        }
        self.run += 1;
        if reset_cursor {
            self.cursor = 0;
        }
        self.phase = Phase::Playing;
        self.highlight = None;
        self.flash = None;

        let sink = SessionSink {
            tx: self.tx.clone(),
            run: self.run,
        };
        self.playback = Some(self.scheduler.play(
            &self.sheet.notes,
            &self.topology.sequence,
            self.sheet.tempo_bpm,
            sink,
        ));
        debug!(level = self.ctx.level, run = self.run, cursor = self.cursor, "sequence playing");
    }

    fn stop_playback(&mut self) {
        if let Some(handle) = self.playback.take() {
            if !handle.is_finished() {
                debug!(run = self.run, "stopping playback");
            }
            handle.cancel();
        }
    }

    fn feedback(&mut self, button: usize) {
        self.presses += 1;
        let press = self.presses;
        self.flash = Some((press, button));
        if let Some(note) = self.topology.note_for_button(button) {
            self.tones.play(note, self.settings.feedback);
        }

        let tx = self.tx.clone();
        let sleeper = Arc::clone(&self.sleeper);
        let delay = self.settings.feedback;
        let spawned = thread::Builder::new()
            .name("feedback".into())
            .spawn(move || {
                sleeper.sleep(delay);
                let _ = tx.send(SessionEvent::FeedbackOff { press });
            });
        if let Err(err) = spawned {
            warn!(%err, "failed to spawn feedback timer");
            self.flash = None;
        }
    }

    fn complete_round(&mut self) {
        self.phase = Phase::Success;
        info!(level = self.ctx.level, "level cleared");

        if !self.ctx.submits_progress() {
            debug!(
                replay = self.ctx.is_replay(),
                max_level = self.ctx.is_max_level(),
                "clear not submitted"
            );
            return;
        }
        if self.submission.attempted {
            debug!("submission already attempted this round");
            return;
        }
        let Some(gateway) = self.gateway.clone() else {
            return;
        };

        self.submission.attempted = true;
        self.submission.in_flight = true;
        let tx = self.tx.clone();
        let round = self.round;
        thread::spawn(move || {
            let outcome = gateway.submit().map_err(|e| e.to_string());
            let _ = tx.send(SessionEvent::Submitted { round, outcome });
        });
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        self.stop_playback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::note::Note;
    use crate::scheduler::testing::{GatedSleeper, RecordingTones, VirtualSleeper};
    use parking_lot::Mutex;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct CountingGateway {
        calls: Mutex<usize>,
        fail: bool,
    }

    impl ProgressGateway for CountingGateway {
        fn submit(&self) -> Result<SubmitResponse, ApiError> {
            *self.calls.lock() += 1;
            if self.fail {
                return Err(ApiError::Status {
                    status: 429,
                    message: "submission too fast".into(),
                });
            }
            Ok(SubmitResponse {
                current_level: 3,
                unlock_level: 5,
                coupons: Vec::new(),
            })
        }
    }

    /// Level 2 has four buttons; E4, C4, F4 land on buttons 1, 3, 2.
    fn sheet() -> LevelSheet {
        let notes = ["E4", "C4", "F4"].into_iter().map(Note::from).collect();
        LevelSheet::new(2, notes, 120)
    }

    fn deps(sleeper: Arc<dyn Sleeper>, gateway: Option<Arc<dyn ProgressGateway>>) -> SessionDeps {
        SessionDeps {
            tones: Arc::new(RecordingTones::default()),
            sleeper,
            timing: PlaybackTiming::default(),
            gateway,
        }
    }

    fn session_with(ctx: LevelContext, gateway: Option<Arc<dyn ProgressGateway>>) -> GameSession {
        GameSession::new(
            ctx,
            sheet(),
            deps(Arc::new(VirtualSleeper::default()), gateway),
            SessionSettings::default(),
        )
    }

    fn practice() -> GameSession {
        session_with(LevelContext::practice(2), None)
    }

    /// Pump until `done` holds or the timeout passes.
    fn settle(session: &mut GameSession, done: impl Fn(&GameSession) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !done(session) {
            assert!(Instant::now() < deadline, "session did not settle");
            session.wait(Duration::from_millis(20));
        }
    }

    fn to_input(session: &mut GameSession) {
        session.play();
        assert_eq!(session.phase(), Phase::Playing);
        settle(session, |s| s.phase() == Phase::Input);
    }

    #[test]
    fn sheet_maps_to_expected_buttons() {
        assert_eq!(practice().topology().sequence, vec![1, 3, 2]);
    }

    #[test]
    fn playback_ends_in_input_with_highlight_cleared() {
        let mut session = practice();
        to_input(&mut session);
        assert_eq!(session.cursor(), 0);
        assert_eq!(session.active_button(), None);
    }

    #[test]
    fn correct_presses_clear_the_level() {
        let mut session = practice();
        to_input(&mut session);
        assert_eq!(session.press(1), PressOutcome::Correct { cursor: 1 });
        assert_eq!(session.press(3), PressOutcome::Correct { cursor: 2 });
        assert_eq!(session.press(2), PressOutcome::Cleared);
        assert_eq!(session.phase(), Phase::Success);
    }

    #[test]
    fn one_wrong_press_fails_the_round() {
        let mut session = practice();
        to_input(&mut session);
        session.press(1);
        session.press(3);
        assert_eq!(session.press(1), PressOutcome::Missed);
        assert_eq!(session.phase(), Phase::Fail);
        assert_eq!(session.press(2), PressOutcome::Ignored);
    }

    #[test]
    fn presses_outside_input_are_ignored() {
        let mut session = practice();
        assert_eq!(session.press(1), PressOutcome::Ignored);
        assert_eq!(session.active_button(), None);
        to_input(&mut session);
        assert_eq!(session.press(9), PressOutcome::Ignored);
        assert_eq!(session.cursor(), 0);
    }

    #[test]
    fn press_feedback_flashes_until_the_sleeper_wakes() {
        let (sleeper, ticks) = GatedSleeper::new();
        let tones = Arc::new(RecordingTones::default());
        let mut session = GameSession::new(
            LevelContext::practice(2),
            sheet(),
            SessionDeps {
                tones: tones.clone(),
                sleeper: Arc::new(sleeper),
                timing: PlaybackTiming::default(),
                gateway: None,
            },
            SessionSettings::default(),
        );

        // Three notes: three note-ons, two note-offs and the completion
        session.play();
        for _ in 0..6 {
            ticks.send(()).unwrap();
        }
        settle(&mut session, |s| s.phase() == Phase::Input);
        let before = tones.played.lock().len();

        session.press(1);
        assert_eq!(session.active_button(), Some(1));
        {
            let played = tones.played.lock();
            assert_eq!(played.len(), before + 1);
            assert_eq!(played[before], ("E4".to_string(), Duration::from_millis(150)));
        }
        session.wait(Duration::from_millis(30));
        assert_eq!(session.active_button(), Some(1), "flash cleared before its timer");

        ticks.send(()).unwrap();
        settle(&mut session, |s| s.active_button().is_none());

        // Wrong press still flashes, but button 0 has no sheet note to sound
        session.press(0);
        assert_eq!(session.phase(), Phase::Fail);
        assert_eq!(session.active_button(), Some(0));
        assert_eq!(tones.played.lock().len(), before + 1);
        ticks.send(()).unwrap();
        settle(&mut session, |s| s.active_button().is_none());
    }

    #[test]
    fn first_clear_submits_exactly_once() {
        let gateway = Arc::new(CountingGateway::default());
        let mut session = session_with(
            LevelContext::with_progress(2, 2, 5),
            Some(gateway.clone() as Arc<dyn ProgressGateway>),
        );
        to_input(&mut session);
        for b in [1, 3, 2] {
            session.press(b);
        }
        assert!(session.submission().in_flight());
        settle(&mut session, |s| !s.submission().in_flight());

        // Duplicate entry into success must not call the gateway again
        session.complete_round();
        session.pump();

        assert_eq!(*gateway.calls.lock(), 1);
        assert_eq!(session.phase(), Phase::Success);
        assert_eq!(session.submission().result().map(|r| r.current_level), Some(3));
    }

    #[test]
    fn gateway_failure_stays_in_success() {
        let gateway = Arc::new(CountingGateway {
            fail: true,
            ..CountingGateway::default()
        });
        let mut session = session_with(
            LevelContext::with_progress(2, 2, 5),
            Some(gateway as Arc<dyn ProgressGateway>),
        );
        to_input(&mut session);
        for b in [1, 3, 2] {
            session.press(b);
        }
        settle(&mut session, |s| !s.submission().in_flight());
        assert_eq!(session.phase(), Phase::Success);
        assert_eq!(session.submission().error(), Some("submission too fast"));
        assert!(session.submission().result().is_none());
    }

    #[test]
    fn replays_and_max_level_do_not_submit() {
        for ctx in [
            LevelContext::with_progress(2, 4, 6),
            LevelContext::with_progress(2, 2, 2),
            LevelContext::practice(2),
        ] {
            let gateway = Arc::new(CountingGateway::default());
            let mut session = session_with(ctx, Some(gateway.clone() as Arc<dyn ProgressGateway>));
            to_input(&mut session);
            for b in [1, 3, 2] {
                session.press(b);
            }
            assert_eq!(session.phase(), Phase::Success);
            assert!(!session.submission().attempted());
            assert_eq!(*gateway.calls.lock(), 0);
        }
    }

    #[test]
    fn hint_during_playback_is_ignored() {
        let (sleeper, ticks) = GatedSleeper::new();
        let mut session = GameSession::new(
            LevelContext::practice(2),
            sheet(),
            deps(Arc::new(sleeper), None),
            SessionSettings::default(),
        );
        let mut toolbar = session.toolbar();

        session.play();
        let run = session.run;
        toolbar.request_hint();
        session.pump();
        assert_eq!(session.phase(), Phase::Playing);
        assert_eq!(session.run, run, "no second playback run");

        drop(ticks);
        settle(&mut session, |s| s.phase() == Phase::Input);
    }

    #[test]
    fn hint_during_input_keeps_progress() {
        let mut session = practice();
        to_input(&mut session);
        session.press(1);

        session.hint();
        assert_eq!(session.phase(), Phase::Playing);
        settle(&mut session, |s| s.phase() == Phase::Input);
        assert_eq!(session.cursor(), 1);
        assert_eq!(session.press(3), PressOutcome::Correct { cursor: 2 });
    }

    #[test]
    fn hint_can_be_configured_to_restart_input() {
        let mut session = GameSession::new(
            LevelContext::practice(2),
            sheet(),
            deps(Arc::new(VirtualSleeper::default()), None),
            SessionSettings {
                hint_resets_progress: true,
                ..SessionSettings::default()
            },
        );
        to_input(&mut session);
        session.press(1);
        session.hint();
        settle(&mut session, |s| s.phase() == Phase::Input);
        assert_eq!(session.cursor(), 0);
    }

    #[test]
    fn hint_after_fail_starts_over() {
        let mut session = practice();
        to_input(&mut session);
        session.press(1);
        session.press(0);
        assert_eq!(session.phase(), Phase::Fail);
        session.hint();
        settle(&mut session, |s| s.phase() == Phase::Input);
        assert_eq!(session.cursor(), 0);
    }

    #[test]
    fn retry_replays_from_the_start() {
        let mut session = practice();
        to_input(&mut session);
        session.press(3);
        assert_eq!(session.phase(), Phase::Fail);

        session.retry();
        assert_eq!(session.phase(), Phase::Playing);
        settle(&mut session, |s| s.phase() == Phase::Input);
        assert_eq!(session.cursor(), 0);
    }

    #[test]
    fn toolbar_requests_are_consumed_once() {
        let mut session = practice();
        let mut toolbar = session.toolbar();
        toolbar.request_play();
        session.pump();
        assert_eq!(session.phase(), Phase::Playing);
        settle(&mut session, |s| s.phase() == Phase::Input);

        session.press(0);
        assert_eq!(session.phase(), Phase::Fail);

        // Same request delivered again: no-op
        session.handle(SessionEvent::Command(Command::Play { seq: 1 }));
        assert_eq!(session.phase(), Phase::Fail);

        toolbar.request_play();
        session.pump();
        assert_eq!(session.phase(), Phase::Playing);
    }

    #[test]
    fn stale_playback_events_are_dropped() {
        let mut session = practice();
        to_input(&mut session);
        let old_run = session.run;
        session.reset();

        session.handle(SessionEvent::Highlight {
            run: old_run,
            button: Some(2),
        });
        session.handle(SessionEvent::PlaybackDone { run: old_run });
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.active_button(), None);
    }

    #[test]
    fn reset_restores_a_fresh_round() {
        let gateway = Arc::new(CountingGateway::default());
        let mut session = session_with(
            LevelContext::with_progress(2, 2, 5),
            Some(gateway.clone() as Arc<dyn ProgressGateway>),
        );
        to_input(&mut session);
        for b in [1, 3, 2] {
            session.press(b);
        }
        settle(&mut session, |s| !s.submission().in_flight());
        session.reset();
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.cursor(), 0);
        assert_eq!(session.submission(), &Submission::default());

        // A late result from the old round is ignored
        session.handle(SessionEvent::Submitted {
            round: session.round - 1,
            outcome: Err("late".into()),
        });
        assert!(session.submission().error().is_none());

        // And the guard is cleared: a new clear submits again
        to_input(&mut session);
        for b in [1, 3, 2] {
            session.press(b);
        }
        settle(&mut session, |s| !s.submission().in_flight());
        assert_eq!(*gateway.calls.lock(), 2);
    }

    #[test]
    fn change_level_rebuilds_topology() {
        let mut session = practice();
        to_input(&mut session);
        let notes = (0..6).map(|i| Note::new(format!("C{i}"))).collect();
        session.change_level(LevelContext::practice(6), LevelSheet::new(6, notes, 100));
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.topology().button_count, 8);
        assert_eq!(session.topology().sequence.len(), 6);
    }

    #[test]
    fn level_context_gating() {
        let ctx = LevelContext::with_progress(3, 3, 5);
        assert!(!ctx.is_replay());
        assert!(!ctx.is_max_level());
        assert!(ctx.submits_progress());

        assert!(LevelContext::with_progress(2, 3, 5).is_replay());
        assert!(LevelContext::with_progress(5, 5, 5).is_max_level());
        assert!(LevelContext::with_progress(6, 5, 5).is_locked());
        assert!(!LevelContext::practice(6).is_locked());
    }
}
