//! Builds the cue timeline for a level sheet and plays it back on a worker thread.
//!
//! Cues carry the delay since the previous cue rather than an absolute time,
//! so each step is scheduled relative to when the last one actually fired.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::note::Note;
use crate::synth::TonePlayer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackTiming {
    /// Pause before the first note.
    pub lead_in: Duration,
    /// Share of each beat a note stays lit and sounding.
    pub active_ratio: f64,
}

impl Default for PlaybackTiming {
    fn default() -> Self {
        Self {
            lead_in: Duration::from_millis(500),
            active_ratio: 0.7,
        }
    }
}

/// Time between note onsets at the given tempo.
pub fn step_interval(tempo_bpm: u32) -> Duration {
    Duration::from_secs_f64(60.0 / tempo_bpm.max(1) as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    NoteOn { step: usize, button: usize, note: Note },
    NoteOff,
    /// Clears the highlight and ends the run.
    Complete,
}

/// One scheduled cue: wait `delay` after the previous cue, then fire.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCue {
    pub delay: Duration,
    pub cue: Cue,
}

/// Build the cue list for a sheet whose notes map onto `buttons`.
pub fn build_cues(
    sheet: &[Note],
    buttons: &[usize],
    tempo_bpm: u32,
    timing: PlaybackTiming,
) -> Vec<ScheduledCue> {
    let interval = step_interval(tempo_bpm);
    let active = interval.mul_f64(timing.active_ratio.clamp(0.0, 1.0));
    let gap = interval.saturating_sub(active);

    let steps = sheet.len().min(buttons.len());
    if steps == 0 {
        return vec![ScheduledCue {
            delay: timing.lead_in,
            cue: Cue::Complete,
        }];
    }

    let mut cues = Vec::with_capacity(steps * 2);
    for (step, (note, &button)) in sheet.iter().zip(buttons).enumerate() {
        cues.push(ScheduledCue {
            delay: if step == 0 { timing.lead_in } else { gap },
            cue: Cue::NoteOn {
                step,
                button,
                note: note.clone(),
            },
        });
        cues.push(ScheduledCue {
            delay: active,
            cue: if step + 1 == steps {
                Cue::Complete
            } else {
                Cue::NoteOff
            },
        });
    }
    cues
}

/// Receives what the playback run wants shown.
pub trait PlaybackSink: Send + 'static {
    fn highlight(&mut self, button: Option<usize>);
    fn complete(&mut self);
}

/// Waits between cues. Swapped for a manual clock in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Shared "cancelled" flag checked before every cue.
///
/// Callbacks run while the flag is held, so once `cancel` returns no callback
/// is still running and none will start.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Mutex<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.0.lock() = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.lock()
    }

    /// Run `f` unless cancelled. Returns whether it ran.
    pub fn unless_cancelled(&self, f: impl FnOnce()) -> bool {
        let cancelled = self.0.lock();
        if *cancelled {
            return false;
        }
        f();
        true
    }
}

/// Returned by [`PlaybackScheduler::play`]. Dropping it does not stop playback.
pub struct PlaybackHandle {
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Block until the worker exits.
    #[cfg(test)]
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Plays one sheet at a time; starting a new run cancels the previous one.
pub struct PlaybackScheduler {
    tones: Arc<dyn TonePlayer>,
    sleeper: Arc<dyn Sleeper>,
    timing: PlaybackTiming,
    current: Option<CancelToken>,
}

impl PlaybackScheduler {
    pub fn new(tones: Arc<dyn TonePlayer>, sleeper: Arc<dyn Sleeper>, timing: PlaybackTiming) -> Self {
        Self {
            tones,
            sleeper,
            timing,
            current: None,
        }
    }

    pub fn play<S: PlaybackSink>(
        &mut self,
        sheet: &[Note],
        buttons: &[usize],
        tempo_bpm: u32,
        sink: S,
    ) -> PlaybackHandle {
        self.cancel();

        let cues = build_cues(sheet, buttons, tempo_bpm, self.timing);
        let tone_len = step_interval(tempo_bpm).mul_f64(self.timing.active_ratio.clamp(0.0, 1.0));
        let token = CancelToken::new();
        self.current = Some(token.clone());

        debug!(steps = sheet.len(), tempo_bpm, "playback started");

        let worker = Worker {
            cues,
            token: token.clone(),
            sleeper: Arc::clone(&self.sleeper),
            tones: Arc::clone(&self.tones),
            tone_len,
        };
        let thread = thread::Builder::new()
            .name("playback".into())
            .spawn(move || worker.run(sink));

        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                error!(%err, "failed to spawn playback thread");
                token.cancel();
                None
            }
        };

        PlaybackHandle { token, thread }
    }

    /// Stop the run in flight, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.current.take() {
            if !token.is_cancelled() {
                debug!("playback cancelled");
            }
            token.cancel();
        }
    }
}

struct Worker {
    cues: Vec<ScheduledCue>,
    token: CancelToken,
    sleeper: Arc<dyn Sleeper>,
    tones: Arc<dyn TonePlayer>,
    tone_len: Duration,
}

impl Worker {
    fn run<S: PlaybackSink>(self, mut sink: S) {
        for scheduled in self.cues {
            if self.token.is_cancelled() {
                return;
            }
            self.sleeper.sleep(scheduled.delay);
            let fired = self.token.unless_cancelled(|| match &scheduled.cue {
                Cue::NoteOn { button, note, .. } => {
                    sink.highlight(Some(*button));
                    self.tones.play(note, self.tone_len);
                }
                Cue::NoteOff => sink.highlight(None),
                Cue::Complete => {
                    sink.highlight(None);
                    sink.complete();
                }
            });
            if !fired {
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use parking_lot::Mutex;

    /// Advances a virtual clock instead of sleeping.
    #[derive(Default)]
    pub struct VirtualSleeper {
        pub elapsed: Mutex<Duration>,
    }

    impl Sleeper for VirtualSleeper {
        fn sleep(&self, duration: Duration) {
            *self.elapsed.lock() += duration;
        }
    }

    /// Blocks every sleep until the test sends a tick. Returns at once when
    /// the tick sender is dropped.
    pub struct GatedSleeper {
        ticks: Receiver<()>,
    }

    impl GatedSleeper {
        pub fn new() -> (Self, Sender<()>) {
            let (tx, rx) = unbounded();
            (Self { ticks: rx }, tx)
        }
    }

    impl Sleeper for GatedSleeper {
        fn sleep(&self, _duration: Duration) {
            let _ = self.ticks.recv();
        }
    }

    #[derive(Default)]
    pub struct RecordingTones {
        pub played: Mutex<Vec<(String, Duration)>>,
    }

    impl TonePlayer for RecordingTones {
        fn play(&self, note: &Note, duration: Duration) {
            self.played.lock().push((note.to_string(), duration));
        }
    }
}
