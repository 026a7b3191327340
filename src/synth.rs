use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::AudioError;
use crate::note::Note;

/// How long to wait before trying to open a device that failed to open.
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

/// Anything that can sound a note. Calls return immediately; tones overlap freely.
pub trait TonePlayer: Send + Sync {
    fn play(&self, note: &Note, duration: Duration);
}

/// Plays nothing. Used for `--mute` and wherever sound is irrelevant.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentTones;

impl TonePlayer for SilentTones {
    fn play(&self, note: &Note, duration: Duration) {
        trace!(note = %note, ?duration, "muted tone");
    }
}

/// Amplitude envelope: linear attack, flat hold, exponential tail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub attack: Duration,
    pub sustain_level: f32,
    /// Fraction of the tone held at `sustain_level` before decaying.
    pub hold_ratio: f32,
    /// Level the exponential tail reaches at the end of the tone.
    pub floor: f32,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            attack: Duration::from_millis(10),
            sustain_level: 0.3,
            hold_ratio: 0.7,
            floor: 0.001,
        }
    }
}

impl Envelope {
    /// Gain at `t` seconds into a tone lasting `duration` seconds.
    pub fn amplitude(&self, t: f32, duration: f32) -> f32 {
        if t < 0.0 || t >= duration {
            return 0.0;
        }
        let hold_end = duration * self.hold_ratio;
        let attack = self.attack.as_secs_f32().min(hold_end);
        if t < attack {
            return self.sustain_level * t / attack;
        }
        if t < hold_end {
            return self.sustain_level;
        }
        let tail = duration - hold_end;
        if tail <= 0.0 || self.sustain_level <= 0.0 {
            return 0.0;
        }
        let progress = (t - hold_end) / tail;
        self.sustain_level * (self.floor / self.sustain_level).powf(progress)
    }
}

/// One sounding tone: a triangle oscillator shaped by an envelope.
#[derive(Debug, Clone)]
pub struct Voice {
    freq: f32,
    sample_rate: f32,
    phase: f32,
    position: u64,
    total: u64,
    duration_secs: f32,
    envelope: Envelope,
}

impl Voice {
    pub fn new(freq: f64, duration: Duration, sample_rate: f32, envelope: Envelope) -> Self {
        let duration_secs = duration.as_secs_f32();
        Self {
            freq: freq as f32,
            sample_rate,
            phase: 0.0,
            position: 0,
            total: (duration_secs * sample_rate).round() as u64,
            duration_secs,
            envelope,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.total
    }

    pub fn next_sample(&mut self) -> f32 {
        if self.is_finished() {
            return 0.0;
        }
        let t = self.position as f32 / self.sample_rate;
        let amp = self.envelope.amplitude(t, self.duration_secs);
        let value = triangle(self.phase) * amp;

        self.phase += self.freq / self.sample_rate;
        self.phase -= self.phase.floor();
        self.position += 1;
        value
    }
}

fn triangle(phase: f32) -> f32 {
    1.0 - 4.0 * (phase - 0.5).abs()
}

/// Sums every live voice; runs inside the audio callback.
struct Mixer {
    incoming: Receiver<Voice>,
    voices: Vec<Voice>,
    volume: f32,
}

impl Mixer {
    fn new(incoming: Receiver<Voice>, volume: f32) -> Self {
        Self {
            incoming,
            voices: Vec::with_capacity(32),
            volume,
        }
    }

    /// Pick up tones queued since the last buffer (non-blocking).
    fn admit(&mut self) {
        self.voices.extend(self.incoming.try_iter());
    }

    fn next_sample(&mut self) -> f32 {
        if self.voices.is_empty() {
            return 0.0;
        }
        let mut value = 0.0_f32;
        for voice in &mut self.voices {
            value += voice.next_sample();
        }
        self.voices.retain(|v| !v.is_finished());
        (value * self.volume).clamp(-1.0, 1.0)
    }
}

enum Control {
    Resume,
    Shutdown,
}

/// Handle to the output device.
///
/// The cpal stream lives on its own thread so the handle can be shared
/// between the console and playback threads. Dropping the handle stops it.
pub struct AudioOutput {
    voice_tx: Sender<Voice>,
    control_tx: Sender<Control>,
    sample_rate: f32,
    thread: Option<JoinHandle<()>>,
}

impl AudioOutput {
    pub fn open(volume: f32) -> Result<Self, AudioError> {
        let (voice_tx, voice_rx) = unbounded::<Voice>();
        let (control_tx, control_rx) = unbounded::<Control>();
        let (ready_tx, ready_rx) = bounded::<Result<f32, AudioError>>(1);

        let thread = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let (stream, sample_rate) = match build_output(voice_rx, volume) {
                    Ok(opened) => opened,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(sample_rate));

                for control in control_rx.iter() {
                    match control {
                        Control::Resume => {
                            if let Err(err) = stream.play() {
                                debug!(%err, "failed to resume audio stream");
                            }
                        }
                        Control::Shutdown => break,
                    }
                }
                drop(stream);
            })
            .map_err(|e| AudioError::BuildStream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Self {
                voice_tx,
                control_tx,
                sample_rate,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Disconnected)
            }
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Restart a paused stream. Harmless when already running.
    pub fn resume(&self) {
        let _ = self.control_tx.send(Control::Resume);
    }

    fn submit(&self, voice: Voice) -> Result<(), AudioError> {
        self.voice_tx
            .send(voice)
            .map_err(|_| AudioError::Disconnected)
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_output(voices: Receiver<Voice>, volume: f32) -> Result<(Stream, f32), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Config(e.to_string()))?;

    let sample_rate = supported.sample_rate() as f32;
    let channels = supported.channels() as usize;
    let config: StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, voices, channels, volume)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, voices, channels, volume)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, voices, channels, volume)?,
        fmt => return Err(AudioError::UnsupportedFormat(format!("{fmt:?}"))),
    };

    stream
        .play()
        .map_err(|e| AudioError::PlayStream(e.to_string()))?;

    Ok((stream, sample_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    voices: Receiver<Voice>,
    channels: usize,
    volume: f32,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut mixer = Mixer::new(voices, volume);
    let channels = channels.max(1);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixer.admit();
                for frame in data.chunks_mut(channels) {
                    let value = T::from_sample(mixer.next_sample());
                    for sample in frame.iter_mut() {
                        *sample = value;
                    }
                }
            },
            |err| warn!(%err, "audio stream error"),
            None,
        )
        .map_err(|e| AudioError::BuildStream(e.to_string()))
}

enum OutputState {
    Closed { last_failure: Option<Instant> },
    Ready(AudioOutput),
}

impl OutputState {
    fn reopen_due(&self) -> bool {
        match self {
            OutputState::Ready(_) => false,
            OutputState::Closed { last_failure } => {
                last_failure.is_none_or(|at| at.elapsed() >= REOPEN_BACKOFF)
            }
        }
    }
}

/// State shared with the background opener thread.
struct Shared {
    output: Mutex<OutputState>,
    opening: AtomicBool,
    warned: AtomicBool,
    volume: f32,
}

impl Shared {
    /// Open the device without holding the output lock, then publish it.
    fn open_now(&self) -> bool {
        let opened = AudioOutput::open(self.volume);
        let mut output = self.output.lock();
        match opened {
            Ok(out) => {
                info!(sample_rate = out.sample_rate(), "audio output opened");
                *output = OutputState::Ready(out);
                true
            }
            Err(err) => {
                if self.warned.swap(true, Ordering::Relaxed) {
                    debug!(%err, "audio output still unavailable");
                } else {
                    warn!(%err, "audio output unavailable, continuing without sound");
                }
                *output = OutputState::Closed {
                    last_failure: Some(Instant::now()),
                };
                false
            }
        }
    }
}

/// Turns notes into sound on the default output device.
///
/// The device is opened on first use, not at construction, so a synth can be
/// created before audio is allowed. `play` never waits for the device: while
/// it is closed or busy the tone is dropped and an open is started in the
/// background. Failures are logged; callers never see them.
pub struct ToneSynth {
    shared: Arc<Shared>,
    envelope: Envelope,
}

impl ToneSynth {
    pub fn new(envelope: Envelope, volume: f32) -> Self {
        Self {
            shared: Arc::new(Shared {
                output: Mutex::new(OutputState::Closed { last_failure: None }),
                opening: AtomicBool::new(false),
                warned: AtomicBool::new(false),
                volume: volume.clamp(0.0, 1.0),
            }),
            envelope,
        }
    }

    /// Open (or resume) the output, waiting for the device. Safe to call any
    /// number of times.
    pub fn ensure_ready(&self) -> bool {
        {
            let output = self.shared.output.lock();
            if let OutputState::Ready(out) = &*output {
                out.resume();
                return true;
            }
            if !output.reopen_due() {
                return false;
            }
        }
        if self.shared.opening.swap(true, Ordering::AcqRel) {
            return false;
        }
        let ready = self.shared.open_now();
        self.shared.opening.store(false, Ordering::Release);
        ready
    }

    fn open_in_background(&self) {
        if self.shared.opening.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("audio-open".into())
            .spawn(move || {
                shared.open_now();
                shared.opening.store(false, Ordering::Release);
            });
        if let Err(err) = spawned {
            debug!(%err, "failed to spawn audio opener");
            self.shared.opening.store(false, Ordering::Release);
        }
    }
}

impl TonePlayer for ToneSynth {
    fn play(&self, note: &Note, duration: Duration) {
        let Some(mut output) = self.shared.output.try_lock() else {
            debug!(note = %note, "audio output busy, tone dropped");
            return;
        };
        if !matches!(&*output, OutputState::Ready(_)) {
            let due = output.reopen_due();
            drop(output);
            if due {
                self.open_in_background();
            }
            debug!(note = %note, "audio output not ready, tone dropped");
            return;
        }
        let sent = match &*output {
            OutputState::Ready(out) => {
                out.resume();
                out.submit(Voice::new(note.frequency(), duration, out.sample_rate(), self.envelope))
            }
            OutputState::Closed { .. } => return,
        };
        if let Err(err) = sent {
            debug!(%err, note = %note, "tone dropped");
            *output = OutputState::Closed {
                last_failure: Some(Instant::now()),
            };
        }
    }
}
