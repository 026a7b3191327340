mod api;
mod config;
mod error;
mod game;
mod note;
mod parser;
mod scheduler;
mod session;
mod synth;
mod topology;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, DefaultTempo, LevelProvider, ProgressGateway};
use config::AppConfig;
use note::{LevelSheet, Note};
use parser::SheetFile;
use scheduler::ThreadSleeper;
use session::{GameSession, LevelContext, SessionDeps, SessionSettings};
use synth::{SilentTones, TonePlayer, ToneSynth};
use topology::Topology;

#[derive(Parser)]
#[command(name = "fieldbeat", about = "Listen to a melody, then play it back on a button grid")]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the server base URL
    #[arg(long, global = true)]
    server: Option<String>,

    /// Override the session token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Disable sound
    #[arg(long, global = true)]
    mute: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play a level in the interactive console
    Play {
        /// Level to play (defaults to your current level)
        #[arg(long)]
        level: Option<u32>,

        /// Play a local .sheet file instead of a server level
        #[arg(long, conflicts_with = "level")]
        sheet: Option<PathBuf>,

        /// Do not submit clears to the server
        #[arg(long)]
        practice: bool,
    },

    /// Show the button layout and sequence for a level
    Inspect {
        #[arg(long, required_unless_present = "sheet")]
        level: Option<u32>,

        #[arg(long, conflicts_with = "level")]
        sheet: Option<PathBuf>,
    },

    /// Sound notes through the synth
    Tone {
        #[arg(required = true)]
        notes: Vec<String>,

        /// Length of each tone in milliseconds
        #[arg(long, default_value_t = 300)]
        ms: u64,
    },

    /// Show the leaderboard
    Leaderboard {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },

    /// Start a server session and remember the token
    Login { token: String },
}

fn main() {
    let cli = Cli::parse();

    let mut cfg = AppConfig::load_or_default(&cli.config);
    if let Some(server) = cli.server.clone() {
        cfg.server.base_url = server;
    }
    if let Some(token) = cli.token.clone() {
        cfg.server.token = Some(token);
    }
    if cli.mute {
        cfg.audio.enabled = false;
    }

    let interactive = matches!(cli.command, Command::Play { .. });
    if let Err(e) = init_logging(&cfg, interactive) {
        eprintln!("Logging disabled: {:#}", e);
    }

    if let Err(e) = run(cli.command, cfg, &cli.config) {
        error!(error = %format!("{e:#}"), "command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// The console owns the terminal, so interactive runs log to a file.
fn init_logging(cfg: &AppConfig, to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldbeat=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if to_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.log.file)
            .with_context(|| format!("cannot open log file {}", cfg.log.file.display()))?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
    Ok(())
}

fn run(command: Command, cfg: AppConfig, config_path: &Path) -> Result<()> {
    match command {
        Command::Play {
            level,
            sheet,
            practice,
        } => play(&cfg, level, sheet, practice),
        Command::Inspect { level, sheet } => inspect(&cfg, level, sheet),
        Command::Tone { notes, ms } => tone(&cfg, &notes, Duration::from_millis(ms)),
        Command::Leaderboard { page } => leaderboard(&cfg, page),
        Command::Login { token } => login(cfg, config_path, &token),
    }
}

fn client(cfg: &AppConfig) -> ApiClient {
    ApiClient::new(
        cfg.server.base_url.clone(),
        cfg.server.token.clone(),
        cfg.server.timeout(),
    )
}

fn tones(cfg: &AppConfig) -> Arc<dyn TonePlayer> {
    if !cfg.audio.enabled {
        return Arc::new(SilentTones);
    }
    let synth = ToneSynth::new(cfg.audio.envelope(), cfg.audio.volume);
    synth.ensure_ready();
    Arc::new(synth)
}

fn play(cfg: &AppConfig, level: Option<u32>, sheet: Option<PathBuf>, practice: bool) -> Result<()> {
    let (ctx, levels, gateway): (LevelContext, Arc<dyn LevelProvider>, Option<Arc<dyn ProgressGateway>>) =
        match sheet {
            Some(path) => {
                let sheet = parser::load(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let ctx = LevelContext::practice(sheet.level);
                let levels: Arc<dyn LevelProvider> =
                    Arc::new(DefaultTempo::new(SheetFile::new(sheet), cfg.playback.default_tempo));
                (ctx, levels, None)
            }
            None => {
                let client = Arc::new(client(cfg));
                let levels: Arc<dyn LevelProvider> =
                    Arc::new(DefaultTempo::new(Arc::clone(&client), cfg.playback.default_tempo));
                if practice || !client.has_token() {
                    if !practice {
                        warn!("no session token; playing in practice mode");
                    }
                    (LevelContext::practice(level.unwrap_or(1)), levels, None)
                } else {
                    let user = client.me().context("failed to load profile")?;
                    let level = level.unwrap_or(user.current_level.max(1));
                    let ctx = LevelContext::with_progress(level, user.current_level, user.unlock_level);
                    if ctx.is_locked() {
                        bail!(
                            "level {} is locked (unlocked up to level {})",
                            level,
                            user.unlock_level
                        );
                    }
                    info!(nickname = %user.nickname, level, "profile loaded");
                    let gateway: Arc<dyn ProgressGateway> = client;
                    (ctx, levels, Some(gateway))
                }
            }
        };

    let sheet = levels
        .level_sheet(ctx.level)
        .with_context(|| format!("failed to load level {}", ctx.level))?;

    let deps = SessionDeps {
        tones: tones(cfg),
        sleeper: Arc::new(ThreadSleeper),
        timing: cfg.playback.timing(),
        gateway,
    };
    let settings = SessionSettings {
        hint_resets_progress: cfg.game.hint_resets_progress,
        feedback: cfg.playback.feedback(),
    };
    let session = GameSession::new(ctx, sheet, deps, settings);
    game::run(session, levels.as_ref())
}

fn load_sheet(cfg: &AppConfig, level: Option<u32>, sheet: Option<PathBuf>) -> Result<LevelSheet> {
    if let Some(path) = sheet {
        return parser::load(&path).with_context(|| format!("failed to read {}", path.display()));
    }
    let level = level.unwrap_or(1);
    DefaultTempo::new(client(cfg), cfg.playback.default_tempo)
        .level_sheet(level)
        .with_context(|| format!("failed to load level {level}"))
}

fn inspect(cfg: &AppConfig, level: Option<u32>, sheet: Option<PathBuf>) -> Result<()> {
    let sheet = load_sheet(cfg, level, sheet)?;
    let topology = Topology::for_level(sheet.level, &sheet.notes);

    println!("Level: {}", sheet.level);
    println!("Tempo: {} BPM", sheet.tempo_bpm);
    println!(
        "Buttons: {} ({}x{} grid)",
        topology.button_count, topology.grid.cols, topology.grid.rows
    );
    println!();
    for index in 0..topology.button_count {
        let note = topology
            .note_for_button(index)
            .map(|n| {
                let pitch = n.pitch();
                format!("{} ({}, midi {}, {:.1} Hz)", n, pitch, pitch.midi(), pitch.frequency())
            })
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{}] {:<7} {}",
            game::button_key(index),
            topology.color(index).name(),
            note
        );
    }
    println!();
    let steps: Vec<String> = sheet
        .notes
        .iter()
        .zip(&topology.sequence)
        .map(|(note, button)| format!("{note}->{}", game::button_key(*button)))
        .collect();
    println!("Sequence: {}", steps.join(" "));
    Ok(())
}

fn tone(cfg: &AppConfig, notes: &[String], duration: Duration) -> Result<()> {
    let player = tones(cfg);
    for spelling in notes {
        let note = Note::new(spelling.as_str());
        let pitch = note.pitch();
        println!("{} -> {} ({:.1} Hz)", note, pitch, pitch.frequency());
        player.play(&note, duration);
        thread::sleep(duration + Duration::from_millis(50));
    }
    Ok(())
}

fn leaderboard(cfg: &AppConfig, page: u32) -> Result<()> {
    let board = client(cfg).leaderboard(page).context("failed to load leaderboard")?;
    println!("Leaderboard (page {})", board.page);
    for entry in &board.rank {
        println!("  {:>4}. {:<20} level {}", entry.rank, entry.nickname, entry.level);
    }
    if !board.around.is_empty() {
        println!();
        for entry in &board.around {
            println!("  {:>4}. {:<20} level {}", entry.rank, entry.nickname, entry.level);
        }
    }
    if let Some(me) = &board.me {
        println!();
        println!("You: #{} at level {}", me.rank, me.level);
    }
    Ok(())
}

fn login(mut cfg: AppConfig, config_path: &Path, token: &str) -> Result<()> {
    let mut client = client(&cfg);
    let user = client.login(token).context("login failed")?;
    println!("Logged in as {} ({})", user.nickname, user.id);
    println!(
        "Current level {}, unlocked up to level {}",
        user.current_level, user.unlock_level
    );

    cfg.server.token = Some(token.to_string());
    cfg.save(config_path)
        .with_context(|| format!("failed to save {}", config_path.display()))?;
    info!(path = %config_path.display(), "session token saved");
    Ok(())
}
