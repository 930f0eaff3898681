//! shterm - an interactive shell terminal
//!
//! Runs builtin commands in cancellable workers while the prompt stays
//! editable: output and typed text share one screen, and Ctrl+C stops the
//! foreground command wherever it is blocked.
//!
//! # Quick Start
//!
//! ```text
//! shterm                    # Interactive session in the current terminal
//! shterm --checkpoint       # Cooperative cancellation only
//! echo "echo hi" | shterm --headless
//! ```
//!
//! # Keybindings
//!
//! | Key | Action |
//! |-----|--------|
//! | Enter | Run the line |
//! | Tab | Complete the command name |
//! | Ctrl+C | Interrupt the foreground command |
//! | Ctrl+D | Send end of input |
//! | Ctrl+W | Delete the previous word |
//! | Ctrl+U | Clear the line |
//! | Ctrl+V | Paste from the clipboard |
//! | Ctrl+Q | Quit |

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{self, Event};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shterm::config::{self, Config};
use shterm::core::input::EditRange;
use shterm::core::intake::EOF_MARKER;
use shterm::core::screen::Render;
use shterm::core::worker::CancelStrategy;
use shterm::ui::{EditorAction, KeyMapper, MemoryCanvas, TerminalCanvas};
use shterm::{Session, SessionControl, SessionOptions};

/// Command line options
#[derive(Default)]
struct Args {
    /// Explicit config file
    config_path: Option<PathBuf>,
    /// Force the checkpoint cancellation strategy
    checkpoint: bool,
    /// Read lines from stdin and print the final screen
    headless: bool,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time a cancelled command gets to unwind on exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How long a headless line may run before the next one is typed ahead
const HEADLESS_STEP: Duration = Duration::from_millis(200);

/// How long headless mode waits for the last command
const HEADLESS_TIMEOUT: Duration = Duration::from_secs(10);

fn print_version() {
    eprintln!("shterm {}", VERSION);
}

fn print_help() {
    eprintln!("shterm {} - An interactive shell terminal", VERSION);
    eprintln!();
    eprintln!("Usage: shterm [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>   Use this config file");
    eprintln!("      --checkpoint      Cancel commands at checkpoints only");
    eprintln!("      --headless        Read lines from stdin, print the final screen");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keybindings:");
    eprintln!("  Enter                 Run the line");
    eprintln!("  Tab                   Complete the command name");
    eprintln!("  Ctrl+C                Interrupt the foreground command");
    eprintln!("  Ctrl+D                Send end of input");
    eprintln!("  Ctrl+W, Alt+Backspace Delete the previous word");
    eprintln!("  Ctrl+U                Clear the line");
    eprintln!("  Ctrl+V                Paste from the clipboard");
    eprintln!("  Ctrl+Q                Quit");
    eprintln!();
    eprintln!("Configuration: ~/.shterm/config.toml");
    eprintln!("Log file: ~/.shterm/shterm.log (level from RUST_LOG or log_level)");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing config path".to_string());
                }
                parsed.config_path = Some(PathBuf::from(&args[i]));
            }
            "--checkpoint" => {
                parsed.checkpoint = true;
            }
            "--headless" => {
                parsed.headless = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(parsed)
}

/// Log to `~/.shterm/shterm.log`; never to the painted terminal.
fn init_logging(level: &str) {
    let log_path = config::config_dir()
        .map(|dir| dir.join("shterm.log"))
        .unwrap_or_else(|| PathBuf::from("shterm.log"));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load(),
    };
    if args.checkpoint {
        config.system.cancel_strategy = CancelStrategy::Checkpoint;
    }

    init_logging(&config.log_level);
    info!("shterm {} starting...", VERSION);

    let options = SessionOptions::from(&config);
    if args.headless {
        run_headless(&options)
    } else {
        run_terminal(&options)
    }
}

/// Interactive session in the controlling terminal
fn run_terminal(options: &SessionOptions) -> anyhow::Result<()> {
    let canvas = TerminalCanvas::new().context("setting up the terminal")?;
    let mut session = Session::new(options, Box::new(canvas))?;
    session.start();

    let result = run_main_loop(&mut session);
    if let Err(e) = &result {
        error!("Main loop failed: {}", e);
    }

    // Restores the terminal before anything is printed
    session.shutdown(SHUTDOWN_GRACE);
    result
}

fn run_main_loop(session: &mut Session) -> anyhow::Result<()> {
    let poll_timeout = Duration::from_millis(50);

    loop {
        if !event::poll(poll_timeout)? {
            continue;
        }

        match event::read()? {
            Event::Key(key) => {
                let Some(action) = KeyMapper::map(&key) else {
                    continue;
                };
                if action == EditorAction::Paste {
                    paste_clipboard(session);
                    continue;
                }
                if session.apply(&action) == SessionControl::Quit {
                    info!("Quit requested");
                    break;
                }
            }
            Event::Paste(text) => session.paste(&text),
            Event::Resize(cols, rows) => {
                info!("Resized to {}x{}", cols, rows);
                session.renderer().render(true);
            }
            _ => {}
        }
    }

    Ok(())
}

fn paste_clipboard(session: &mut Session) {
    match arboard::Clipboard::new().and_then(|mut clipboard| clipboard.get_text()) {
        Ok(text) => session.paste(&text),
        Err(e) => warn!("Clipboard read failed: {}", e),
    }
}

/// Feed stdin lines as if typed, then print what the screen shows.
fn run_headless(options: &SessionOptions) -> anyhow::Result<()> {
    let canvas = MemoryCanvas::new();
    let mut session = Session::new(options, Box::new(canvas.clone()))?;
    session.start();

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        session.input().feed(EditRange::BufferEnd, &format!("{}\n", line));
        // A command still running after this reads the next lines as input
        session.runtime().wait_idle(HEADLESS_STEP);
    }
    session
        .input()
        .feed(EditRange::BufferEnd, &EOF_MARKER.to_string());

    if !session.runtime().wait_idle(HEADLESS_TIMEOUT) {
        warn!("Headless command did not finish, interrupting");
    }
    session.shutdown(SHUTDOWN_GRACE);

    let text = session.screen().text();
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", text)?;
    info!("Headless run painted {} frames", canvas.paints());
    Ok(())
}
