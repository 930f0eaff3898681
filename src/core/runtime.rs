//! Command runtime
//!
//! Turns completed input lines into running workers. One line runs at a time
//! in the foreground; a line made of several `|`-separated stages runs each
//! stage as a child worker of the line's worker, connected by channels.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::completer::{TabHandlers, WordCompleter};
use super::decoder::OutputDecoder;
use super::intake::{ExecutionIntake, IntakeLine, LineReadyHook};
use super::screen::{Render, Screen};
use super::worker::{CancelStrategy, Worker, WorkerContext, WorkerError};

/// Default prompt
pub const DEFAULT_PROMPT: &str = "[shterm]$ ";

/// How often a line worker checks on its pipeline stages
const STAGE_POLL: Duration = Duration::from_millis(10);

/// How long a stage blocks on its input pipe between checkpoints
const PIPE_POLL: Duration = Duration::from_millis(20);

/// Chunks buffered between two pipeline stages
const PIPE_CAPACITY: usize = 64;

/// Attempts made by [`Runtime::interrupt`] when a kill is ambiguous
const INTERRUPT_RETRIES: usize = 64;

/// Exit status reported for a cancelled line
pub const STATUS_CANCELLED: i32 = 130;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("{0}: command not found")]
    NotFound(String),

    #[error("{command}: {message}")]
    Usage { command: String, message: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("broken pipe")]
    BrokenPipe,

    #[error("syntax error near unexpected token '|'")]
    Syntax,
}

impl CommandError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandError::Worker(e) if e.is_cancelled())
    }

    fn usage(command: &str, message: impl Into<String>) -> Self {
        CommandError::Usage {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

/// Where a command reads from
pub enum Stdin {
    /// Lines typed by the user
    Terminal(Arc<ExecutionIntake>),
    /// Output of the previous pipeline stage
    Pipe(Receiver<String>),
    Empty,
}

/// Where a command writes to
pub enum Stdout {
    /// The shared screen, through this thread's own decoder
    Terminal(OutputDecoder),
    /// Input of the next pipeline stage
    Pipe(SyncSender<String>),
}

/// Standard streams of one running command
pub struct CommandIo {
    stdin: Stdin,
    stdout: Stdout,
}

impl CommandIo {
    pub fn new(stdin: Stdin, stdout: Stdout) -> Self {
        Self { stdin, stdout }
    }

    pub fn write(&mut self, text: &str) -> Result<(), CommandError> {
        match &mut self.stdout {
            Stdout::Terminal(decoder) => {
                decoder.feed(text);
                Ok(())
            }
            Stdout::Pipe(tx) => tx
                .send(text.to_string())
                .map_err(|_| CommandError::BrokenPipe),
        }
    }

    /// Next line of input, `None` at end of input.
    pub fn read_line(&mut self, ctx: &WorkerContext) -> Result<Option<String>, CommandError> {
        match &mut self.stdin {
            Stdin::Terminal(intake) => match intake.read_line(ctx)? {
                IntakeLine::Line(line) => Ok(Some(line)),
                IntakeLine::Eof => Ok(None),
            },
            Stdin::Pipe(rx) => loop {
                ctx.checkpoint()?;
                match rx.recv_timeout(PIPE_POLL) {
                    Ok(chunk) => return Ok(Some(chunk)),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Ok(None),
                }
            },
            Stdin::Empty => Ok(None),
        }
    }
}

/// A builtin command: `(ctx, args, io) -> exit status`
pub type Builtin =
    Arc<dyn Fn(&WorkerContext, &[String], &mut CommandIo) -> Result<i32, CommandError> + Send + Sync>;

/// Name to builtin mapping
#[derive(Clone, Default)]
pub struct CommandTable {
    commands: BTreeMap<String, Builtin>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard builtins. `jobs` reports on `foreground`.
    pub fn with_builtins(foreground: Arc<Mutex<Vec<Worker>>>) -> Self {
        let mut table = Self::new();
        table.register("echo", builtin_echo);
        table.register("cat", builtin_cat);
        table.register("upper", builtin_upper);
        table.register("yes", builtin_yes);
        table.register("sleep", builtin_sleep);
        table.register("clear", builtin_clear);
        table.register("color", builtin_color);
        table.register("jobs", move |_ctx: &WorkerContext, _args: &[String], io: &mut CommandIo| {
            let workers = lock_recover(&foreground).clone();
            let mut out = String::new();
            for worker in &workers {
                describe_worker(&mut out, worker, 0);
            }
            io.write(&out)?;
            Ok(0)
        });

        let mut names = table.names();
        names.push("help".to_string());
        names.sort();
        table.register("help", move |_ctx: &WorkerContext, _args: &[String], io: &mut CommandIo| {
            io.write(&format!("{}\n", names.join("  ")))?;
            Ok(0)
        });
        table
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&WorkerContext, &[String], &mut CommandIo) -> Result<i32, CommandError>
            + Send
            + Sync
            + 'static,
    {
        self.commands.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<Builtin> {
        self.commands.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }
}

fn describe_worker(out: &mut String, worker: &Worker, depth: usize) {
    let _ = writeln!(
        out,
        "{:indent$}[{}] {}{}",
        "",
        worker.id(),
        worker.name(),
        if worker.is_killed() { " (killed)" } else { "" },
        indent = depth * 2
    );
    for child in worker.children() {
        describe_worker(out, &child, depth + 1);
    }
}

fn builtin_echo(_ctx: &WorkerContext, args: &[String], io: &mut CommandIo) -> Result<i32, CommandError> {
    io.write(&format!("{}\n", args.join(" ")))?;
    Ok(0)
}

fn builtin_cat(ctx: &WorkerContext, args: &[String], io: &mut CommandIo) -> Result<i32, CommandError> {
    if args.is_empty() {
        while let Some(line) = io.read_line(ctx)? {
            io.write(&line)?;
        }
        return Ok(0);
    }

    for path in args {
        ctx.checkpoint()?;
        let text = std::fs::read_to_string(path).map_err(|source| CommandError::Io {
            path: path.clone(),
            source,
        })?;
        io.write(&text)?;
    }
    Ok(0)
}

fn builtin_upper(ctx: &WorkerContext, _args: &[String], io: &mut CommandIo) -> Result<i32, CommandError> {
    while let Some(line) = io.read_line(ctx)? {
        io.write(&line.to_uppercase())?;
    }
    Ok(0)
}

fn builtin_yes(ctx: &WorkerContext, args: &[String], io: &mut CommandIo) -> Result<i32, CommandError> {
    let line = if args.is_empty() {
        "y\n".to_string()
    } else {
        format!("{}\n", args.join(" "))
    };
    loop {
        ctx.checkpoint()?;
        io.write(&line)?;
        thread::yield_now();
    }
}

fn builtin_sleep(ctx: &WorkerContext, args: &[String], _io: &mut CommandIo) -> Result<i32, CommandError> {
    let arg = args
        .first()
        .ok_or_else(|| CommandError::usage("sleep", "missing operand"))?;
    let secs: f64 = arg
        .parse()
        .ok()
        .filter(|s: &f64| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| CommandError::usage("sleep", format!("invalid time interval '{}'", arg)))?;
    ctx.sleep(Duration::from_secs_f64(secs))?;
    Ok(0)
}

fn builtin_clear(_ctx: &WorkerContext, _args: &[String], io: &mut CommandIo) -> Result<i32, CommandError> {
    io.write("\x1b[c")?;
    Ok(0)
}

fn builtin_color(_ctx: &WorkerContext, _args: &[String], io: &mut CommandIo) -> Result<i32, CommandError> {
    const NAMES: [&str; 8] = [
        "black", "red", "green", "yellow", "blue", "magenta", "cyan", "white",
    ];

    let mut out = String::new();
    for (i, name) in NAMES.iter().enumerate() {
        let _ = write!(out, "\x1b[3{}m{}\x1b[0m ", i, name);
    }
    out.push('\n');
    for (i, name) in NAMES.iter().enumerate() {
        let _ = write!(out, "\x1b[1;9{}m{}\x1b[0m ", i, name);
    }
    out.push('\n');
    out.push_str("\x1b[1mbold\x1b[0m \x1b[3mitalic\x1b[0m \x1b[4munderline\x1b[0m ");
    out.push_str("\x1b[7mreverse\x1b[0m \x1b[9mstrikethrough\x1b[0m\n");
    for step in 0..16u16 {
        let v = step * 16;
        let _ = write!(out, "\x1b[48;2;{};{};{}m \x1b[0m", v, 64, 255 - v);
    }
    out.push('\n');
    io.write(&out)?;
    Ok(0)
}

/// Split a line into pipeline stages of whitespace-separated words.
pub fn parse_pipeline(line: &str) -> Result<Vec<Vec<String>>, CommandError> {
    if line.trim().is_empty() {
        return Ok(Vec::new());
    }
    line.split('|')
        .map(|stage| {
            let words: Vec<String> = stage.split_whitespace().map(str::to_string).collect();
            if words.is_empty() {
                Err(CommandError::Syntax)
            } else {
                Ok(words)
            }
        })
        .collect()
}

/// Runtime options taken from the configuration
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub prompt: String,
    pub strategy: CancelStrategy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            strategy: CancelStrategy::default(),
        }
    }
}

/// Executes completed lines, one foreground line at a time.
pub struct Runtime {
    me: Weak<Runtime>,
    screen: Arc<Screen>,
    renderer: Arc<dyn Render>,
    intake: Arc<ExecutionIntake>,
    hook: LineReadyHook,
    tab: Arc<TabHandlers>,
    commands: CommandTable,
    /// Foreground line workers, innermost last
    stack: Arc<Mutex<Vec<Worker>>>,
    idle: Condvar,
    settings: RuntimeSettings,
    last_status: AtomicI32,
}

impl Runtime {
    pub fn new(
        screen: Arc<Screen>,
        renderer: Arc<dyn Render>,
        intake: Arc<ExecutionIntake>,
        hook: LineReadyHook,
        tab: Arc<TabHandlers>,
        settings: RuntimeSettings,
    ) -> Arc<Self> {
        let stack = Arc::new(Mutex::new(Vec::new()));
        let commands = CommandTable::with_builtins(stack.clone());
        tab.set_idle(Some(Arc::new(WordCompleter::new(commands.names()))));

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            screen,
            renderer,
            intake,
            hook,
            tab,
            commands,
            stack,
            idle: Condvar::new(),
            settings,
            last_status: AtomicI32::new(0),
        })
    }

    pub fn prompt(&self) -> &str {
        &self.settings.prompt
    }

    pub fn strategy(&self) -> CancelStrategy {
        self.settings.strategy
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn last_status(&self) -> i32 {
        self.last_status.load(Ordering::SeqCst)
    }

    /// The innermost foreground worker, if any
    pub fn foreground(&self) -> Option<Worker> {
        self.lock_stack().last().cloned()
    }

    pub fn is_idle(&self) -> bool {
        self.lock_stack().is_empty()
    }

    /// Write text to the screen from the calling thread.
    pub fn write(&self, text: &str) {
        OutputDecoder::new(self.screen.clone(), self.renderer.clone()).feed(text);
    }

    pub fn write_prompt(&self) {
        self.write(&self.settings.prompt);
    }

    /// Wait for the next completed line.
    ///
    /// Registers the one-shot hook, or runs the next line right away when one
    /// is already queued.
    pub fn arm(&self) {
        let me = self.me.clone();
        self.hook.register(move || {
            if let Some(runtime) = me.upgrade() {
                runtime.on_line_ready();
            }
        });
        if self.intake.has_line() {
            self.hook.fire();
        }
    }

    fn on_line_ready(self: &Arc<Self>) {
        match self.intake.take_line() {
            Some(IntakeLine::Line(line)) if !line.trim().is_empty() => {
                if let Err(e) = self.run_line(&line) {
                    self.write(&format!("{}\n", e));
                    self.write_prompt();
                    self.arm();
                }
            }
            Some(IntakeLine::Line(_)) => {
                self.write_prompt();
                self.arm();
            }
            Some(IntakeLine::Eof) => {
                debug!("end of input while idle");
                self.arm();
            }
            None => self.arm(),
        }
    }

    /// Start running `line` in a new foreground worker.
    pub fn run_line(self: &Arc<Self>, line: &str) -> Result<(), CommandError> {
        let runtime = Arc::clone(self);
        let stages = parse_pipeline(line)?;
        let commands = stages
            .iter()
            .map(|argv| {
                self.commands
                    .get(&argv[0])
                    .ok_or_else(|| CommandError::NotFound(argv[0].clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            self.write_prompt();
            self.arm();
            return Ok(());
        }

        let name = stages[0][0].clone();
        info!("Running line: {}", line.trim_end());

        // Held across the spawn so the worker cannot finish before it is recorded
        let mut stack = self.lock_stack();
        self.tab.claim_input(true);
        let started = Arc::new(AtomicBool::new(false));
        let body_started = started.clone();
        let exit_runtime = Arc::clone(self);
        let spawned = Worker::spawn_with_exit_hook(
            name,
            self.settings.strategy,
            // Retires the line even if it was killed before its body ran
            move |worker: &Worker| exit_runtime.finish_line(worker, started.load(Ordering::SeqCst)),
            move |ctx| {
                body_started.store(true, Ordering::SeqCst);
                let result = runtime.run_stages(ctx, stages, commands);
                let status = match result {
                    Ok(status) => status,
                    Err(e) if e.is_cancelled() => {
                        runtime.write("^C\n");
                        STATUS_CANCELLED
                    }
                    Err(e) => {
                        runtime.write(&format!("{}\n", e));
                        1
                    }
                };
                runtime.last_status.store(status, Ordering::SeqCst);
                Ok::<_, CommandError>(status)
            },
        );

        match spawned {
            Ok(handle) => {
                stack.push(handle.worker().clone());
                Ok(())
            }
            Err(e) => {
                drop(stack);
                self.tab.claim_input(!self.is_idle());
                Err(e.into())
            }
        }
    }

    fn run_stages(
        &self,
        ctx: &WorkerContext,
        stages: Vec<Vec<String>>,
        commands: Vec<Builtin>,
    ) -> Result<i32, CommandError> {
        let stdout = Stdout::Terminal(OutputDecoder::new(self.screen.clone(), self.renderer.clone()));
        let stdin = Stdin::Terminal(self.intake.clone());

        if stages.len() == 1 {
            let mut io = CommandIo::new(stdin, stdout);
            return commands[0](ctx, &stages[0][1..], &mut io);
        }

        let count = stages.len();
        let mut next_stdin = stdin;
        let mut last_stdout = Some(stdout);
        let mut handles = Vec::with_capacity(count);

        for (i, (argv, command)) in stages.into_iter().zip(commands).enumerate() {
            let (stdout, following) = if i + 1 == count {
                let stdout = last_stdout.take().ok_or(CommandError::BrokenPipe)?;
                (stdout, Stdin::Empty)
            } else {
                let (tx, rx) = mpsc::sync_channel(PIPE_CAPACITY);
                (Stdout::Pipe(tx), Stdin::Pipe(rx))
            };
            let stdin = std::mem::replace(&mut next_stdin, following);
            let mut io = CommandIo::new(stdin, stdout);

            let handle = ctx.spawn_child(argv[0].clone(), move |ctx| command(ctx, &argv[1..], &mut io))?;
            handles.push(handle);
        }

        let waited = loop {
            if handles.iter().all(|h| h.is_finished()) {
                break Ok(());
            }
            if let Err(e) = ctx.sleep(STAGE_POLL) {
                break Err(e);
            }
        };

        // Stages are already killed on cancellation; let them unwind first
        let mut status = 0;
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.join();
            if i + 1 == count {
                status = match result {
                    Ok(status) => status,
                    Err(e) if waited.is_err() && e.is_cancelled() => STATUS_CANCELLED,
                    Err(e) => return Err(e),
                };
            } else if let Err(e) = result {
                debug!("pipeline stage {} ended: {}", i, e);
            }
        }

        waited?;
        Ok(status)
    }

    /// Cancel the innermost foreground worker.
    ///
    /// Returns whether there was anything to cancel.
    pub fn interrupt(&self) -> Result<bool, WorkerError> {
        let Some(worker) = self.foreground() else {
            return Ok(false);
        };

        let mut result = worker.kill();
        for _ in 0..INTERRUPT_RETRIES {
            match result {
                Err(WorkerError::Ambiguous(_)) => {
                    thread::yield_now();
                    result = worker.kill();
                }
                _ => break,
            }
        }
        if let Err(e) = &result {
            warn!("Interrupt of worker {} failed: {}", worker.id(), e);
        }
        result.map(|_| true)
    }

    /// Block until no foreground worker is running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stack = self.lock_stack();
        while !stack.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stack = self
                .idle
                .wait_timeout(stack, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
        true
    }

    /// Write the prompt, wait for the next line and drop `worker` from the
    /// foreground. `started` is false when the line was killed before its
    /// body ran.
    fn finish_line(&self, worker: &Worker, started: bool) {
        if !started {
            self.write("^C\n");
            self.last_status.store(STATUS_CANCELLED, Ordering::SeqCst);
        }
        self.write_prompt();
        self.arm();
        {
            let mut stack = self.lock_stack();
            stack.retain(|w| w.id() != worker.id());
            self.tab.claim_input(!stack.is_empty());
        }
        self.idle.notify_all();
    }

    fn lock_stack(&self) -> MutexGuard<'_, Vec<Worker>> {
        lock_recover(&self.stack)
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
