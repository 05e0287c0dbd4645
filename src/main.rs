use std::{
    borrow::Cow,
    io, mem,
    os::fd::{FromRawFd, OwnedFd},
    path::PathBuf,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use clap::{Parser, ValueHint};
use error_stack::Report;
use log::{debug, error, info};
use rustix::{
    event::epoll,
    io::Errno,
    net::{self, Shutdown},
};
use thiserror::Error;
use x11rb::{
    errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError},
    x11_utils::X11Error,
};

use crate::{engine::Engine, history::History, x::X};

mod engine;
mod format;
mod history;
mod ipc;
mod x;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("I/O error: {context}")]
    Io {
        error: io::Error,
        context: Cow<'static, str>,
    },
    #[error("{context}")]
    Internal { context: Cow<'static, str> },
    #[error("failed to connect to X11 server")]
    X11Connect(#[from] ConnectError),
    #[error("X11 request failed")]
    X11Connection(#[from] ConnectionError),
    #[error("X11 reply failed")]
    X11Error(X11Error),
    #[error("failed to create X11 ID")]
    X11IdsExhausted,
    #[error("unsupported X11 version: XFixes extension not available")]
    X11NoXfixes,
}

impl From<X11Error> for CliError {
    fn from(value: X11Error) -> Self {
        Self::X11Error(value)
    }
}

impl From<ReplyError> for CliError {
    fn from(value: ReplyError) -> Self {
        match value {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => e.into(),
        }
    }
}

impl From<ReplyOrIdError> for CliError {
    fn from(value: ReplyOrIdError) -> Self {
        match value {
            ReplyOrIdError::IdsExhausted => Self::X11IdsExhausted,
            ReplyOrIdError::ConnectionError(e) => e.into(),
            ReplyOrIdError::X11Error(e) => e.into(),
        }
    }
}

pub trait IoErr<Out> {
    fn map_io_err<I: Into<Cow<'static, str>>>(self, f: impl FnOnce() -> I) -> Out;
}

impl<T> IoErr<Result<T, CliError>> for Result<T, io::Error> {
    fn map_io_err<I: Into<Cow<'static, str>>>(
        self,
        context: impl FnOnce() -> I,
    ) -> Result<T, CliError> {
        self.map_err(|error| CliError::Io {
            error,
            context: context().into(),
        })
    }
}

impl<T> IoErr<Result<T, CliError>> for rustix::io::Result<T> {
    fn map_io_err<I: Into<Cow<'static, str>>>(
        self,
        context: impl FnOnce() -> I,
    ) -> Result<T, CliError> {
        self.map_err(io::Error::from).map_io_err(context)
    }
}

/// clipclop is a clipboard management daemon for X11. It listens for
/// changes to the clipboard selection and stores them in a bounded
/// in-memory ring; clips are never persisted to disk. A dmenu-style
/// chooser talks to the daemon over the unix socket.
#[derive(Parser, Debug)]
#[command(version)]
#[command(max_term_width = 100)]
#[command(after_help = AFTER_HELP)]
struct Cli {
    /// Location of the socket file.
    #[arg(long, default_value = "/tmp/clipclop.sock")]
    #[arg(value_hint = ValueHint::FilePath)]
    socket: PathBuf,

    /// Number of records to keep in history.
    #[arg(short = 'n', long = "history-size", default_value_t = 100)]
    history_size: usize,

    /// Minimum clip size in bytes; smaller clips are discarded.
    #[arg(short = 'm', long = "min-clip-size", default_value_t = 4)]
    min_clip_size: usize,

    /// Print verbose debugging output.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// A preset string that is always included in the history. May be
    /// repeated; presets do not count towards the history size.
    #[arg(long = "preset", value_name = "TEXT")]
    presets: Vec<String>,
}

const AFTER_HELP: &str = "\
You can interact with clipclop using the unix socket. The available commands are:

  GET        Get a newline-separated list of clips, prefixed with their
             relative age. This is formatted to be fed to dmenu or equivalent.
  SEL <line> Select the clip corresponding to the chosen line (as returned by
             dmenu or equivalent) for pasting.

For an example of how to use this with dmenu, see clip.sh.

Example:

  clipclop -n 200 --preset 'useful command' --socket /tmp/s.sock -v -m 6 &
";

#[derive(Error, Debug)]
enum Wrapper {
    #[error("{0}")]
    W(String),
}

fn main() -> error_stack::Result<(), Wrapper> {
    #[cfg(not(debug_assertions))]
    error_stack::Report::install_debug_hook::<std::panic::Location>(|_, _| {});

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" },
    ))
    .init();

    run(cli).map_err(into_report)
}

fn into_report(cli_err: CliError) -> Report<Wrapper> {
    let wrapper = Wrapper::W(cli_err.to_string());
    match cli_err {
        CliError::Io { error, context } => Report::new(error)
            .attach_printable(context)
            .change_context(wrapper),
        CliError::X11Connect(e) => Report::new(e).change_context(wrapper),
        CliError::X11Connection(e) => Report::new(e).change_context(wrapper),
        CliError::X11Error(e) => Report::new(wrapper).attach_printable(format!("{e:?}")),
        CliError::Internal { .. } | CliError::X11IdsExhausted | CliError::X11NoXfixes => {
            Report::new(wrapper)
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let Cli {
        socket,
        history_size,
        min_clip_size,
        verbose: _,
        presets,
    } = cli;

    info!("Starting clipclop v{}.", env!("CARGO_PKG_VERSION"));

    let history = Arc::new(History::new(history_size, presets));
    let x = Arc::new(X::connect()?);
    let listener = Arc::new(ipc::bind(&socket)?);
    // The signal mask must be in place before the IPC thread spawns so it
    // inherits it.
    let signals = init_signal_fd()?;
    let shutdown = Arc::new(AtomicBool::new(false));

    let ipc_thread = {
        let listener = Arc::clone(&listener);
        let history = Arc::clone(&history);
        let x = Arc::clone(&x);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("ipc".to_owned())
            .spawn(move || ipc::serve(&listener, &history, &x, &shutdown))
            .map_io_err(|| "Failed to spawn IPC thread.")?
    };

    let result = run_event_loop(&x, &history, min_clip_size, &signals);

    info!("Shutting down.");
    shutdown.store(true, Ordering::Relaxed);
    let _ = net::shutdown(&*listener, Shutdown::ReadWrite);
    let _ = ipc_thread.join();
    result
}

fn run_event_loop(
    x: &X,
    history: &Arc<History>,
    min_clip_size: usize,
    signals: &OwnedFd,
) -> Result<(), CliError> {
    const X_CONNECTION: u64 = 0;
    const SIGNALS: u64 = 1;

    let epoll =
        epoll::create(epoll::CreateFlags::empty()).map_io_err(|| "Failed to create epoll.")?;
    epoll::add(
        &epoll,
        x.stream(),
        epoll::EventData::new_u64(X_CONNECTION),
        epoll::EventFlags::IN,
    )
    .map_io_err(|| "Failed to register X11 connection with epoll.")?;
    epoll::add(
        &epoll,
        signals,
        epoll::EventData::new_u64(SIGNALS),
        epoll::EventFlags::IN,
    )
    .map_io_err(|| "Failed to register signal handler with epoll.")?;
    let mut epoll_events = epoll::EventVec::with_capacity(2);

    let mut engine = Engine::new(Arc::clone(history), min_clip_size);

    info!("Starting event loop.");
    loop {
        while let Some(event) = x.poll_event()? {
            debug!("Handling X11 event: {event:?}");
            if let Err(e) = engine.handle_event(x, event) {
                error!("Failed to handle X11 event: {e}");
            }
        }
        x.flush()?;

        match epoll::wait(&epoll, &mut epoll_events, -1) {
            Err(Errno::INTR) => continue,
            r => r.map_io_err(|| "Failed to wait for epoll events.")?,
        }
        for epoll::Event { flags: _, data } in &epoll_events {
            if data.u64() == SIGNALS {
                return Ok(());
            }
        }
    }
}

fn init_signal_fd() -> Result<OwnedFd, CliError> {
    unsafe {
        let mut set = mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut set);

        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGQUIT);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigprocmask(libc::SIG_BLOCK, &set, ptr::null_mut());

        let fd = libc::signalfd(-1, &set, 0);
        if fd < 0 {
            return Err(CliError::Internal {
                context: "Could not create signal fd.".into(),
            });
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}
