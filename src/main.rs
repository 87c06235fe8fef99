//! mpsync — sync files and stream scripts to MicroPython boards over the
//! serial REPL.
//!
//! The board's interactive prompt is the only interface reachable over the
//! serial line; mpsync turns it into a file-sync and streaming channel.
//!
//! # Commands
//!
//! - `mpsync reset` — reboot the board into a fresh prompt
//! - `mpsync ls /lib` — list a remote directory
//! - `mpsync mkdir | makedirs | rm | rmdir | rmtree <path>` — manage the
//!   remote tree
//! - `mpsync upload <src> <dst>` / `download <src> <dst>` — mirror trees,
//!   with `--contents`, `--overwrite` and `--quick` (size-based skip)
//! - `mpsync execute <line>` — run one line and print its response
//! - `mpsync execute_file <path|->` — stream a script through paste mode
//! - `mpsync live_test_file <path>` — re-stream the script every time the
//!   local file changes, until interrupted
//!
//! The port comes from `--port` or the `MPSYNC_PORT` environment variable.
//! Repeated `-v` flags raise the log level (progress, echo traffic).

mod bridge;
mod errors;
mod literal;
mod remotefs;
mod repl;
mod transport;

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

use bridge::{BridgeInput, BridgeOptions, FileInput, Outcome, StdinInput, communicate};
use errors::SyncError;
use remotefs::RemoteFs;
use repl::ReplSession;
use transport::{Channel, SerialWire};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Sync files and stream scripts to MicroPython boards over the serial REPL.
#[derive(Debug, Parser)]
#[command(
    name = "mpsync",
    version,
    about,
    after_help = "See 'mpsync <command> --help' for more information on a specific command."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Serial port device (e.g. /dev/ttyUSB0).
    #[arg(short, long, global = true, env = "MPSYNC_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, default_value_t = 115200)]
    baudrate: u32,

    /// Response timeout in seconds; zero or negative waits forever.
    #[arg(short, long, global = true, default_value_t = 5.0)]
    timeout: f64,

    /// Increase verbosity (-v progress, -vv transfer detail, -vvv wire echo).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
enum Command {
    /// Reboot the board and wait for the prompt.
    Reset,

    /// List a remote directory.
    Ls { path: String },

    /// Create a remote directory.
    Mkdir { path: String },

    /// Create a remote directory and all missing parents.
    Makedirs { path: String },

    /// Remove a remote file.
    Rm { path: String },

    /// Remove an empty remote directory.
    Rmdir { path: String },

    /// Remove a remote file or directory tree.  The root `/` itself is
    /// kept, but all of its children are removed.
    Rmtree { path: String },

    /// Upload a local file or directory tree under a remote directory.
    Upload {
        src: PathBuf,
        /// Remote destination directory; must exist.
        dst: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Download a remote file or directory tree into a local directory.
    Download {
        src: String,
        /// Local destination directory; must exist.
        dst: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Execute a single line on the board and print its response.
    Execute { line: String },

    /// Stream a script file (or `-` for stdin) through paste mode.
    ExecuteFile {
        /// Script path, or `-` to read standard input.
        path: String,
        /// Where to write board output; `-` means standard output.
        #[arg(short, long, default_value = "-")]
        output: String,
        /// Hard cap on the whole run, in seconds.
        #[arg(long = "total-timeout")]
        total_timeout: Option<f64>,
    },

    /// Stream a script and re-stream it whenever the file changes.
    /// Runs until interrupted.
    LiveTestFile {
        path: PathBuf,
        /// Hard cap on each run, in seconds.
        #[arg(long = "total-timeout")]
        total_timeout: Option<f64>,
    },
}

#[derive(Debug, Args)]
struct TransferArgs {
    /// Copy the contents of the source directory instead of the directory
    /// itself.
    #[arg(short, long)]
    contents: bool,

    /// Overwrite existing destination files.
    #[arg(short, long)]
    overwrite: bool,

    /// Skip files whose sizes already match (sizes only; a same-size
    /// content change is not detected).
    #[arg(short, long)]
    quick: bool,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    if let Err(err) = run(&cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .target(env_logger::Target::Stdout)
        .parse_default_env()
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let started = Instant::now();

    let port = match &cli.global.port {
        Some(port) => port.clone(),
        None => Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "either --port must be given or MPSYNC_PORT must be set",
            )
            .exit(),
    };
    let timeout = if cli.global.timeout > 0.0 {
        Some(Duration::from_secs_f64(cli.global.timeout))
    } else {
        None
    };

    // One exclusively-owned channel per invocation; dropping it releases
    // the port on every exit path.
    let wire = SerialWire::open(&port, cli.global.baudrate)
        .with_context(|| format!("opening {port}"))?;
    let mut session = ReplSession::new(Channel::new(wire, timeout));

    dispatch(cli, &mut session, timeout)?;

    log::info!("total time elapsed: {:.2}s", started.elapsed().as_secs_f64());
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn dispatch(
    cli: &Cli,
    session: &mut ReplSession<SerialWire>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    match &cli.command {
        Command::Reset => {
            session.reset_device().context("resetting the board")?;
        }
        Command::Ls { path } => {
            for name in RemoteFs::new(session).ls(path)? {
                println!("{name}");
            }
        }
        Command::Mkdir { path } => {
            log::info!("MKDIR {path}");
            RemoteFs::new(session).mkdir(path)?;
        }
        Command::Makedirs { path } => {
            log::info!("MAKEDIRS {path}");
            RemoteFs::new(session).makedirs(path)?;
        }
        Command::Rm { path } => {
            log::info!("RM {path}");
            RemoteFs::new(session).rm(path)?;
        }
        Command::Rmdir { path } => {
            log::info!("RMDIR {path}");
            RemoteFs::new(session).rmdir(path)?;
        }
        Command::Rmtree { path } => {
            RemoteFs::new(session).rmtree(path)?;
        }
        Command::Upload { src, dst, transfer } => {
            RemoteFs::new(session)
                .upload(
                    src,
                    dst,
                    transfer.contents,
                    transfer.overwrite,
                    transfer.quick,
                )
                .with_context(|| format!("uploading {} to {dst}", src.display()))?;
        }
        Command::Download { src, dst, transfer } => {
            RemoteFs::new(session)
                .download(
                    src,
                    dst,
                    transfer.contents,
                    transfer.overwrite,
                    transfer.quick,
                )
                .with_context(|| format!("downloading {src} to {}", dst.display()))?;
        }
        Command::Execute { line } => {
            let response = session.execute(line)?;
            print!("{response}");
            if !response.ends_with('\n') {
                println!();
            }
        }
        Command::ExecuteFile {
            path,
            output,
            total_timeout,
        } => {
            execute_file(session, path, output, timeout, *total_timeout)?;
        }
        Command::LiveTestFile {
            path,
            total_timeout,
        } => {
            live_test_file(session, path, *total_timeout)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Streaming verbs
// ---------------------------------------------------------------------------

fn execute_file(
    session: &mut ReplSession<SerialWire>,
    path: &str,
    output: &str,
    idle_timeout: Option<Duration>,
    total_timeout: Option<f64>,
) -> anyhow::Result<()> {
    let mut input: Box<dyn BridgeInput> = if path == "-" {
        Box::new(StdinInput::new())
    } else {
        Box::new(FileInput::open(std::path::Path::new(path))?)
    };
    let mut sink: Box<dyn Write> = if output == "-" {
        Box::new(std::io::stdout())
    } else {
        Box::new(std::fs::File::create(output)?)
    };

    let opts = BridgeOptions {
        idle_timeout,
        absolute_timeout: total_timeout.map(Duration::from_secs_f64),
        paste_mode: true,
        watch: None,
        // Regular files have a definite end; stdin must be polled.
        no_select: path != "-",
    };

    match communicate(session, input.as_mut(), sink.as_mut(), &opts) {
        Ok(_) => Ok(()),
        // The board went quiet before the input ended; report it but treat
        // the stream as delivered.
        Err(SyncError::IdleTimeout) => {
            log::warn!("board went idle before input was exhausted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn live_test_file(
    session: &mut ReplSession<SerialWire>,
    path: &std::path::Path,
    total_timeout: Option<f64>,
) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        let mut input = FileInput::open(path)?;
        let opts = BridgeOptions {
            idle_timeout: None,
            absolute_timeout: total_timeout.map(Duration::from_secs_f64),
            paste_mode: true,
            watch: Some(path.to_path_buf()),
            no_select: true,
        };
        match communicate(session, &mut input, &mut stdout, &opts)? {
            Outcome::RerunRequested => {
                log::info!("restarting {}", path.display());
                session.reset_device().context("resetting for rerun")?;
            }
            Outcome::Completed => return Ok(()),
        }
    }
}
