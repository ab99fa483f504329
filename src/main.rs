//! `picolink`: manage the filesystem of a MicroPython board from the
//! command line.

mod config;
mod console;

use clap::{Parser, Subcommand};
use console::ConsoleObserver;
use picolink_repl::repl::port_scanner;
use picolink_repl::repl::{
    BusyPolicy, DownloadMode, FileContent, Outcome, ReplError, ReplResult, ReplSession,
    ScriptOutcome,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "picolink", about = "Manage a MicroPython board over its raw REPL", version)]
struct Cli {
    /// JSON config file.
    #[arg(long, global = true, env = "PICOLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port; the first known board is used when omitted.
    #[arg(long, global = true, env = "PICOLINK_PORT")]
    port: Option<String>,

    #[arg(long, global = true)]
    baud: Option<u32>,

    /// ignore, reject or queue
    #[arg(long, global = true)]
    busy_policy: Option<BusyPolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports.
    Ports,
    /// Show the board's filesystem.
    Ls,
    /// Print a file as text.
    Cat { path: String },
    /// Copy a file from the board.
    Get {
        remote: String,
        /// Defaults to the remote file name.
        local: Option<PathBuf>,
    },
    /// Copy local files to the board.
    Put {
        #[arg(required = true)]
        local: Vec<PathBuf>,
        /// Target directory on the board.
        #[arg(long, default_value = "/")]
        dir: String,
    },
    /// Remove a file or directory tree.
    Rm { path: String },
    /// Remove everything on the board.
    Wipe,
    /// Rename a file or directory in place.
    Mv { path: String, new_name: String },
    /// Create a directory and its parents.
    Mkdir { path: String },
    /// Run Python code and show its output.
    Exec {
        /// Code to run; ignored when --file is given.
        code: Option<String>,
        #[arg(long, short)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ReplResult<ExitCode> {
    if let Command::Ports = cli.command {
        return list_ports();
    }

    let overrides = config::Overrides {
        port: cli.port,
        baud: cli.baud,
        busy_policy: cli.busy_policy,
    };
    let config = config::load(cli.config.as_deref(), &overrides)?;
    let console = Arc::new(ConsoleObserver::new());
    let session = ReplSession::new(config, console.clone());

    done(session.connect_serial().await?)?;
    let res = execute(&session, &console, cli.command).await;
    if let Err(e) = session.disconnect().await {
        tracing::warn!("closing port: {}", e);
    }
    res
}

fn list_ports() -> ReplResult<ExitCode> {
    let ports = port_scanner::scan_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{}", port.display_name());
    }
    Ok(ExitCode::SUCCESS)
}

async fn execute(
    session: &ReplSession,
    console: &ConsoleObserver,
    command: Command,
) -> ReplResult<ExitCode> {
    match command {
        Command::Ports => list_ports(),
        Command::Ls => {
            let tree = session
                .tree()
                .await
                .ok_or_else(|| ReplError::parse("board returned no listing"))?;
            print!("{}", console::render_tree(&tree));
            Ok(ExitCode::SUCCESS)
        }
        Command::Cat { path } => {
            match done(session.read_file(&path, DownloadMode::Text).await?)? {
                FileContent::Text(text) => print!("{}", text),
                FileContent::Binary(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Get { remote, local } => {
            let content = done(session.read_file(&remote, DownloadMode::Binary).await?)?;
            let local = local.unwrap_or_else(|| {
                PathBuf::from(picolink_repl::repl::fs_tree::file_name(&remote))
            });
            std::fs::write(&local, content.as_bytes())?;
            tracing::info!("{} -> {} ({} bytes)", remote, local.display(), content.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Put { local, dir } => {
            let mut files = Vec::with_capacity(local.len());
            for path in &local {
                files.push((local_name(path)?, std::fs::read(path)?));
            }
            let results = done(session.upload_many(&dir, files).await?)?;
            let mut all_ok = true;
            for (path, outcome) in results {
                all_ok &= report(&path, outcome);
            }
            Ok(exit_code(all_ok))
        }
        Command::Rm { path } => {
            let outcome = done(session.delete(&path).await?)?;
            Ok(exit_code(report(&path, outcome)))
        }
        Command::Wipe => {
            let outcome = done(session.delete_all().await?)?;
            Ok(exit_code(report("/", outcome)))
        }
        Command::Mv { path, new_name } => {
            let outcome = done(session.rename(&path, &new_name).await?)?;
            Ok(exit_code(report(&path, outcome)))
        }
        Command::Mkdir { path } => {
            let outcome = done(session.build_path(&path).await?)?;
            Ok(exit_code(report(&path, outcome)))
        }
        Command::Exec { code, file } => {
            let code = match (code, file) {
                (_, Some(file)) => std::fs::read_to_string(file)?,
                (Some(code), None) => code,
                (None, None) => return Err(ReplError::invalid_config("nothing to run")),
            };
            console.show_output(true);
            let res = session.execute_lines(&code).await;
            console.show_output(false);
            done(res?)?;
            println!();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn done<T>(outcome: Outcome<T>) -> ReplResult<T> {
    outcome.into_option().ok_or_else(ReplError::busy)
}

/// Log a script outcome; `true` on success.
fn report(target: &str, outcome: ScriptOutcome) -> bool {
    match outcome {
        ScriptOutcome::Success => {
            tracing::info!("{}: ok", target);
            true
        }
        ScriptOutcome::Failure(reason) => {
            tracing::error!("{}: {}", target, reason);
            false
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn local_name(path: &Path) -> ReplResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ReplError::invalid_path(format!("{} has no file name", path.display())))
}
