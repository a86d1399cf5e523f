//! ladmin: console and launcher for administration daemons.
//!
//! Usage:
//!   ladmin shell                 # Interactive shell through the admin directory
//!   ladmin telnet --port 6523    # Interactive session over a raw telnet socket
//!   ladmin start | stop | status # Server lifecycle
//!   ladmin tail                  # Follow the server's log file
//!   ladmin invoke <command> ...  # One-shot request

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::style::Stylize;

use ladmin::admind::{AdmindClient, DirectoryLocator, RequestState, SessionRequest};
use ladmin::config::Config;
use ladmin::console::{
    ConsoleSession, ExitReason, SessionTransport, TailSession, TelnetTransport, Transport,
};
use ladmin::launcher::{LaunchCommand, LaunchMode, LaunchState, Launcher};
use ladmin::logging::{self, LogTarget};
use ladmin::shutdown::ShutdownHook;
use ladmin::terminal::{Console, SystemTerminal};

/// Console and launcher for administration daemons.
#[derive(Parser, Debug)]
#[command(name = "ladmin", version, about)]
struct Cli {
    /// Server name, overriding `[server] name` from the config file.
    #[arg(long, global = true, env = "LADMIN_SERVER")]
    server: Option<String>,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open an interactive shell on the server.
    Shell,
    /// Open an interactive session over a telnet socket.
    Telnet {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Launch the server in the background.
    Start,
    /// Ask the server to shut down.
    Stop,
    /// Show the server status.
    Status,
    /// Follow the server's log file until Ctrl+C or Ctrl+Z.
    Tail,
    /// Send a one-shot request.
    Invoke {
        command: String,
        args: Vec<String>,
    },
}

impl Command {
    /// Interactive commands own the terminal, so their logs go to a file.
    fn is_interactive(&self) -> bool {
        matches!(self, Self::Shell | Self::Telnet { .. } | Self::Tail)
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let target = if cli.command.is_interactive() {
        LogTarget::File(Config::state_dir().join("ladmin.log"))
    } else {
        LogTarget::Stderr
    };
    logging::init(target, if cli.verbose { "debug" } else { "warn" })?;

    let config = Config::load().context("Failed to load configuration")?;
    let server = match &cli.server {
        Some(server) => server.clone(),
        None => config.server.name.clone(),
    };

    match cli.command {
        Command::Shell => shell(&config, &server),
        Command::Telnet { host, port } => {
            let host = host.unwrap_or_else(|| config.telnet.host.clone());
            telnet(&config, &host, port.unwrap_or(config.telnet.port))
        }
        Command::Start => start(&config, &server),
        Command::Stop => stop(&config, &server),
        Command::Status => status(&config, &server),
        Command::Tail => tail(&config, &server),
        Command::Invoke { command, args } => invoke(&config, &server, &command, &args),
    }
}

fn admind_client(config: &Config, server: &str) -> AdmindClient {
    let locator = Arc::new(DirectoryLocator::new(config.admind.run_dir()));
    AdmindClient::new(server, locator).with_poll_interval(config.admind.poll_interval())
}

fn shell(config: &Config, server: &str) -> Result<ExitCode> {
    let client = Arc::new(admind_client(config, server));
    if !client.is_running() {
        eprintln!("Unable to find '{server}'");
        return Ok(ExitCode::FAILURE);
    }

    let terminal = SystemTerminal::open().context("Failed to open the terminal")?;
    let request = Arc::new(client.submit("shell", "true")?);

    let hook = {
        let client = Arc::clone(&client);
        let request = Arc::clone(&request);
        ShutdownHook::install(move || {
            client.close(&request);
        })
        .context("Failed to install the shutdown hook")?
    };

    let timeout = config.admind.connect_timeout();
    let state = client.wait(&request, timeout, RequestState::Running);
    if !state.has_reached(RequestState::Running) {
        let message = connect_failure(&client, &request, state);
        client.close(&request);
        eprintln!("Error connecting to '{server}': {message}");
        return Ok(ExitCode::FAILURE);
    }

    let attached =
        SessionTransport::attach(Arc::clone(&client), Arc::clone(&request), terminal.info());
    let transport = match attached {
        Ok(transport) => transport,
        Err(e) => {
            client.close(&request);
            eprintln!("Error connecting to '{server}': {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let reason = run_console(config, terminal, transport, &hook)?;
    client.close(&request);
    Ok(report_exit(&reason))
}

fn connect_failure(client: &AdmindClient, request: &SessionRequest, state: RequestState) -> String {
    match state {
        RequestState::Error => client
            .last_error(request)
            .unwrap_or_else(|| "request failed".to_string()),
        RequestState::Gone => "server went away".to_string(),
        _ => format!("no answer, request still {state}"),
    }
}

fn telnet(config: &Config, host: &str, port: u16) -> Result<ExitCode> {
    let terminal = SystemTerminal::open().context("Failed to open the terminal")?;
    let timeout = config.telnet.handshake_timeout();
    let transport = match TelnetTransport::connect(host, port, terminal.info(), timeout) {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("{e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let hook = ShutdownHook::install(|| {}).context("Failed to install the shutdown hook")?;
    let reason = run_console(config, terminal, transport, &hook)?;
    Ok(report_exit(&reason))
}

fn run_console<T: Transport>(
    config: &Config,
    terminal: SystemTerminal,
    transport: T,
    hook: &ShutdownHook,
) -> Result<ExitReason> {
    ConsoleSession::new(terminal, transport)
        .idle_sleep(config.console.idle_sleep())
        .resize_settle(config.console.resize_settle())
        .shutdown_flag(hook.flag())
        .run()
        .context("Console session failed")
}

/// Print how the session ended, once the terminal is back in its own mode.
fn report_exit(reason: &ExitReason) -> ExitCode {
    match reason {
        ExitReason::Failed(message) => {
            eprintln!("{}", format!("Error: {message}").red().bold());
            ExitCode::FAILURE
        }
        ExitReason::Logout | ExitReason::RemoteLogout | ExitReason::Suspended => {
            println!("Logout");
            ExitCode::SUCCESS
        }
        ExitReason::Gone
        | ExitReason::ConnectionClosed
        | ExitReason::Finished
        | ExitReason::LocalEof
        | ExitReason::Shutdown => {
            println!("Connection closed");
            ExitCode::SUCCESS
        }
    }
}

fn start(config: &Config, server: &str) -> Result<ExitCode> {
    let client = admind_client(config, server);
    if client.is_running() {
        eprintln!("'{server}' is already running");
        return Ok(ExitCode::FAILURE);
    }

    let Some(program) = &config.server.command else {
        anyhow::bail!(
            "No server command configured; set [server] command in {}",
            Config::config_path().display()
        );
    };

    let mut command = LaunchCommand::new(program)
        .args(&config.server.args)
        .env("LADMIN_SERVER", server)
        .env("LADMIN_RUN_DIR", config.admind.run_dir())
        .log_file(config.server.log_file.clone());
    if let Some(log_file) = &config.server.log_file {
        command = command.env("LADMIN_LOG_FILE", log_file);
    }
    if let Some(dir) = &config.server.working_dir {
        command = command.current_dir(dir);
    }

    let launcher = Launcher::new(config.server.start_timeout());
    let report = launcher
        .launch(&command, LaunchMode::Daemon)
        .with_context(|| format!("Failed to launch {command}"))?;

    match report.state {
        LaunchState::Started => {
            match report.pid {
                Some(pid) => println!("Launcher: Successful (pid {pid})"),
                None => println!("Launcher: Successful"),
            }
            Ok(ExitCode::SUCCESS)
        }
        LaunchState::Failed => {
            let cause = report.failure.as_deref().unwrap_or("unknown cause");
            eprintln!("Launcher: Failed: {cause}");
            Ok(ExitCode::FAILURE)
        }
        LaunchState::TimedOut | LaunchState::Starting => {
            eprintln!(
                "Launcher: Timed out after {} ms waiting for {}",
                config.server.start_timeout_ms,
                command.program().display()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

fn stop(config: &Config, server: &str) -> Result<ExitCode> {
    let client = admind_client(config, server);
    if !client.is_running() {
        return match &config.server.stop_command {
            Some(program) => run_stop_command(config, program),
            None => {
                eprintln!("Unable to find '{server}'");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    let request = client.submit("shutdown", "")?;
    let timeout = config.admind.request_timeout();
    let state = client.wait(&request, timeout, RequestState::Ready);
    let code = match state {
        // The daemon may remove its directory before we look again
        RequestState::Gone => {
            println!("'{server}' stopped");
            ExitCode::SUCCESS
        }
        _ => print_outcome(&client, &request, state),
    };
    client.close(&request);
    Ok(code)
}

fn tail(config: &Config, server: &str) -> Result<ExitCode> {
    let client = admind_client(config, server);
    if !client.is_running() {
        println!("Waiting for '{server}'");
    }

    let terminal = SystemTerminal::open().context("Failed to open the terminal")?;
    let hook = ShutdownHook::install(|| {}).context("Failed to install the shutdown hook")?;
    TailSession::new(terminal, client)
        .idle_sleep(config.console.idle_sleep())
        .shutdown_flag(hook.flag())
        .run()
        .context("Tail failed")?;

    // The followed output may have switched bracketed paste on
    println!("\x1b[?2004l");
    Ok(ExitCode::SUCCESS)
}

fn run_stop_command(config: &Config, program: &Path) -> Result<ExitCode> {
    let mut command = LaunchCommand::new(program).args(&config.server.stop_args);
    if let Some(dir) = &config.server.working_dir {
        command = command.current_dir(dir);
    }

    let report = Launcher::new(config.server.start_timeout())
        .launch(&command, LaunchMode::Foreground)
        .with_context(|| format!("Failed to run {command}"))?;

    if !report.is_started() {
        let cause = match report.failure {
            Some(failure) => failure,
            None => format!("{:?}", report.state),
        };
        eprintln!("Launcher: Failed: {cause}");
        return Ok(ExitCode::FAILURE);
    }
    let code = report.exit_code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn status(config: &Config, server: &str) -> Result<ExitCode> {
    let client = admind_client(config, server);
    if !client.is_running() {
        println!("'{server}' is not running");
        return Ok(ExitCode::FAILURE);
    }
    one_shot(config, &client, "status", "")
}

fn invoke(config: &Config, server: &str, command: &str, args: &[String]) -> Result<ExitCode> {
    let client = admind_client(config, server);
    if !client.is_running() {
        eprintln!("Unable to find '{server}'");
        return Ok(ExitCode::FAILURE);
    }
    let payload = serde_json::to_string(args).context("Failed to encode arguments")?;
    one_shot(config, &client, command, &payload)
}

fn one_shot(
    config: &Config,
    client: &AdmindClient,
    command: &str,
    payload: &str,
) -> Result<ExitCode> {
    let request = client.submit(command, payload)?;
    let timeout = config.admind.request_timeout();
    let state = client.wait(&request, timeout, RequestState::Ready);
    let code = print_outcome(client, &request, state);
    client.close(&request);
    Ok(code)
}

fn print_outcome(client: &AdmindClient, request: &SessionRequest, state: RequestState) -> ExitCode {
    match state {
        RequestState::Ready => match client.response(request) {
            Ok(response) => {
                println!("{}", response.trim_end());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
        RequestState::Error => {
            let message = client
                .last_error(request)
                .unwrap_or_else(|| "request failed".to_string());
            eprintln!("Error: {message}");
            ExitCode::FAILURE
        }
        RequestState::Gone => {
            eprintln!("'{}' is gone", client.server());
            ExitCode::FAILURE
        }
        RequestState::Pending | RequestState::Running => {
            let server = client.server();
            eprintln!("Timed out waiting for '{server}' (request {state})");
            ExitCode::FAILURE
        }
    }
}
