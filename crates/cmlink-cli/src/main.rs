//! cmlink: host console for CM> framed controllers

mod cli;

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use cmlink_core::config::SessionConfig;
use cmlink_core::protocol::{
    hex_dump, list_ports, CommandCatalogue, Message, OutOfBandSink, Request, Response, Session,
    SystemStatus, CMD_GET_STATUS,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

/// Prints device output as it arrives during a command
struct ConsoleSink;

impl OutOfBandSink for ConsoleSink {
    fn unsolicited(&mut self, message: &Message) {
        print_message(message);
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Command::Ports => {
            list();
            Ok(())
        }
        Command::Commands => {
            let catalogue = load_catalogue(&cli)?;
            for spec in catalogue.iter() {
                println!("{:#06x}  {}", spec.code, spec.usage());
                if !spec.description.is_empty() {
                    println!("        {}", spec.description);
                }
            }
            Ok(())
        }
        Command::Listen { seconds } => {
            let mut session = connect(&cli)?;
            listen(&mut session, seconds.map(Duration::from_secs))
        }
        Command::Send { .. } => {
            let request = cli
                .command
                .send_request()
                .context("send arguments did not form a request")?;
            let mut session = connect(&cli)?;
            execute(&mut session, &request)
        }
        Command::Run { name, args } => {
            let catalogue = load_catalogue(&cli)?;
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let request = catalogue.request(name, &args)?;
            let mut session = connect(&cli)?;
            execute(&mut session, &request)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn list() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let marker = if port.is_controller() { "*" } else { " " };
        println!("{} {}", marker, port);
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(port) = &cli.port {
        config.port_name = Some(port.clone());
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }
    if let Some(timeout) = cli.timeout_ms {
        config.ack_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn load_catalogue(cli: &Cli) -> Result<CommandCatalogue> {
    let mut catalogue = CommandCatalogue::builtin();
    if let Some(path) = &cli.catalogue {
        let extra = CommandCatalogue::from_file(path)
            .with_context(|| format!("loading catalogue {}", path.display()))?;
        debug!("Loaded {} commands from {}", extra.len(), path.display());
        catalogue.merge(extra);
    }
    Ok(catalogue)
}

fn connect(cli: &Cli) -> Result<Session> {
    let config = load_config(cli)?;
    let mut session = Session::new(config).with_out_of_band(ConsoleSink);

    if let Some(addr) = &cli.tcp {
        session
            .connect_tcp(addr)
            .with_context(|| format!("connecting to {}", addr))?;
        return Ok(session);
    }

    let Some(port) = session.config().port_name.clone() else {
        bail!("no serial port given; use --port, --tcp or a config file (see `cmlink ports`)");
    };
    session
        .connect()
        .with_context(|| format!("opening {}", port))?;
    Ok(session)
}

fn execute(session: &mut Session, request: &Request) -> Result<()> {
    info!(
        "Sending {:#06x} with {} param byte(s)",
        request.command_code,
        request.params.len()
    );
    let started = Instant::now();
    let response = session.execute(request)?;
    print_response(&response, started.elapsed());

    let counters = session.counters();
    debug!(
        "tx {} bytes / {} frames, rx {} bytes / {} messages",
        counters.tx_bytes, counters.tx_frames, counters.rx_bytes, counters.rx_messages
    );
    Ok(())
}

fn listen(session: &mut Session, duration: Option<Duration>) -> Result<()> {
    let deadline = duration.map(|d| Instant::now() + d);
    info!("Listening; press Ctrl-C to stop");
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                (deadline - now).min(Duration::from_millis(500))
            }
            None => Duration::from_millis(500),
        };
        if let Some(message) = session.next_message(wait)? {
            print_message(&message);
        }
    }
}

fn print_message(message: &Message) {
    let tag = match message {
        Message::Text(_) => "[device]",
        Message::Binary(_) => "[frame] ",
    };
    println!("{} {}", tag, message.describe());
}

fn print_response(response: &Response, elapsed: Duration) {
    println!(
        "{:#06x}: {:?} received",
        response.command_code,
        response.ack.kind()
    );
    if let Some(data) = &response.data {
        println!("  data: {}", hex_dump(data));
        if response.command_code == CMD_GET_STATUS {
            if let Some(status) = SystemStatus::parse(data) {
                println!("  state: {}, last error: {:#06x}", status.state, status.last_error);
            }
        }
    }
    if let Some(status) = response.done.as_ref().and_then(|f| f.device_status()) {
        let label = if status.is_ok() { "done" } else { "done with error" };
        println!("  {}: {}", label, status);
    }
    println!("  completed in {} ms", elapsed.as_millis());
}
