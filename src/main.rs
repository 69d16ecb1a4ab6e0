//! Interactive mqtt client. Connects to one or more brokers, publishes and
//! subscribes, driven by command line flags, scripts or a prompt.
//!
//! - Flags are turned into a startup script (connect, clientid, topic,
//!   subscribe, qos, timeout, publish) which runs first
//! - `--file` runs a script of prompt commands next
//! - Then commands are read from the prompt until `exit`

use std::io::{self, IsTerminal};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{debug, error};

mod address;
mod cli;
mod connection;
mod console;
mod events;
mod output;
mod session;
mod token;
mod transport;

use cli::Config;
use console::{Console, Flow};
use events::{EventSink, LastMessage};
use output::Output;
use session::Session;
use transport::RumqttConnector;

fn main() -> anyhow::Result<()> {
    init_logging();
    let config = Config::parse();

    let output = Output::stdout();
    let last_message = LastMessage::default();
    let (notifications, events_rx) = events::channel();
    // detached, transport threads may still hold senders while the process exits
    EventSink::new(output.clone(), last_message.clone()).spawn(events_rx);

    let connector = RumqttConnector {
        keep_alive: Duration::from_secs(config.keep_alive),
        ca_file: config.ca_file.clone(),
    };
    let session = Session::new(Box::new(connector), config.defaults(), notifications);
    let mut console = Console::new(session, output, last_message);

    let flow = run(&mut console, &config);
    console.shutdown();
    flow.map(|_| ())
}

fn run(console: &mut Console, config: &Config) -> anyhow::Result<Flow> {
    let script = config.startup_script();
    if !script.is_empty() {
        debug!("Startup script:\n{}", script);
        match console.execute_script(&script) {
            Ok(Flow::Exit) => return Ok(Flow::Exit),
            Ok(Flow::Continue) => {}
            Err((line, e)) => error!("Startup command {} failed = {}", line, e),
        }
    }

    if let Some(file) = &config.file {
        let flow = console
            .execute_file(file)
            .with_context(|| format!("Running {:?}", file))?;
        if flow == Flow::Exit {
            return Ok(Flow::Exit);
        }
    }

    if io::stdin().is_terminal() {
        console.interactive();
    } else {
        console.read_from(io::stdin().lock());
    }

    Ok(Flow::Exit)
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(log::LevelFilter::Warn);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}
