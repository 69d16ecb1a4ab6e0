use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use log::{debug, error};
use rustyline::error::ReadlineError;
use rustyline::Editor;

use crate::connection::ConnectionError;
use crate::events::LastMessage;
use crate::output::Output;
use crate::session::Session;
use crate::transport::qos_level;

mod command;

pub use command::{quote, Command, Fallbacks};

/// Scripts may run other scripts, but not endlessly
const MAX_SCRIPT_DEPTH: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Unknown command = {0}")]
    UnknownCommand(String),
    #[error("Invalid argument = {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Cannot read {path:?} = {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{path:?} line {line}: {source}")]
    Script {
        path: PathBuf,
        line: usize,
        source: Box<CommandError>,
    },
    #[error("Serialization error = {0}")]
    Json(#[from] serde_json::Error),
}

/// What the interpreter loop does after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Console {
    session: Session,
    output: Output,
    last_message: LastMessage,
    fallbacks: Fallbacks,
    depth: usize,
}

impl Console {
    pub fn new(session: Session, output: Output, last_message: LastMessage) -> Console {
        let defaults = session.defaults();
        let fallbacks = Fallbacks {
            qos: qos_level(defaults.qos).to_string(),
            timeout: defaults.timeout.as_millis().to_string(),
        };

        Console {
            session,
            output,
            last_message,
            fallbacks,
            depth: 0,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Parses and runs one line of input
    pub fn execute_line(&mut self, line: &str) -> Result<Flow, CommandError> {
        let command = match Command::parse(line, &self.fallbacks)? {
            Some(command) => command,
            None => return Ok(Flow::Continue),
        };

        debug!("Command = {:?}", command);
        self.execute(command)
    }

    pub fn execute(&mut self, command: Command) -> Result<Flow, CommandError> {
        let session = &mut self.session;
        match command {
            Command::Exit => return Ok(Flow::Exit),
            Command::Info => {
                let connection = session.current_mut()?;
                if !connection.is_connected() {
                    return Err(ConnectionError::NotConnected.into());
                }

                let info = serde_json::to_string_pretty(&connection.info())?;
                self.output.line(info);
            }
            Command::Infos => {
                let infos = serde_json::to_string_pretty(&session.infos())?;
                self.output.line(infos);
            }
            Command::Inspect => {
                if let Some(message) = self.last_message.get() {
                    let message = serde_json::to_string_pretty(&message)?;
                    self.output.line(message);
                }
            }
            Command::Qos(qos) => session.current_mut()?.set_qos(&qos)?,
            Command::Timeout(timeout) => session.current_mut()?.set_timeout(&timeout)?,
            Command::ClientId(id) => session.current_mut()?.set_client_id(&id)?,
            Command::Topic(topic) => session.current_mut()?.set_topic(&topic)?,
            Command::Connect {
                broker,
                username,
                password,
            } => session.connect(&broker, &username, &password)?,
            Command::Subscribe(topic) => session.current_mut()?.subscribe(&topic)?,
            Command::Unsubscribe(topic) => session.current_mut()?.unsubscribe(&topic)?,
            Command::Disconnect => session.disconnect(),
            Command::Publish {
                payload,
                count,
                retained,
            } => session.current_mut()?.publish(&payload, count, retained)?,
            Command::File(path) => return self.execute_file(&path),
        }

        Ok(Flow::Continue)
    }

    /// Runs every line of `path`. The first failing line aborts the script.
    pub fn execute_file(&mut self, path: &Path) -> Result<Flow, CommandError> {
        let script = fs::read_to_string(path).map_err(|source| CommandError::Io {
            path: path.to_owned(),
            source,
        })?;

        if self.depth >= MAX_SCRIPT_DEPTH {
            return Err(CommandError::InvalidArgument(format!(
                "scripts nested deeper than {} levels at {:?}",
                MAX_SCRIPT_DEPTH, path
            )));
        }

        self.depth += 1;
        let result = self.execute_script(&script).map_err(|(line, e)| CommandError::Script {
            path: path.to_owned(),
            line,
            source: Box::new(e),
        });
        self.depth -= 1;

        result
    }

    /// Runs a script line by line, echoing each line first. Fails with the
    /// one based number of the failing line.
    pub fn execute_script(&mut self, script: &str) -> Result<Flow, (usize, CommandError)> {
        for (i, line) in script.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            self.output.line(line);
            match self.execute_line(line) {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Exit) => return Ok(Flow::Exit),
                Err(e) => return Err((i + 1, e)),
            }
        }

        Ok(Flow::Continue)
    }

    /// Interactive prompt on a terminal. Returns on `exit`, Ctrl-C or Ctrl-D.
    pub fn interactive(&mut self) {
        let mut rl = Editor::<()>::new();

        loop {
            self.output.prompt_opened();
            let readline = rl.readline("> ");
            self.output.prompt_closed();

            match readline {
                Ok(line) => {
                    rl.add_history_entry(line.as_str());
                    if self.report(&line) == Flow::Exit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    self.output.line("CTRL-C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    self.output.line("CTRL-D");
                    break;
                }
                Err(err) => {
                    error!("Readline error = {:?}", err);
                    break;
                }
            }
        }
    }

    /// Reads commands from a non interactive source until `exit` or end of input
    pub fn read_from(&mut self, reader: impl BufRead) {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Read error = {:?}", e);
                    break;
                }
            };

            if self.report(&line) == Flow::Exit {
                break;
            }
        }
    }

    /// Runs one line, logging instead of returning its error
    fn report(&mut self, line: &str) -> Flow {
        match self.execute_line(line) {
            Ok(flow) => flow,
            Err(e) => {
                error!("{}", e);
                Flow::Continue
            }
        }
    }

    /// Disconnects every connection of the session
    pub fn shutdown(&mut self) {
        self.session.shutdown();
    }
}
