use std::path::PathBuf;

use super::CommandError;

/// Values used when trailing command arguments are left out
#[derive(Debug, Clone)]
pub struct Fallbacks {
    pub qos: String,
    pub timeout: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Info,
    Infos,
    Inspect,
    Disconnect,
    Qos(String),
    Timeout(String),
    ClientId(String),
    Topic(String),
    File(PathBuf),
    Connect {
        broker: String,
        username: String,
        password: String,
    },
    Subscribe(String),
    Unsubscribe(String),
    Publish {
        payload: String,
        count: usize,
        retained: bool,
    },
}

impl Command {
    /// Parses one input line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str, fallbacks: &Fallbacks) -> Result<Option<Command>, CommandError> {
        let line = line.trim();
        if line.starts_with('#') {
            return Ok(None);
        }

        let words = split(line)?;
        let (verb, args) = match words.split_first() {
            Some((verb, args)) => (verb.as_str(), args),
            None => return Ok(None),
        };

        let command = match verb {
            "exit" => Command::Exit,
            "info" => Command::Info,
            "infos" => Command::Infos,
            "inspect" => Command::Inspect,
            "disconnect" => Command::Disconnect,
            "qos" => Command::Qos(first(args, &fallbacks.qos)),
            "timeout" => Command::Timeout(first(args, &fallbacks.timeout)),
            "clientid" => Command::ClientId(first(args, "")),
            "topic" => Command::Topic(first(args, "")),
            "file" => Command::File(PathBuf::from(first(args, ""))),
            "subscribe" => Command::Subscribe(first(args, "")),
            "unsubscribe" => Command::Unsubscribe(first(args, "")),
            "connect" => {
                let mut args = defaults(args, &["localhost", "", ""]).into_iter();
                Command::Connect {
                    broker: args.next().unwrap_or_default(),
                    username: args.next().unwrap_or_default(),
                    password: args.next().unwrap_or_default(),
                }
            }
            "publish" => {
                if args.is_empty() || args.len() > 3 {
                    return Err(CommandError::InvalidArgument(
                        "usage: publish <payload> [count] [retained]".to_owned(),
                    ));
                }

                let args = defaults(args, &["", "1", "false"]);
                let count = args[1].parse::<usize>().map_err(|e| {
                    CommandError::InvalidArgument(format!("count {:?}: {}", args[1], e))
                })?;
                let retained = parse_bool(&args[2])?;

                Command::Publish {
                    payload: args[0].clone(),
                    count,
                    retained,
                }
            }
            verb => return Err(CommandError::UnknownCommand(verb.to_owned())),
        };

        Ok(Some(command))
    }
}

/// Fills positions not covered by `args` with the matching fallback. Surplus
/// arguments are dropped.
fn defaults(args: &[String], fallbacks: &[&str]) -> Vec<String> {
    fallbacks
        .iter()
        .enumerate()
        .map(|(i, fallback)| match args.get(i) {
            Some(arg) => arg.clone(),
            None => fallback.to_string(),
        })
        .collect()
}

fn first(args: &[String], fallback: &str) -> String {
    defaults(args, &[fallback]).remove(0)
}

fn parse_bool(value: &str) -> Result<bool, CommandError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(CommandError::InvalidArgument(format!(
            "retained {:?}, expected true or false",
            value
        ))),
    }
}

/// Splits a line into words with shell like quoting. Single quotes are
/// literal, double quotes understand `\"` and `\\`, a backslash outside of
/// quotes escapes the next character.
pub fn split(line: &str) -> Result<Vec<String>, CommandError> {
    let mut words = Vec::new();
    let mut word = String::new();
    // distinguishes `''` (an empty word) from no word at all
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(unterminated('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ '"') | Some(c @ '\\') => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(unterminated('"')),
                        },
                        Some(c) => word.push(c),
                        None => return Err(unterminated('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }

    Ok(words)
}

fn unterminated(quote: char) -> CommandError {
    CommandError::InvalidArgument(format!("unterminated {} quote", quote))
}

/// Quotes `word` so that [`split`] reads it back as a single word
pub fn quote(word: &str) -> String {
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('"');
    for c in word.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
