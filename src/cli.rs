use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::console::quote;
use crate::session::Defaults;
use crate::transport::get_qos;

/// Operation timeout when none is given
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Parser)]
#[command(
    name = "mqttcli",
    about = "Connect, publish and subscribe to mqtt brokers from a prompt or a script.",
    version
)]
pub struct Config {
    /// Broker to connect to on startup
    #[arg(short = 'c', long, visible_alias = "url", value_name = "URL")]
    pub connect: Option<String>,

    #[arg(short = 'u', long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Client id, a random uuid when left out
    #[arg(short = 'i', long = "clientid", value_name = "ID")]
    pub client_id: Option<String>,

    /// Topic publishes go to
    #[arg(short = 't', long)]
    pub topic: Option<String>,

    /// Topic filter to subscribe to after connecting
    #[arg(short = 's', long, value_name = "FILTER")]
    pub subscribe: Option<String>,

    /// Operation timeout in milliseconds, 0 waits forever
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    #[arg(short = 'q', long, value_name = "QoS", value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: Option<u8>,

    /// Payload to publish after connecting
    #[arg(short = 'm', long, visible_alias = "text", value_name = "PAYLOAD")]
    pub publish: Option<String>,

    #[arg(short = 'r', long)]
    pub retained: bool,

    /// Number of times the payload is published
    #[arg(short = 'n', long, default_value = "1", value_name = "NUM")]
    pub count: usize,

    /// Script with one command per line, run before the prompt
    #[arg(short = 'f', long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// CA certificate for ssl:// brokers
    #[arg(short = 'R', long, value_name = "PATH")]
    pub ca_file: Option<PathBuf>,

    #[arg(short = 'k', long, default_value = "10", value_name = "SECS")]
    pub keep_alive: u64,
}

impl Config {
    /// Commands equivalent to the flags given on the command line, one per
    /// line. Empty unless a broker to connect to was given.
    pub fn startup_script(&self) -> String {
        let broker = match &self.connect {
            Some(broker) => broker,
            None => return String::new(),
        };

        let mut connect = format!("connect {}", quote(broker));
        if let Some(username) = &self.username {
            let password = self.password.as_deref().unwrap_or_default();
            connect.push_str(&format!(" {} {}", quote(username), quote(password)));
        }

        let mut lines = vec![connect];
        if let Some(client_id) = &self.client_id {
            lines.push(format!("clientid {}", quote(client_id)));
        }

        if let Some(topic) = &self.topic {
            lines.push(format!("topic {}", quote(topic)));
        }

        if let Some(filter) = &self.subscribe {
            lines.push(format!("subscribe {}", quote(filter)));
        }

        if let Some(qos) = self.qos {
            lines.push(format!("qos {}", qos));
        }

        if let Some(timeout) = self.timeout {
            lines.push(format!("timeout {}", timeout));
        }

        if let Some(payload) = &self.publish {
            lines.push(format!(
                "publish {} {} {}",
                quote(payload),
                self.count,
                self.retained
            ));
        }

        lines.join("\n")
    }

    pub fn defaults(&self) -> Defaults {
        Defaults {
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            topic: self.topic.clone().unwrap_or_default(),
            qos: self.qos.and_then(get_qos).unwrap_or(rumqttc::QoS::AtMostOnce),
            timeout: Duration::from_millis(self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)),
        }
    }
}
