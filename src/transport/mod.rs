use std::io;
use std::time::Duration;

use flume::Sender;
use rumqttc::QoS;

use crate::events::Notification;
use crate::token::Token;

#[cfg(test)]
pub mod mock;
mod rumqtt;

pub use rumqtt::RumqttConnector;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("Client error = {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Connection error = {0}")]
    Connection(String),
    #[error("Refused by broker = {0}")]
    Refused(String),
    #[error("Event loop closed")]
    Closed,
    #[error("IO error = {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything a transport needs to open a session with a broker.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Normalized `scheme://host:port[/path]` address
    pub broker: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
}

/// Opens transports. One connector serves every broker of a session.
pub trait Connector: Send {
    /// Starts connecting and returns the transport together with the token
    /// that resolves once the broker acknowledged the connection.
    fn connect(
        &self,
        options: ConnectOptions,
        notifications: Sender<Notification>,
    ) -> Result<(Box<dyn Transport>, Token), TransportError>;
}

/// A live session with one broker. Every verb is asynchronous and reports
/// completion through the returned token.
pub trait Transport: Send {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Token;
    fn unsubscribe(&mut self, topic: &str) -> Token;
    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: String) -> Token;
    /// Closes the session, waiting at most `linger` for the event loop to drain.
    fn disconnect(&mut self, linger: Duration);
}

/// Checks whether `topic` is matched by the subscription `filter`, honouring
/// the `+` (single level) and `#` (remaining levels) wildcards.
pub fn matches(topic: &str, filter: &str) -> bool {
    // wildcards don't match topics starting with `$`
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topics = topic.split('/');
    let mut filters = filter.split('/');

    loop {
        match (filters.next(), topics.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Numeric level of a QoS as it goes on the wire.
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// get QoS from its numeric level
pub fn get_qos(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
