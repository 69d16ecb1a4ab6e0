use std::time::Duration;

use flume::Sender;
use log::{debug, info, warn};
use rumqttc::QoS;
use serde::Serialize;
use thiserror::Error;

use crate::address::AddressError;
use crate::events::Notification;
use crate::token::wait;
use crate::transport::{
    get_qos, qos_level, ConnectOptions, Connector, Credentials, Transport, TransportError,
};

/// How long a disconnect waits for the event loop to flush
const DISCONNECT_LINGER: Duration = Duration::from_millis(1000);

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Not connected")]
    NotConnected,
    #[error("Undefined topic")]
    UndefinedTopic,
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error = {0}")]
    Transport(#[from] TransportError),
    #[error("Connect to {broker} failed = {source}")]
    ConnectFailed {
        broker: String,
        source: Box<ConnectionError>,
    },
    #[error("Invalid address = {0}")]
    Address(#[from] AddressError),
    #[error("Invalid argument = {0}")]
    InvalidArgument(String),
}

/// One broker session, live or previously seen
pub struct Connection {
    broker: String,
    client_id: String,
    topic: String,
    subscriptions: Vec<String>,
    qos: QoS,
    timeout: Duration,
    transport: Option<Box<dyn Transport>>,
}

/// Serializable view used by `info` and `infos`
#[derive(Debug, Serialize)]
pub struct ConnectionInfo<'a> {
    pub broker: &'a str,
    pub client_id: &'a str,
    pub topic: &'a str,
    pub subscriptions: &'a [String],
    pub qos: u8,
    pub timeout: u64,
    pub connected: bool,
}

impl Connection {
    pub fn new(broker: String, client_id: String, topic: String, qos: QoS, timeout: Duration) -> Self {
        Connection {
            broker,
            client_id,
            topic,
            subscriptions: Vec::new(),
            qos,
            timeout,
            transport: None,
        }
    }

    #[cfg(test)]
    pub fn broker(&self) -> &str {
        &self.broker
    }

    #[cfg(test)]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[cfg(test)]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[cfg(test)]
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    #[cfg(test)]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    #[cfg(test)]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn info(&self) -> ConnectionInfo<'_> {
        ConnectionInfo {
            broker: &self.broker,
            client_id: &self.client_id,
            topic: &self.topic,
            subscriptions: &self.subscriptions,
            qos: qos_level(self.qos),
            timeout: self.timeout.as_millis() as u64,
            connected: self.is_connected(),
        }
    }

    /// Opens a transport to the broker of this record and blocks until the
    /// broker acknowledged it. A still live transport is closed first.
    pub fn connect(
        &mut self,
        connector: &dyn Connector,
        credentials: Option<Credentials>,
        notifications: Sender<Notification>,
    ) -> Result<(), ConnectionError> {
        self.disconnect();

        let options = ConnectOptions {
            broker: self.broker.clone(),
            client_id: self.client_id.clone(),
            credentials,
        };

        let failed = |broker: &str, e: ConnectionError| ConnectionError::ConnectFailed {
            broker: broker.to_owned(),
            source: Box::new(e),
        };

        let (mut transport, token) = connector
            .connect(options, notifications)
            .map_err(|e| failed(&self.broker, e.into()))?;

        if let Err(e) = wait(self.timeout, token) {
            transport.disconnect(Duration::ZERO);
            return Err(failed(&self.broker, e));
        }

        info!("Id = {}, Connected to {}", self.client_id, self.broker);
        self.transport = Some(transport);
        self.resubscribe();
        Ok(())
    }

    /// Issues the recorded subscriptions again on a fresh session. Filters
    /// the broker doesn't take back are dropped from the record.
    fn resubscribe(&mut self) {
        let (qos, timeout) = (self.qos, self.timeout);
        let client_id = &self.client_id;
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return,
        };

        self.subscriptions.retain(|topic| {
            match wait(timeout, transport.subscribe(topic, qos)) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Id = {}, Resubscribe to {} failed = {}", client_id, topic, e);
                    false
                }
            }
        });
    }

    /// Closes the transport but keeps the record around for reconnects
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!("Id = {}, Disconnecting from {}", self.client_id, self.broker);
            transport.disconnect(DISCONNECT_LINGER);
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        match self.transport {
            Some(_) => Ok(()),
            None => Err(ConnectionError::NotConnected),
        }
    }

    pub fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        let (qos, timeout) = (self.qos, self.timeout);
        let transport = self.transport.as_mut().ok_or(ConnectionError::NotConnected)?;

        if self.subscriptions.iter().any(|t| t == topic) {
            warn!("Already subscribed: {}", topic);
            return Ok(());
        }

        let token = transport.subscribe(topic, qos);
        wait(timeout, token)?;
        self.subscriptions.push(topic.to_owned());
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        let timeout = self.timeout;
        let transport = self.transport.as_mut().ok_or(ConnectionError::NotConnected)?;

        let position = match self.subscriptions.iter().position(|t| t == topic) {
            Some(position) => position,
            None => {
                warn!("Not subscribed to: {}", topic);
                return Ok(());
            }
        };

        let token = transport.unsubscribe(topic);
        wait(timeout, token)?;
        self.subscriptions.remove(position);
        Ok(())
    }

    /// Publishes `payload` `count` times to the active topic, one after the
    /// other. Repeated payloads are suffixed with their index.
    pub fn publish(&mut self, payload: &str, count: usize, retained: bool) -> Result<(), ConnectionError> {
        let (qos, timeout) = (self.qos, self.timeout);
        let topic = self.topic.clone();
        let transport = self.transport.as_mut().ok_or(ConnectionError::NotConnected)?;

        if topic.is_empty() {
            return Err(ConnectionError::UndefinedTopic);
        }

        for i in 0..count {
            let message = if count > 1 {
                format!("{} [{}]", payload, i)
            } else {
                payload.to_owned()
            };

            let token = transport.publish(&topic, qos, retained, message);
            wait(timeout, token)?;
        }

        Ok(())
    }

    pub fn set_client_id(&mut self, client_id: &str) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.client_id = client_id.to_owned();
        Ok(())
    }

    pub fn set_topic(&mut self, topic: &str) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.topic = topic.to_owned();
        Ok(())
    }

    pub fn set_qos(&mut self, qos: &str) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.qos = parse_qos(qos)?;
        Ok(())
    }

    /// Timeout in milliseconds, 0 waits indefinitely
    pub fn set_timeout(&mut self, timeout: &str) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let millis = timeout
            .trim()
            .parse::<u64>()
            .map_err(|e| ConnectionError::InvalidArgument(format!("timeout {:?}: {}", timeout, e)))?;

        self.timeout = Duration::from_millis(millis);
        Ok(())
    }
}

pub fn parse_qos(qos: &str) -> Result<QoS, ConnectionError> {
    qos.trim()
        .parse::<u8>()
        .ok()
        .and_then(get_qos)
        .ok_or_else(|| ConnectionError::InvalidArgument(format!("qos {:?}, expected 0, 1 or 2", qos)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::transport::mock::{MockConnector, Published};

    fn connection() -> Connection {
        Connection::new(
            "tcp://localhost:1883".to_owned(),
            "client-1".to_owned(),
            "hello/world".to_owned(),
            QoS::AtLeastOnce,
            Duration::from_millis(100),
        )
    }

    fn connected(connector: &MockConnector) -> Connection {
        let (tx, _rx) = events::channel();
        let mut connection = connection();
        connection.connect(connector, None, tx).unwrap();
        connection
    }

    #[test]
    fn connect_uses_record_settings() {
        let connector = MockConnector::default();
        let connection = connected(&connector);

        assert!(connection.is_connected());
        let state = connector.state();
        assert_eq!(state.connects.len(), 1);
        assert_eq!(state.connects[0].broker, "tcp://localhost:1883");
        assert_eq!(state.connects[0].client_id, "client-1");
        assert!(state.connects[0].credentials.is_none());
    }

    #[test]
    fn refused_connect_is_connect_failed() {
        let connector = MockConnector::default();
        connector.state().refuse_connect = true;
        let (tx, _rx) = events::channel();
        let mut connection = connection();

        match connection.connect(&connector, None, tx) {
            Err(ConnectionError::ConnectFailed { broker, source }) => {
                assert_eq!(broker, "tcp://localhost:1883");
                assert!(matches!(*source, ConnectionError::Transport(TransportError::Refused(_))));
            }
            v => panic!("Unexpected outcome = {:?}", v.map(|_| ())),
        }
        assert!(!connection.is_connected());
        // half open transport is torn down
        assert_eq!(connector.state().disconnects, 1);
    }

    #[test]
    fn stalled_connect_times_out() {
        let connector = MockConnector::default();
        connector.state().stall = true;
        let (tx, _rx) = events::channel();
        let mut connection = connection();

        match connection.connect(&connector, None, tx) {
            Err(ConnectionError::ConnectFailed { source, .. }) => {
                assert!(matches!(*source, ConnectionError::Timeout(_)))
            }
            v => panic!("Unexpected outcome = {:?}", v.map(|_| ())),
        }
        assert!(!connection.is_connected());
    }

    #[test]
    fn operations_need_a_connection() {
        let mut connection = connection();

        assert!(matches!(connection.subscribe("a"), Err(ConnectionError::NotConnected)));
        assert!(matches!(connection.unsubscribe("a"), Err(ConnectionError::NotConnected)));
        assert!(matches!(connection.publish("a", 1, false), Err(ConnectionError::NotConnected)));
        assert!(matches!(connection.set_client_id("x"), Err(ConnectionError::NotConnected)));
        assert!(matches!(connection.set_topic("x"), Err(ConnectionError::NotConnected)));
        assert!(matches!(connection.set_qos("2"), Err(ConnectionError::NotConnected)));
        assert!(matches!(connection.set_timeout("5"), Err(ConnectionError::NotConnected)));

        assert!(connection.subscriptions().is_empty());
        assert_eq!(connection.client_id(), "client-1");
        assert_eq!(connection.topic(), "hello/world");
        assert_eq!(connection.qos(), QoS::AtLeastOnce);
        assert_eq!(connection.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_subscriptions() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        connection.subscribe("a").unwrap();
        let before = connection.subscriptions().to_vec();

        connection.subscribe("b").unwrap();
        connection.unsubscribe("b").unwrap();

        assert_eq!(connection.subscriptions(), before.as_slice());
        assert_eq!(connector.state().subscribes, vec![
            ("a".to_owned(), QoS::AtLeastOnce),
            ("b".to_owned(), QoS::AtLeastOnce)
        ]);
    }

    #[test]
    fn duplicate_subscribe_is_a_no_op() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);

        connection.subscribe("a").unwrap();
        connection.subscribe("a").unwrap();

        assert_eq!(connection.subscriptions(), ["a".to_owned()]);
        assert_eq!(connector.state().subscribes.len(), 1);
    }

    #[test]
    fn unsubscribe_unknown_topic_is_a_no_op() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        connection.subscribe("a").unwrap();

        connection.unsubscribe("b").unwrap();

        assert_eq!(connection.subscriptions(), ["a".to_owned()]);
        assert!(connector.state().unsubscribes.is_empty());
    }

    #[test]
    fn unsubscribe_keeps_order_of_the_rest() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        for topic in ["a", "b", "c"] {
            connection.subscribe(topic).unwrap();
        }

        connection.unsubscribe("b").unwrap();

        assert_eq!(connection.subscriptions(), ["a".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn repeated_publishes_are_indexed() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);

        connection.publish("hello", 3, false).unwrap();

        let payloads: Vec<_> = connector
            .state()
            .published
            .iter()
            .map(|p| p.payload.clone())
            .collect();
        assert_eq!(payloads, ["hello [0]", "hello [1]", "hello [2]"]);
    }

    #[test]
    fn single_publish_is_verbatim() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);

        connection.publish("hello world", 1, true).unwrap();

        assert_eq!(connector.state().published, vec![Published {
            topic: "hello/world".to_owned(),
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: "hello world".to_owned(),
        }]);
    }

    #[test]
    fn failed_publish_aborts_remaining_repeats() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        connector.state().fail_publish = Some(1);

        let result = connection.publish("hello", 5, false);

        assert!(matches!(result, Err(ConnectionError::Transport(_))));
        assert_eq!(connector.state().published.len(), 2);
    }

    #[test]
    fn publish_needs_a_topic() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        connection.set_topic("").unwrap();

        assert!(matches!(
            connection.publish("hello", 1, false),
            Err(ConnectionError::UndefinedTopic)
        ));
        assert!(connector.state().published.is_empty());
    }

    #[test]
    fn stalled_subscribe_times_out_without_recording() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        connector.state().stall = true;

        assert!(matches!(connection.subscribe("a"), Err(ConnectionError::Timeout(_))));
        assert!(connection.subscriptions().is_empty());
    }

    #[test]
    fn setters_update_fields() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);

        connection.set_client_id("other").unwrap();
        connection.set_topic("a/b").unwrap();
        connection.set_qos("2").unwrap();
        connection.set_timeout("0").unwrap();

        assert_eq!(connection.client_id(), "other");
        assert_eq!(connection.topic(), "a/b");
        assert_eq!(connection.qos(), QoS::ExactlyOnce);
        assert_eq!(connection.timeout(), Duration::ZERO);
    }

    #[test]
    fn malformed_numbers_leave_fields_unchanged() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);

        assert!(matches!(connection.set_qos("abc"), Err(ConnectionError::InvalidArgument(_))));
        assert!(matches!(connection.set_qos("3"), Err(ConnectionError::InvalidArgument(_))));
        assert!(matches!(connection.set_timeout("-1"), Err(ConnectionError::InvalidArgument(_))));

        assert_eq!(connection.qos(), QoS::AtLeastOnce);
        assert_eq!(connection.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn disconnect_keeps_record_reconnectable() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        connection.subscribe("a").unwrap();

        connection.disconnect();
        connection.disconnect();
        assert!(!connection.is_connected());
        assert_eq!(connector.state().disconnects, 1);

        let (tx, _rx) = events::channel();
        connection.connect(&connector, None, tx).unwrap();
        assert!(connection.is_connected());
        assert_eq!(connection.subscriptions(), ["a".to_owned()]);
    }

    #[test]
    fn reconnect_renews_recorded_subscriptions() {
        let connector = MockConnector::default();
        let mut connection = connected(&connector);
        connection.subscribe("a").unwrap();
        connection.subscribe("b").unwrap();
        connection.disconnect();

        connector.state().refuse_subscribe = Some("b".to_owned());
        let (tx, _rx) = events::channel();
        connection.connect(&connector, None, tx).unwrap();

        let topics: Vec<_> = connector
            .state()
            .subscribes
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect();
        assert_eq!(topics, ["a", "b", "a", "b"]);
        assert_eq!(connection.subscriptions(), ["a".to_owned()]);

        // the dropped filter can be subscribed again
        connector.state().refuse_subscribe = None;
        connection.subscribe("b").unwrap();
        assert_eq!(connector.state().subscribes.len(), 5);
    }

    #[test]
    fn info_describes_the_record() {
        let connector = MockConnector::default();
        let connection = connected(&connector);

        let json = serde_json::to_value(connection.info()).unwrap();
        assert_eq!(json["broker"], "tcp://localhost:1883");
        assert_eq!(json["qos"], 1);
        assert_eq!(json["timeout"], 100);
        assert_eq!(json["connected"], true);
    }
}
