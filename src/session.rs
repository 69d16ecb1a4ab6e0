//! Registry of broker connections and the pointer to the current one.
//!
//! The registry is owned and mutated by the interpreter thread only. Transport
//! threads reach shared state exclusively through the notification channel.

use std::collections::BTreeMap;
use std::time::Duration;

use flume::Sender;
use log::debug;
use rumqttc::QoS;

use crate::address::Address;
use crate::connection::{Connection, ConnectionError, ConnectionInfo};
use crate::events::Notification;
use crate::transport::{Connector, Credentials};

/// Settings new connection records start out with
#[derive(Debug, Clone)]
pub struct Defaults {
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub timeout: Duration,
}

pub struct Session {
    connector: Box<dyn Connector>,
    defaults: Defaults,
    connections: BTreeMap<String, Connection>,
    current: Option<String>,
    notifications: Sender<Notification>,
}

impl Session {
    pub fn new(
        connector: Box<dyn Connector>,
        defaults: Defaults,
        notifications: Sender<Notification>,
    ) -> Session {
        Session {
            connector,
            defaults,
            connections: BTreeMap::new(),
            current: None,
            notifications,
        }
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Connects to `broker` and makes it the current connection. Known
    /// brokers reuse their record, new ones are only registered once the
    /// connect succeeded. User info in the address is used when no username
    /// is given.
    pub fn connect(&mut self, broker: &str, username: &str, password: &str) -> Result<(), ConnectionError> {
        let address = Address::parse(broker).map_err(|e| ConnectionError::ConnectFailed {
            broker: broker.to_owned(),
            source: Box::new(e.into()),
        })?;
        let broker = address.to_string();

        let credentials = if username.is_empty() {
            address.credentials
        } else {
            Some(Credentials {
                username: username.to_owned(),
                password: password.to_owned(),
            })
        };

        let notifications = self.notifications.clone();
        match self.connections.get_mut(&broker) {
            Some(connection) => {
                connection.connect(self.connector.as_ref(), credentials, notifications)?;
            }
            None => {
                let defaults = &self.defaults;
                let mut connection = Connection::new(
                    broker.clone(),
                    defaults.client_id.clone(),
                    defaults.topic.clone(),
                    defaults.qos,
                    defaults.timeout,
                );
                connection.connect(self.connector.as_ref(), credentials, notifications)?;
                self.connections.insert(broker.clone(), connection);
            }
        }

        debug!("Current connection = {}", broker);
        self.current = Some(broker);
        Ok(())
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<&Connection> {
        self.current
            .as_ref()
            .and_then(|broker| self.connections.get(broker))
    }

    /// Current connection, `NotConnected` before the first connect
    pub fn current_mut(&mut self) -> Result<&mut Connection, ConnectionError> {
        let broker = self.current.as_ref().ok_or(ConnectionError::NotConnected)?;
        self.connections
            .get_mut(broker)
            .ok_or(ConnectionError::NotConnected)
    }

    /// Disconnects the current connection, if any
    pub fn disconnect(&mut self) {
        if let Ok(connection) = self.current_mut() {
            connection.disconnect();
        }
    }

    pub fn infos(&self) -> BTreeMap<&str, ConnectionInfo<'_>> {
        self.connections
            .iter()
            .map(|(broker, connection)| (broker.as_str(), connection.info()))
            .collect()
    }

    /// Disconnects every known connection
    pub fn shutdown(&mut self) {
        for connection in self.connections.values_mut() {
            connection.disconnect();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
