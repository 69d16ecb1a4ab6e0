//! In-memory transport recording every request, for tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flume::Sender;
use rumqttc::QoS;

use super::{ConnectOptions, Connector, Transport, TransportError};
use crate::events::Notification;
use crate::token::{self, Completer, Token};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: String,
}

#[derive(Default)]
pub struct State {
    pub connects: Vec<ConnectOptions>,
    pub subscribes: Vec<(String, QoS)>,
    pub unsubscribes: Vec<String>,
    pub published: Vec<Published>,
    pub disconnects: usize,
    /// refuse every connect
    pub refuse_connect: bool,
    /// refuse subscriptions to this filter
    pub refuse_subscribe: Option<String>,
    /// fail the publish with this zero based index
    pub fail_publish: Option<usize>,
    /// never resolve tokens so waits run into their timeout
    pub stall: bool,
    // keeps stalled tokens pending instead of closed
    stalled: Vec<Completer>,
}

/// Connector whose transports share one recorded [`State`]
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<State>>,
}

impl MockConnector {
    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

fn outcome(state: &mut State, result: Result<(), TransportError>) -> Token {
    if state.stall {
        let (c, token) = token::pending();
        state.stalled.push(c);
        return token;
    }

    Token::resolved(result)
}

impl Connector for MockConnector {
    fn connect(
        &self,
        options: ConnectOptions,
        notifications: Sender<Notification>,
    ) -> Result<(Box<dyn Transport>, Token), TransportError> {
        let mut state = self.state();
        let broker = options.broker.clone();
        state.connects.push(options);

        let result = if state.refuse_connect {
            Err(TransportError::Refused("NotAuthorized".to_owned()))
        } else {
            let _ = notifications.send(Notification::Connected { broker });
            Ok(())
        };

        let token = outcome(&mut state, result);
        let transport = MockTransport {
            state: self.state.clone(),
        };

        Ok((Box::new(transport), token))
    }
}

struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl Transport for MockTransport {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Token {
        let mut state = self.state.lock().unwrap();
        state.subscribes.push((topic.to_owned(), qos));
        let result = match &state.refuse_subscribe {
            Some(filter) if filter == topic => Err(TransportError::Refused(format!(
                "subscription to {}",
                topic
            ))),
            _ => Ok(()),
        };
        outcome(&mut state, result)
    }

    fn unsubscribe(&mut self, topic: &str) -> Token {
        let mut state = self.state.lock().unwrap();
        state.unsubscribes.push(topic.to_owned());
        outcome(&mut state, Ok(()))
    }

    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: String) -> Token {
        let mut state = self.state.lock().unwrap();
        let index = state.published.len();
        state.published.push(Published {
            topic: topic.to_owned(),
            qos,
            retain,
            payload,
        });

        let result = match state.fail_publish {
            Some(i) if i == index => Err(TransportError::Connection("broken pipe".to_owned())),
            _ => Ok(()),
        };
        outcome(&mut state, result)
    }

    fn disconnect(&mut self, _linger: Duration) {
        self.state.lock().unwrap().disconnects += 1;
    }
}
