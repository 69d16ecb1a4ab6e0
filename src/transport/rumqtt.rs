use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};
use log::{debug, error, trace, warn};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, Incoming, MqttOptions, Outgoing, Publish, QoS,
    SubscribeReasonCode,
};

use super::{qos_level, ConnectOptions, Connector, Transport, TransportError};
use crate::address::{Address, Scheme};
use crate::events::{Notification, ReceivedMessage};
use crate::token::{self, Completer, Token};

/// Back off between reconnection attempts after the connection is lost
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Opens `rumqttc` clients, each driven by its own event loop thread
pub struct RumqttConnector {
    pub keep_alive: Duration,
    pub ca_file: Option<PathBuf>,
}

impl RumqttConnector {
    fn options(&self, options: &ConnectOptions) -> Result<MqttOptions, TransportError> {
        let address = Address::parse(&options.broker)
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut mqttoptions = match address.scheme {
            // websocket transport connects to the complete url
            Scheme::Ws => MqttOptions::new(&options.client_id, &options.broker, address.port),
            _ => MqttOptions::new(&options.client_id, address.host(), address.port),
        };
        mqttoptions.set_keep_alive(self.keep_alive);
        mqttoptions.set_clean_session(true);

        if let Some(credentials) = &options.credentials {
            mqttoptions.set_credentials(&credentials.username, &credentials.password);
        }

        match address.scheme {
            Scheme::Tcp => {}
            Scheme::Ssl => {
                let ca_file = self.ca_file.as_ref().ok_or_else(|| {
                    TransportError::Connection("ssl:// brokers need a CA file".to_owned())
                })?;
                let ca = fs::read(ca_file)?;
                mqttoptions.set_transport(rumqttc::Transport::tls(ca, None, None));
            }
            Scheme::Ws => {
                mqttoptions.set_transport(rumqttc::Transport::Ws);
            }
        }

        Ok(mqttoptions)
    }
}

impl Connector for RumqttConnector {
    fn connect(
        &self,
        options: ConnectOptions,
        notifications: Sender<Notification>,
    ) -> Result<(Box<dyn Transport>, Token), TransportError> {
        let mqttoptions = self.options(&options)?;
        let (client, connection) = Client::new(mqttoptions, 10);
        let (connected, token) = token::pending();
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let shutdown = Arc::new(Shutdown::default());
        let (done_tx, done_rx) = flume::bounded(0);

        let event_loop = EventLoop {
            broker: options.broker.clone(),
            client: client.clone(),
            inflight: inflight.clone(),
            shutdown: shutdown.clone(),
            notifications,
            connected: Some(connected),
            _done: done_tx,
        };

        thread::Builder::new()
            .name(format!("mqtt {}", options.broker))
            .spawn(move || event_loop.run(connection))?;

        let transport = RumqttTransport {
            client,
            inflight,
            shutdown,
            done: done_rx,
        };

        Ok((Box::new(transport), token))
    }
}

#[derive(Debug, Clone)]
struct Filter {
    topic: String,
    qos: QoS,
}

/// Requests handed to the client which are still waiting for the broker
#[derive(Default)]
struct Inflight {
    // waiting to be written. rumqttc writes requests in order, entries stay
    // queued when their request failed until rumqttc writes it
    publishes: VecDeque<(QoS, Completer)>,
    subscribes: VecDeque<(Filter, Completer)>,
    unsubscribes: VecDeque<(String, Completer)>,
    // written, waiting for the ack with this pkid
    pubacks: HashMap<u16, Completer>,
    subacks: HashMap<u16, (Filter, Completer)>,
    unsubacks: HashMap<u16, (String, Completer)>,
    // qos 2 publishes the broker received, rumqttc resends their PubRel
    released: HashSet<u16>,
    // publishes rumqttc writes again after a reconnect
    resent: HashSet<u16>,
    // acknowledged subscription filters
    filters: Vec<Filter>,
}

/// Completer nobody waits for
fn detached() -> Completer {
    token::pending().0
}

impl Inflight {
    fn fail_all(&mut self, reason: &str) {
        let failed = || Err(TransportError::Connection(reason.to_owned()));

        for (_, c) in self.publishes.iter_mut() {
            mem::replace(c, detached()).complete(failed());
        }
        for (_, c) in self.subscribes.iter_mut() {
            mem::replace(c, detached()).complete(failed());
        }
        for (_, c) in self.unsubscribes.iter_mut() {
            mem::replace(c, detached()).complete(failed());
        }

        for (pkid, c) in self.pubacks.drain() {
            if !self.released.remove(&pkid) {
                self.resent.insert(pkid);
            }
            c.complete(failed());
        }
        self.subacks.drain().for_each(|(_, (_, c))| c.complete(failed()));
        self.unsubacks.drain().for_each(|(_, (_, c))| c.complete(failed()));
    }

    fn subscribed(&self, topic: &str) -> bool {
        self.filters
            .iter()
            .any(|filter| super::matches(topic, &filter.topic))
    }
}

fn lock(inflight: &Mutex<Inflight>) -> MutexGuard<'_, Inflight> {
    inflight.lock().unwrap_or_else(|e| e.into_inner())
}

/// Flags the transport raises to stop the event loop thread
#[derive(Default)]
struct Shutdown {
    closing: AtomicBool,
    // the disconnect request didn't fit the request channel
    abandoned: AtomicBool,
}

struct EventLoop {
    broker: String,
    client: Client,
    inflight: Arc<Mutex<Inflight>>,
    shutdown: Arc<Shutdown>,
    notifications: Sender<Notification>,
    // resolved by the first connack
    connected: Option<Completer>,
    // dropped when the thread exits which wakes up a lingering disconnect
    _done: Sender<()>,
}

impl EventLoop {
    fn run(mut self, mut connection: Connection) {
        for notification in connection.iter() {
            let event = match notification {
                Ok(event) => event,
                Err(e) => {
                    if let Some(connected) = self.connected.take() {
                        debug!("Id = {}, Connect failed = {:?}", self.broker, e);
                        connected.complete(Err(TransportError::Connection(e.to_string())));
                        break;
                    }

                    if self.closing() {
                        break;
                    }

                    warn!("Id = {}, Connection error = {:?}", self.broker, e);
                    lock(&self.inflight).fail_all(&e.to_string());
                    self.notify(Notification::ConnectionLost {
                        broker: self.broker.clone(),
                        reason: e.to_string(),
                    });

                    thread::sleep(RECONNECT_DELAY);
                    if self.closing() {
                        break;
                    }

                    self.notify(Notification::Reconnecting {
                        broker: self.broker.clone(),
                    });
                    continue;
                }
            };

            trace!("Id = {}, {:?}", self.broker, event);
            match event {
                Event::Outgoing(Outgoing::Disconnect) => break,
                _ if self.shutdown.abandoned.load(Ordering::SeqCst) => break,
                Event::Incoming(incoming) => self.incoming(incoming),
                Event::Outgoing(outgoing) => self.outgoing(outgoing),
            }
        }

        lock(&self.inflight).fail_all("disconnected");
        debug!("Id = {}, Event loop done", self.broker);
    }

    fn closing(&self) -> bool {
        self.shutdown.closing.load(Ordering::SeqCst)
    }

    fn incoming(&mut self, incoming: Incoming) {
        let mut inflight = lock(&self.inflight);
        match incoming {
            Incoming::ConnAck(ack) => {
                drop(inflight);
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("{:?}", ack.code);
                    if let Some(connected) = self.connected.take() {
                        connected.complete(Err(TransportError::Refused(reason)));
                    } else {
                        error!("Id = {}, Reconnect refused = {}", self.broker, reason);
                    }
                    return;
                }

                match self.connected.take() {
                    Some(connected) => connected.complete(Ok(())),
                    None if !ack.session_present => self.resubscribe(),
                    None => {}
                }

                self.notify(Notification::Connected {
                    broker: self.broker.clone(),
                });
            }
            Incoming::Publish(publish) => {
                let subscribed = inflight.subscribed(&publish.topic);
                drop(inflight);
                self.notify(Notification::Message {
                    message: received(publish),
                    subscribed,
                });
            }
            Incoming::PubAck(ack) => {
                if let Some(c) = inflight.pubacks.remove(&ack.pkid) {
                    c.complete(Ok(()));
                }
            }
            Incoming::PubRec(rec) => {
                inflight.released.insert(rec.pkid);
            }
            Incoming::PubComp(comp) => {
                inflight.released.remove(&comp.pkid);
                if let Some(c) = inflight.pubacks.remove(&comp.pkid) {
                    c.complete(Ok(()));
                }
            }
            Incoming::SubAck(ack) => {
                if let Some((filter, c)) = inflight.subacks.remove(&ack.pkid) {
                    let refused = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));

                    if refused {
                        c.complete(Err(TransportError::Refused(format!(
                            "subscription to {}",
                            filter.topic
                        ))));
                    } else {
                        inflight.filters.retain(|f| f.topic != filter.topic);
                        inflight.filters.push(filter);
                        c.complete(Ok(()));
                    }
                }
            }
            Incoming::UnsubAck(ack) => {
                if let Some((topic, c)) = inflight.unsubacks.remove(&ack.pkid) {
                    inflight.filters.retain(|f| f.topic != topic);
                    c.complete(Ok(()));
                }
            }
            _ => {}
        }
    }

    fn outgoing(&mut self, outgoing: Outgoing) {
        let mut inflight = lock(&self.inflight);
        match outgoing {
            Outgoing::Publish(pkid) if pkid != 0 && inflight.resent.remove(&pkid) => {
                debug!("Id = {}, Resent publish = {}", self.broker, pkid);
            }
            Outgoing::Publish(pkid) => match inflight.publishes.pop_front() {
                Some((QoS::AtMostOnce, c)) => c.complete(Ok(())),
                Some((_, c)) => {
                    inflight.pubacks.insert(pkid, c);
                }
                None => debug!("Id = {}, Untracked publish = {}", self.broker, pkid),
            },
            Outgoing::Subscribe(pkid) => {
                if let Some(pending) = inflight.subscribes.pop_front() {
                    inflight.subacks.insert(pkid, pending);
                }
            }
            Outgoing::Unsubscribe(pkid) => {
                if let Some(pending) = inflight.unsubscribes.pop_front() {
                    inflight.unsubacks.insert(pkid, pending);
                }
            }
            _ => {}
        }
    }

    /// Sessions are clean, so after rumqttc reconnected on its own the
    /// acknowledged filters are requested again
    fn resubscribe(&mut self) {
        let mut inflight = lock(&self.inflight);
        let filters = inflight.filters.clone();
        for filter in filters {
            debug!("Id = {}, Resubscribing to {}", self.broker, filter.topic);
            inflight.subscribes.push_back((filter.clone(), detached()));
            if let Err(e) = self.client.try_subscribe(filter.topic.clone(), filter.qos) {
                inflight.subscribes.pop_back();
                warn!("Id = {}, Resubscribe to {} failed = {}", self.broker, filter.topic, e);
            }
        }
    }

    fn notify(&self, notification: Notification) {
        // listener is gone during shutdown
        let _ = self.notifications.send(notification);
    }
}

fn received(publish: Publish) -> ReceivedMessage {
    ReceivedMessage {
        payload: String::from_utf8_lossy(&publish.payload).into_owned(),
        qos: qos_level(publish.qos),
        retained: publish.retain,
        duplicate: publish.dup,
        message_id: publish.pkid,
        topic: publish.topic,
    }
}

struct RumqttTransport {
    client: Client,
    inflight: Arc<Mutex<Inflight>>,
    shutdown: Arc<Shutdown>,
    done: Receiver<()>,
}

// Requests use the non blocking `try_` calls. rumqttc stops draining its
// request channel while it is disconnected, a blocking send would hang the
// interpreter before the token is ever waited on.
impl Transport for RumqttTransport {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Token {
        let (c, token) = token::pending();
        let filter = Filter {
            topic: topic.to_owned(),
            qos,
        };
        lock(&self.inflight).subscribes.push_back((filter, c));

        if let Err(e) = self.client.try_subscribe(topic, qos) {
            lock(&self.inflight).subscribes.pop_back();
            return Token::failed(e);
        }

        token
    }

    fn unsubscribe(&mut self, topic: &str) -> Token {
        let (c, token) = token::pending();
        lock(&self.inflight)
            .unsubscribes
            .push_back((topic.to_owned(), c));

        if let Err(e) = self.client.try_unsubscribe(topic) {
            lock(&self.inflight).unsubscribes.pop_back();
            return Token::failed(e);
        }

        token
    }

    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: String) -> Token {
        let (c, token) = token::pending();
        lock(&self.inflight).publishes.push_back((qos, c));

        if let Err(e) = self.client.try_publish(topic, qos, retain, payload) {
            lock(&self.inflight).publishes.pop_back();
            return Token::failed(e);
        }

        token
    }

    fn disconnect(&mut self, linger: Duration) {
        self.shutdown.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request failed = {:?}", e);
            self.shutdown.abandoned.store(true, Ordering::SeqCst);
        }

        // returns early once the event loop thread exits
        let _ = self.done.recv_timeout(linger);
    }
}
