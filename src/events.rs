//! Asynchronous notifications coming out of the transport threads.
//!
//! Transports never touch shared state directly. They send a [`Notification`]
//! over a channel and a single listener thread applies it through
//! [`EventSink::handle`].

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use colored::Colorize;
use flume::{Receiver, Sender};
use log::debug;
use serde::Serialize;

use crate::output::Output;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retained: bool,
    pub duplicate: bool,
    pub message_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Connected { broker: String },
    ConnectionLost { broker: String, reason: String },
    Reconnecting { broker: String },
    Message { message: ReceivedMessage, subscribed: bool },
}

/// Process wide slot holding the most recently received message
#[derive(Clone, Default)]
pub struct LastMessage {
    inner: Arc<Mutex<Option<ReceivedMessage>>>,
}

impl LastMessage {
    pub fn get(&self) -> Option<ReceivedMessage> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set(&self, message: ReceivedMessage) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }
}

pub struct EventSink {
    output: Output,
    last_message: LastMessage,
}

impl EventSink {
    pub fn new(output: Output, last_message: LastMessage) -> EventSink {
        EventSink {
            output,
            last_message,
        }
    }

    pub fn handle(&self, notification: Notification) {
        match notification {
            Notification::Connected { broker } => {
                self.output
                    .line(format!("-- [MQTT Event] Connected to {}", broker).green());
            }
            Notification::ConnectionLost { broker, reason } => {
                self.output.line(
                    format!("-- [MQTT Event] Connection to {} lost: {}", broker, reason).yellow(),
                );
            }
            Notification::Reconnecting { broker } => {
                self.output
                    .line(format!("-- [MQTT Event] Reconnecting to {}", broker).yellow());
            }
            Notification::Message {
                message,
                subscribed,
            } => {
                let text = if subscribed {
                    format!("-- [MQTT Event] Received [{}]: {}", message.topic, message.payload)
                } else {
                    format!(
                        "-- [MQTT Event] Unsubscribed message received [{}]: {}",
                        message.topic, message.payload
                    )
                };

                self.last_message.set(message);
                self.output.line(text.cyan());
            }
        }
    }

    /// Drains `rx` on a dedicated thread until every sender is gone
    pub fn spawn(self, rx: Receiver<Notification>) -> JoinHandle<()> {
        thread::spawn(move || {
            for notification in rx.iter() {
                debug!("Notification = {:?}", notification);
                self.handle(notification);
            }
        })
    }
}

/// Channel transports report their events on
pub fn channel() -> (Sender<Notification>, Receiver<Notification>) {
    flume::unbounded()
}
