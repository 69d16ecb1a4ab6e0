//! Completion handles for asynchronous mqtt operations.
//!
//! Every protocol verb (connect, subscribe, unsubscribe, publish) hands back a
//! [`Token`]. The transport's event thread resolves the matching [`Completer`]
//! when the broker acknowledges the request, and the interpreter thread blocks
//! on [`wait`] until that happens or the configured timeout elapses.

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

use crate::connection::ConnectionError;
use crate::transport::TransportError;

type Outcome = Result<(), TransportError>;

/// Receiving half of an in-flight operation
#[derive(Debug)]
pub struct Token {
    rx: Receiver<Outcome>,
}

/// Resolving half of an in-flight operation, owned by the transport
#[derive(Debug)]
pub struct Completer {
    tx: Sender<Outcome>,
}

/// Creates a pending operation
pub fn pending() -> (Completer, Token) {
    let (tx, rx) = flume::bounded(1);
    (Completer { tx }, Token { rx })
}

impl Token {
    /// A token that is already resolved with `outcome`
    pub fn resolved(outcome: Outcome) -> Token {
        let (completer, token) = pending();
        completer.complete(outcome);
        token
    }

    pub fn failed(error: impl Into<TransportError>) -> Token {
        Token::resolved(Err(error.into()))
    }
}

impl Completer {
    pub fn complete(self, outcome: Outcome) {
        // Nobody is waiting anymore when the token was dropped after a timeout
        let _ = self.tx.send(outcome);
    }
}

/// Blocks until the operation behind `token` completes. A zero `timeout`
/// waits indefinitely.
pub fn wait(timeout: Duration, token: Token) -> Result<(), ConnectionError> {
    let outcome = if timeout.is_zero() {
        token.rx.recv().map_err(|_| TransportError::Closed)?
    } else {
        match token.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => return Err(ConnectionError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    };

    outcome.map_err(ConnectionError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolved_token_returns_immediately() {
        let token = Token::resolved(Ok(()));
        assert!(wait(Duration::from_millis(10), token).is_ok());
    }

    #[test]
    fn failure_is_propagated() {
        let token = Token::failed(TransportError::Refused("bad".to_owned()));
        match wait(Duration::from_millis(10), token) {
            Err(ConnectionError::Transport(TransportError::Refused(reason))) => {
                assert_eq!(reason, "bad")
            }
            v => panic!("Unexpected outcome = {:?}", v),
        }
    }

    #[test]
    fn pending_token_times_out() {
        let (_completer, token) = pending();
        let timeout = Duration::from_millis(20);
        match wait(timeout, token) {
            Err(ConnectionError::Timeout(t)) => assert_eq!(t, timeout),
            v => panic!("Unexpected outcome = {:?}", v),
        }
    }

    #[test]
    fn dropped_completer_means_closed() {
        let (completer, token) = pending();
        drop(completer);
        assert!(matches!(
            wait(Duration::ZERO, token),
            Err(ConnectionError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn zero_timeout_waits_for_other_thread() {
        let (completer, token) = pending();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            completer.complete(Ok(()));
        });

        assert!(wait(Duration::ZERO, token).is_ok());
        handle.join().unwrap();
    }
}
