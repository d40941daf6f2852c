//! A single-load outcome channel.
//!
//! Every load started through [`LazySubject::new_load`](crate::LazySubject::new_load) or
//! [`LazySubject::reload`](crate::LazySubject::reload) gets its own [`LoadSignal`]. It mirrors
//! the values pushed by that load only, and is closed exactly once: with success, with the load's
//! error, or with [`LoadError::Cancelled`] once the load is superseded or torn down.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use crate::error::LoadError;

#[derive(Debug, Clone)]
struct SignalState<T> {
    /// The last pushed value.
    last: Option<T>,
    /// Number of values pushed so far.
    pushed: u64,
    /// Set once the signal is closed.
    terminal: Option<Result<(), LoadError>>,
}

/// The sending half, owned by a load task.
#[derive(Debug)]
pub(crate) struct LoadSignal<T> {
    sender: watch::Sender<SignalState<T>>,
}

impl<T: Clone + Send + Sync + 'static> LoadSignal<T> {
    pub fn new() -> (Self, LoadOutcome<T>) {
        let (sender, receiver) = watch::channel(SignalState {
            last: None,
            pushed: 0,
            terminal: None,
        });
        (Self { sender }, LoadOutcome { receiver })
    }

    /// Pushes a value, unless the signal is already closed.
    pub fn push(&self, value: T) {
        self.sender.send_if_modified(|state| {
            if state.terminal.is_some() {
                return false;
            }
            state.last = Some(value);
            state.pushed += 1;
            true
        });
    }

    /// Closes the signal successfully. Returns `false` if it was already closed.
    pub fn complete(&self) -> bool {
        self.close(Ok(()))
    }

    /// Closes the signal with an error. Returns `false` if it was already closed.
    pub fn fail(&self, error: LoadError) -> bool {
        self.close(Err(error))
    }

    fn close(&self, outcome: Result<(), LoadError>) -> bool {
        self.sender.send_if_modified(|state| {
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(outcome);
            true
        })
    }
}

/// The receiving half of a single load.
///
/// This can be cloned and observed any number of times. New observers see the last pushed value
/// and, if the load already finished, its terminal outcome.
///
/// If the load is dropped without ever being closed (for example because its subject was dropped
/// entirely), the outcome reports [`LoadError::Cancelled`].
#[derive(Debug, Clone)]
pub struct LoadOutcome<T> {
    receiver: watch::Receiver<SignalState<T>>,
}

impl<T: Clone + Send + Sync + 'static> LoadOutcome<T> {
    /// Returns the last value pushed by this load, if any.
    pub fn last_value(&self) -> Option<T> {
        self.receiver.borrow().last.clone()
    }

    /// Returns the terminal outcome, if the load already finished.
    pub fn try_outcome(&self) -> Option<Result<(), LoadError>> {
        self.receiver.borrow().terminal.clone()
    }

    /// Waits for the load to finish.
    ///
    /// Resolves to the last value pushed by the load, or to the error that terminated it.
    pub async fn finished(mut self) -> Result<Option<T>, LoadError> {
        let state = self
            .receiver
            .wait_for(|state| state.terminal.is_some())
            .await
            .map_err(|_| LoadError::Cancelled)?;
        match &state.terminal {
            Some(Err(err)) => Err(err.clone()),
            _ => Ok(state.last.clone()),
        }
    }

    /// Turns this into a finite stream of the values pushed by this load.
    ///
    /// The stream yields the latest value whenever a new one arrives, and ends once the load is
    /// finished. If the load failed or was cancelled, the error is yielded as the last item.
    pub fn into_stream(self) -> BoxStream<'static, Result<T, LoadError>> {
        let state = (self.receiver, 0u64, false);
        stream::unfold(state, |(mut receiver, mut seen, done)| async move {
            if done {
                return None;
            }
            loop {
                let (item, terminal) = {
                    let state = receiver.borrow_and_update();
                    let item = if state.pushed > seen {
                        seen = state.pushed;
                        state.last.clone()
                    } else {
                        None
                    };
                    (item, state.terminal.clone())
                };

                match (item, terminal) {
                    (Some(value), terminal) => {
                        // a terminal state is picked up on the next poll
                        if terminal.is_some() {
                            receiver.mark_changed();
                        }
                        return Some((Ok(value), (receiver, seen, false)));
                    }
                    (None, Some(Ok(()))) => return None,
                    (None, Some(Err(err))) => return Some((Err(err), (receiver, seen, true))),
                    (None, None) => {
                        if receiver.changed().await.is_err() {
                            return Some((Err(LoadError::Cancelled), (receiver, seen, true)));
                        }
                    }
                }
            }
        })
        .boxed()
    }
}
