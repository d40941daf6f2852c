use std::sync::Arc;

use thiserror::Error;

/// The reason a load did not produce a value.
///
/// This is cheaply cloneable, as it is stored inside cached [`LoadResult`](crate::LoadResult)s
/// which are handed out to every consumer.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The loader finished without emitting a single value.
    ///
    /// A loader must either emit at least once or fail.
    #[error("loader finished without emitting a value")]
    EmptyLoad,
    /// The load was superseded by a newer one, or its subject was torn down.
    ///
    /// This is only ever reported to the [`LoadOutcome`](crate::LoadOutcome) of that specific
    /// load, never to the shared cached result.
    #[error("load was cancelled")]
    Cancelled,
    /// The loader returned an error.
    #[error("load failed: {0:#}")]
    Failed(Arc<anyhow::Error>),
    /// The loader panicked.
    #[error("loader panicked: {0}")]
    Panicked(String),
}

impl LoadError {
    /// Returns `true` if this is the [`Cancelled`](Self::Cancelled) variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Creates an error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self::Panicked(message)
    }
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

/// Errors compare by kind, loader failures by identity.
impl PartialEq for LoadError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::EmptyLoad, Self::EmptyLoad) => true,
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::Failed(a), Self::Failed(b)) => Arc::ptr_eq(a, b),
            (Self::Panicked(a), Self::Panicked(b)) => a == b,
            _ => false,
        }
    }
}
