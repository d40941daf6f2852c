//! The tri-state result algebra produced by subjects and caches.

use std::fmt;
use std::sync::Arc;

use crate::error::LoadError;

/// Where a value was loaded from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Source {
    #[default]
    Unknown,
    Cache,
    Network,
}

/// Re-triggers the load that produced a result.
///
/// The boolean argument asks for a *silent* reload, which does not publish
/// [`LoadResult::Pending`] before the new value arrives.
#[derive(Clone)]
pub struct RetryAction(Arc<dyn Fn(bool) + Send + Sync>);

impl RetryAction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A retry action that does nothing.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn retry(&self, silent: bool) {
        (self.0)(silent)
    }
}

impl Default for RetryAction {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for RetryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryAction")
    }
}

/// Retry actions are equal only if they are clones of each other.
impl PartialEq for RetryAction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The state of a load as seen by consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult<T> {
    /// Nothing has been loaded yet.
    Pending,
    /// A value was loaded.
    Success {
        value: T,
        source: Source,
        /// Whether the loader is still working on a newer value.
        loading_in_background: bool,
        retry: RetryAction,
    },
    /// The load failed.
    Error {
        error: LoadError,
        source: Source,
        loading_in_background: bool,
        retry: RetryAction,
    },
}

impl<T> Default for LoadResult<T> {
    fn default() -> Self {
        Self::Pending
    }
}

impl<T> LoadResult<T> {
    /// A completed result with default metadata.
    pub fn success(value: T) -> Self {
        Self::Success {
            value,
            source: Source::Unknown,
            loading_in_background: false,
            retry: RetryAction::noop(),
        }
    }

    /// A failed result with default metadata.
    pub fn error(error: impl Into<LoadError>) -> Self {
        Self::Error {
            error: error.into(),
            source: Source::Unknown,
            loading_in_background: false,
            retry: RetryAction::noop(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` for [`Success`](Self::Success) and [`Error`](Self::Error).
    pub fn is_completed(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn error_ref(&self) -> Option<&LoadError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The source of a completed result. `Pending` has none.
    pub fn source(&self) -> Option<Source> {
        match self {
            Self::Pending => None,
            Self::Success { source, .. } | Self::Error { source, .. } => Some(*source),
        }
    }

    pub fn is_loading_in_background(&self) -> bool {
        match self {
            Self::Pending => false,
            Self::Success {
                loading_in_background,
                ..
            }
            | Self::Error {
                loading_in_background,
                ..
            } => *loading_in_background,
        }
    }

    /// Invokes the retry action of a completed result. Does nothing for `Pending`.
    pub fn retry(&self, silent: bool) {
        if let Self::Success { retry, .. } | Self::Error { retry, .. } = self {
            retry.retry(silent);
        }
    }

    /// Replaces the source tag of a completed result.
    pub fn with_source(mut self, new_source: Source) -> Self {
        if let Self::Success { source, .. } | Self::Error { source, .. } = &mut self {
            *source = new_source;
        }
        self
    }

    /// Replaces the background flag of a completed result.
    pub fn with_background_flag(mut self, flag: bool) -> Self {
        if let Self::Success {
            loading_in_background,
            ..
        }
        | Self::Error {
            loading_in_background,
            ..
        } = &mut self
        {
            *loading_in_background = flag;
        }
        self
    }

    /// Replaces the retry action of a completed result.
    pub fn with_retry(mut self, action: RetryAction) -> Self {
        if let Self::Success { retry, .. } | Self::Error { retry, .. } = &mut self {
            *retry = action;
        }
        self
    }

    /// Maps the value of a `Success`, keeping all metadata.
    pub fn map<U, F>(self, f: F) -> LoadResult<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Pending => LoadResult::Pending,
            Self::Success {
                value,
                source,
                loading_in_background,
                retry,
            } => LoadResult::Success {
                value: f(value),
                source,
                loading_in_background,
                retry,
            },
            Self::Error {
                error,
                source,
                loading_in_background,
                retry,
            } => LoadResult::Error {
                error,
                source,
                loading_in_background,
                retry,
            },
        }
    }
}

/// Folds a sequence of results into one.
///
/// The first `Error` wins, otherwise any `Pending` makes the whole result pending. When all
/// inputs succeeded, the values are collected in order. The combined result is loading in the
/// background if any input is, and retrying it retries every input.
pub fn combine<T, I>(results: I) -> LoadResult<Vec<T>>
where
    I: IntoIterator<Item = LoadResult<T>>,
{
    let mut values = Vec::new();
    let mut retries = Vec::new();
    let mut background = false;
    let mut pending = false;
    let mut first_error = None;

    for result in results {
        match result {
            LoadResult::Pending => pending = true,
            LoadResult::Success {
                value,
                loading_in_background,
                retry,
                ..
            } => {
                values.push(value);
                background |= loading_in_background;
                retries.push(retry);
            }
            LoadResult::Error {
                error,
                source,
                loading_in_background,
                retry,
            } => {
                background |= loading_in_background;
                retries.push(retry);
                if first_error.is_none() {
                    first_error = Some((error, source));
                }
            }
        }
    }

    let retry = RetryAction::new(move |silent| {
        for retry in &retries {
            retry.retry(silent);
        }
    });

    if let Some((error, source)) = first_error {
        LoadResult::Error {
            error,
            source,
            loading_in_background: background,
            retry,
        }
    } else if pending {
        LoadResult::Pending
    } else {
        LoadResult::Success {
            value: values,
            source: Source::Unknown,
            loading_in_background: background,
            retry,
        }
    }
}
