//! Lazy, fallible event sequences.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{extract_panic_message, DerivationError};

/// The events a command derives, produced lazily.
///
/// The journal pulls items while staging a commit. An `Err` item aborts the
/// unit: nothing from the command becomes visible, and the pipeline still
/// releases every lock taken so far.
///
/// ```ignore
/// // Known up front
/// EventStream::from_vec(vec![Deposited { amount }])
///
/// // Computed lazily, may fail partway
/// EventStream::try_iter(rows.into_iter().map(|row| parse(row)))
/// ```
pub struct EventStream<T> {
    inner: BoxStream<'static, Result<T, DerivationError>>,
}

impl<T: Send + 'static> EventStream<T> {
    /// A command that changes nothing.
    pub fn empty() -> Self {
        Self::from_stream(stream::empty())
    }

    pub fn from_vec(events: Vec<T>) -> Self {
        Self::from_iter(events)
    }

    pub fn from_iter<I>(events: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(events.into_iter().map(Ok)))
    }

    /// Fallible iterator; the first `Err` aborts the unit.
    pub fn try_iter<I>(events: I) -> Self
    where
        I: IntoIterator<Item = Result<T, DerivationError>>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(events))
    }

    pub fn from_stream<S>(inner: S) -> Self
    where
        S: Stream<Item = Result<T, DerivationError>> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
        }
    }

    /// Apply a fallible transformation to each event.
    pub fn and_then_each<U, F>(self, mut f: F) -> EventStream<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Result<U, DerivationError> + Send + 'static,
    {
        EventStream::from_stream(self.inner.map(move |item| item.and_then(&mut f)))
    }

    /// Turn a panic while producing an item into a
    /// [`DerivationError::Panicked`] item, after which the stream ends.
    pub fn catch_panics(self) -> Self {
        Self {
            inner: CatchPanics {
                inner: self.inner,
                done: false,
            }
            .boxed(),
        }
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<T>, DerivationError> {
        let mut out = Vec::new();
        while let Some(item) = self.inner.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl<T> Stream for EventStream<T> {
    type Item = Result<T, DerivationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

struct CatchPanics<T> {
    inner: BoxStream<'static, Result<T, DerivationError>>,
    done: bool,
}

impl<T> Stream for CatchPanics<T> {
    type Item = Result<T, DerivationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let inner = &mut this.inner;
        match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll_next(cx))) {
            Ok(poll) => poll,
            Err(panic_info) => {
                this.done = true;
                Poll::Ready(Some(Err(DerivationError::Panicked {
                    message: extract_panic_message(&panic_info),
                })))
            }
        }
    }
}

impl<T> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
