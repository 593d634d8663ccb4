use std::{pin::Pin, task::{Context, Poll}};

use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, Incoming};

use http_body_util::Full;

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),
}

#[derive(Default)]
#[repr(transparent)]
#[must_use]
pub struct Body(pub(crate) BodyInner);

#[derive(Default)]
#[pin_project::pin_project(project = BodyProj)]
pub(crate) enum BodyInner {
    #[default]
    Empty,
    Incoming(#[pin] hyper::body::Incoming),
    Full(#[pin] Full<Bytes>),
}

// assert Send
const _: () = {
    const fn test_send<T: Send>() {}
    test_send::<Body>();
};

impl HttpBody for Body {
    type Data = Bytes;
    type Error = BodyError;

    #[inline]
    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().0).poll_frame(cx)
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }

    #[inline]
    fn size_hint(&self) -> hyper::body::SizeHint {
        self.0.size_hint()
    }
}

impl HttpBody for BodyInner {
    type Data = Bytes;
    type Error = BodyError;

    #[inline]
    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            BodyProj::Empty => Poll::Ready(None),
            BodyProj::Incoming(incoming) => incoming.poll_frame(cx).map_err(BodyError::from),
            BodyProj::Full(full) => full.poll_frame(cx).map_err(|_| unreachable!()),
        }
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Incoming(inner) => inner.is_end_stream(),
            Self::Full(inner) => inner.is_end_stream(),
        }
    }

    #[inline]
    fn size_hint(&self) -> hyper::body::SizeHint {
        match self {
            Self::Empty => hyper::body::SizeHint::new(),
            Self::Incoming(inner) => inner.size_hint(),
            Self::Full(inner) => inner.size_hint(),
        }
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(value: Bytes) -> Self {
        Body(BodyInner::Full(Full::new(value)))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(value: String) -> Self {
        Bytes::from(value).into()
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(value: &'static str) -> Self {
        Bytes::from_static(value.as_bytes()).into()
    }
}

impl From<Incoming> for Body {
    #[inline]
    fn from(incoming: Incoming) -> Self {
        Body(BodyInner::Incoming(incoming))
    }
}

impl Body {
    /// Create a new empty body that yields no frames.
    pub const fn empty() -> Body {
        Body(BodyInner::Empty)
    }

    /// Returns `true` if the body is empty.
    pub const fn is_empty(&self) -> bool {
        matches!(self.0, BodyInner::Empty)
    }
}
