//! Single-use response payloads.
//!
//! A [`Body`] can be read exactly once. Consumers that need two independent
//! reads (for example the caller and a cache store) must duplicate it with
//! [`Body::try_clone`] *before* either of them reads it.

use bytes::Bytes;
use thiserror::Error;

/// Errors produced when reading or duplicating a [`Body`].
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("body has already been consumed")]
    AlreadyUsed,

    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// A payload that can be consumed exactly once.
///
/// # Examples
///
/// ```
/// use cachefront::http::Body;
///
/// let mut original = Body::from("console.log(1)");
/// let mut copy = original.try_clone().unwrap();
///
/// assert_eq!(original.take().unwrap(), "console.log(1)");
/// assert_eq!(copy.take().unwrap(), "console.log(1)");
/// assert!(original.take().is_err());
/// ```
#[derive(Debug)]
pub struct Body {
    // `None` once the payload has been taken.
    inner: Option<Bytes>,
}

impl Body {
    /// Creates an empty, unread body.
    pub fn empty() -> Self {
        Self {
            inner: Some(Bytes::new()),
        }
    }

    /// Returns `true` once the payload has been taken.
    pub fn is_used(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns the payload length, or `None` if the body was consumed.
    pub fn len(&self) -> Option<usize> {
        self.inner.as_ref().map(Bytes::len)
    }

    /// Returns `true` if the body is unread and has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Consumes the payload.
    ///
    /// # Errors
    ///
    /// [`BodyError::AlreadyUsed`] if the payload was taken before.
    pub fn take(&mut self) -> Result<Bytes, BodyError> {
        self.inner.take().ok_or(BodyError::AlreadyUsed)
    }

    /// Duplicates an unread body. The two bodies are read independently.
    ///
    /// # Errors
    ///
    /// [`BodyError::AlreadyUsed`] if the payload was taken before.
    pub fn try_clone(&self) -> Result<Self, BodyError> {
        match &self.inner {
            Some(bytes) => Ok(Self {
                inner: Some(bytes.clone()),
            }),
            None => Err(BodyError::AlreadyUsed),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self { inner: Some(bytes) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}
