use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::ws::WsError;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The server refused or botched the HTTP upgrade
    Handshake,
    /// TLS session could not be established. Never retried.
    Tls,
    /// Transport failure while connecting, reading or writing
    Io,
    /// The peer violated the framing rules we enforce
    Protocol,
    /// Error related to invalid input supplied by the caller
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    /// Wraps a failure from the TLS layer. Errors of this kind disable reconnection.
    pub fn tls<S: StdError + Send + Sync + 'static>(source: S) -> Self {
        Self::with_source(Kind::Tls, source)
    }

    /// Whether this error ends the client for good rather than one connection attempt.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind == Kind::Tls
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::with_source(Kind::Io, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        let kind = match &e {
            WsError::HandshakeRejected { .. }
            | WsError::AcceptMismatch { .. }
            | WsError::InvalidResponse(_) => Kind::Handshake,
            WsError::PongTimeout | WsError::ConnectionClosed => Kind::Io,
            WsError::FrameTooLarge { .. }
            | WsError::MessageTooLarge { .. }
            | WsError::InvalidUtf8
            | WsError::Compression(_) => Kind::Protocol,
        };
        Error::with_source(kind, e)
    }
}
