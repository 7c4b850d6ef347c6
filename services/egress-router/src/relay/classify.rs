//! Classification of relay IO failures.
//!
//! Copy loops and dials hand raw `io::Error`s to a [`Classifier`], which maps
//! them onto a small tagged set:
//! - `PeerClosed`: the remote end went away (reset, broken pipe, closed fd).
//!   This is normal teardown and is not reported as a warning.
//! - `Timeout`: a deadline elapsed.
//! - `Other`: anything else, carrying the raw message.
//!
//! Classification is a lookup over an ordered signature table. New
//! signatures are added with [`Classifier::with_signature`]; the bridge
//! control flow never inspects error text itself.

use std::fmt;
use std::io;

/// A relay failure after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedError {
    /// The peer closed or reset its side of the connection.
    PeerClosed,
    /// A deadline was exceeded.
    Timeout,
    /// Any other failure.
    Other(String),
}

impl ClassifiedError {
    /// Whether this failure is expected connection teardown.
    pub fn is_expected(&self) -> bool {
        matches!(self, ClassifiedError::PeerClosed)
    }

    /// Short stable name for log fields.
    pub fn kind_str(&self) -> &'static str {
        match self {
            ClassifiedError::PeerClosed => "peer_closed",
            ClassifiedError::Timeout => "timeout",
            ClassifiedError::Other(_) => "other",
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifiedError::PeerClosed => write!(f, "peer closed connection"),
            ClassifiedError::Timeout => write!(f, "timed out"),
            ClassifiedError::Other(message) => write!(f, "{}", message),
        }
    }
}

/// Category a signature maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PeerClosed,
    Timeout,
}

/// How a signature recognizes an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Match on the error kind reported by the OS.
    Kind(io::ErrorKind),
    /// Match when the lowercased error message contains this text.
    Message(String),
}

/// One entry of the classification table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub matcher: Matcher,
    pub class: ErrorClass,
}

impl Signature {
    /// Signature matching an `io::ErrorKind`.
    pub fn kind(kind: io::ErrorKind, class: ErrorClass) -> Self {
        Self {
            matcher: Matcher::Kind(kind),
            class,
        }
    }

    /// Signature matching a message fragment (case-insensitive).
    pub fn message(fragment: &str, class: ErrorClass) -> Self {
        Self {
            matcher: Matcher::Message(fragment.to_lowercase()),
            class,
        }
    }

    fn matches(&self, kind: io::ErrorKind, message: &str) -> bool {
        match &self.matcher {
            Matcher::Kind(k) => *k == kind,
            Matcher::Message(fragment) => message.contains(fragment.as_str()),
        }
    }
}

fn default_signatures() -> Vec<Signature> {
    use std::io::ErrorKind::*;

    vec![
        Signature::kind(ConnectionReset, ErrorClass::PeerClosed),
        Signature::kind(ConnectionAborted, ErrorClass::PeerClosed),
        Signature::kind(BrokenPipe, ErrorClass::PeerClosed),
        Signature::kind(NotConnected, ErrorClass::PeerClosed),
        Signature::kind(UnexpectedEof, ErrorClass::PeerClosed),
        Signature::kind(TimedOut, ErrorClass::Timeout),
        Signature::message("connection reset by peer", ErrorClass::PeerClosed),
        Signature::message("broken pipe", ErrorClass::PeerClosed),
        Signature::message("use of closed network connection", ErrorClass::PeerClosed),
        Signature::message("bad file descriptor", ErrorClass::PeerClosed),
        Signature::message("deadline exceeded", ErrorClass::Timeout),
        Signature::message("timed out", ErrorClass::Timeout),
    ]
}

/// Pure lookup from raw IO errors to [`ClassifiedError`].
#[derive(Debug, Clone)]
pub struct Classifier {
    signatures: Vec<Signature>,
}

impl Classifier {
    /// Create a classifier with the built-in signature table.
    pub fn new() -> Self {
        Self {
            signatures: default_signatures(),
        }
    }

    /// Create a classifier with no signatures; everything maps to `Other`.
    pub fn empty() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// Append a signature. Earlier entries take precedence.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Signatures in match order.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Classify an IO error.
    pub fn classify(&self, err: &io::Error) -> ClassifiedError {
        let message = err.to_string();
        self.lookup(err.kind(), &message)
            .unwrap_or(ClassifiedError::Other(message))
    }

    /// Classify a bare error message (no OS error kind available).
    pub fn classify_message(&self, message: &str) -> ClassifiedError {
        self.lookup(io::ErrorKind::Other, message)
            .unwrap_or_else(|| ClassifiedError::Other(message.to_string()))
    }

    fn lookup(&self, kind: io::ErrorKind, message: &str) -> Option<ClassifiedError> {
        let lowered = message.to_lowercase();
        self.signatures
            .iter()
            .find(|sig| sig.matches(kind, &lowered))
            .map(|sig| match sig.class {
                ErrorClass::PeerClosed => ClassifiedError::PeerClosed,
                ErrorClass::Timeout => ClassifiedError::Timeout,
            })
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}
