use thiserror::Error;

/// Session-level reject reasons carried in tag 373 of a Reject (35=3).
///
/// The discriminants are the wire values defined by FIX 4.2 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidTagNumber = 0,
    RequiredTagMissing = 1,
    TagNotDefinedForMessageType = 2,
    UndefinedTag = 3,
    TagSpecifiedWithoutValue = 4,
    IncorrectDataFormat = 6,
    DecryptionProblem = 7,
    SignatureProblem = 8,
    CompIdProblem = 9,
    SendingTimeAccuracyProblem = 10,
    InvalidMsgType = 11,
    Other = 99,
}

impl RejectReason {
    pub fn wire_value(self) -> u32 {
        self as u32
    }
}

/// A problem with an otherwise well-framed message.
///
/// Produced by field accessors, session checks, and application callbacks.
/// The session turns these into Reject (35=3) or, when `business` is set
/// and the dialect supports it, BusinessMessageReject (35=j) — the session
/// stays logged on either way.
#[derive(Debug, Clone, Error)]
#[error("message rejected: {reason:?}")]
pub struct RejectError {
    pub reason: RejectReason,
    /// Tag that caused the problem, for tag 371.
    pub ref_tag_id: Option<u32>,
    pub text: Option<String>,
    /// Route through BusinessMessageReject on dialects that have it.
    pub business: bool,
}

impl RejectError {
    pub fn new(reason: RejectReason) -> Self {
        Self { reason, ref_tag_id: None, text: None, business: false }
    }

    pub fn with_tag(reason: RejectReason, tag: u32) -> Self {
        Self { ref_tag_id: Some(tag), ..Self::new(reason) }
    }

    pub fn with_text(reason: RejectReason, text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Self::new(reason) }
    }

    pub fn required_tag_missing(tag: u32) -> Self {
        Self::with_tag(RejectReason::RequiredTagMissing, tag)
    }

    pub fn incorrect_data_format(tag: u32) -> Self {
        Self::with_tag(RejectReason::IncorrectDataFormat, tag)
    }

    pub fn comp_id_problem() -> Self {
        Self::new(RejectReason::CompIdProblem)
    }

    pub fn sending_time_accuracy() -> Self {
        Self::new(RejectReason::SendingTimeAccuracyProblem)
    }

    pub fn invalid_msg_type() -> Self {
        Self::new(RejectReason::InvalidMsgType)
    }

    /// No handler is registered for the message type. Becomes a
    /// BusinessMessageReject on FIX 4.2+.
    pub fn unsupported_message_type() -> Self {
        Self { business: true, ..Self::new(RejectReason::InvalidMsgType) }
    }
}

/// Failure to turn wire bytes into a [`Message`](crate::Message) or back.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Malformed framing: missing SOH, non-numeric tag, 8/9/35 out of
    /// position. The peer bytes cannot be trusted; no Reject is emitted.
    #[error("malformed message: {0}")]
    Parse(String),

    /// Well-framed but inconsistent: BodyLength or CheckSum mismatch,
    /// repeating-group count disagreement.
    #[error("invalid message: {0}")]
    Invalid(String),

    /// A tag the dictionary requires in the header or trailer is absent.
    #[error("required tag {0} missing")]
    MissingRequiredTag(u32),
}

/// Message store failure. Fatal to the owning session when it happens
/// while persisting an outbound message.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store record error: {0}")]
    Record(#[from] serde_json::Error),

    #[error("message store closed")]
    Closed,
}

/// Returned by [`Application::to_app`](crate::Application::to_app) to veto
/// an outbound application message. The send is dropped without consuming
/// a sequence number.
#[derive(Debug, Clone, Copy, Error)]
#[error("do not send")]
pub struct DoNotSend;

#[derive(Debug, Error)]
pub enum FixError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("duplicate session id: {0}")]
    DuplicateSessionId(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reject(#[from] RejectError),

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, FixError>;
