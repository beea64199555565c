#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod application;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod schedule;
pub mod session;
pub mod state;
pub mod storage;

pub use application::{Application, NullApplication};
pub use config::{ConnectionType, SessionConfig, SessionConfigBuilder, TimestampPrecision};
pub use dictionary::{Dictionary, GroupSpec, StandardDictionary};
pub use error::{
    DecodeError, DoNotSend, FixError, RejectError, RejectReason, Result, StoreError,
};
pub use message::{FieldMap, Message};
pub use registry::Registry;
pub use router::MessageRouter;
pub use schedule::SessionSchedule;
pub use session::{Session, SessionHandle, SessionId};
pub use state::{AdminEvent, PendingInner, SessionEvent, SessionState, Timeout};
pub use storage::{FileMessageStore, MemoryMessageStore, MessageStore};
