//! Dispatch of decoded application messages to per-type handlers.

use std::collections::HashMap;

use crate::error::RejectError;
use crate::message::Message;
use crate::protocol::tags;
use crate::session::SessionId;

type Handler = Box<dyn Fn(&Message, &SessionId) -> Result<(), RejectError> + Send + Sync>;

/// Maps `(BeginString, MsgType)` to a handler.
///
/// Typically owned by an [`Application`](crate::Application) and invoked
/// from its `from_app` hook; an unrouted message type yields an error the
/// session turns into a BusinessMessageReject or Reject depending on the
/// dialect.
#[derive(Default)]
pub struct MessageRouter {
    routes: HashMap<(String, String), Handler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route<F>(&mut self, begin_string: &str, msg_type: &str, handler: F)
    where
        F: Fn(&Message, &SessionId) -> Result<(), RejectError> + Send + Sync + 'static,
    {
        self.routes.insert(
            (begin_string.to_string(), msg_type.to_string()),
            Box::new(handler),
        );
    }

    pub fn route(&self, msg: &Message, session_id: &SessionId) -> Result<(), RejectError> {
        let begin_string = msg.header.get_string(tags::BEGIN_STRING)?;
        let msg_type = msg.header.get_string(tags::MSG_TYPE)?;
        match self.routes.get(&(begin_string, msg_type)) {
            Some(handler) => handler(msg, session_id),
            None => Err(RejectError::unsupported_message_type()),
        }
    }
}
