//! The per-session actor: one logical task owns all session state and
//! consumes inbound frames, send requests, admin commands, and clock
//! ticks from a single ordered channel.

use std::collections::{BTreeMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::application::Application;
use crate::config::SessionConfig;
use crate::dictionary::Dictionary;
use crate::error::{DecodeError, FixError, RejectError, RejectReason, StoreError};
use crate::message::Message;
use crate::protocol::{self, msg_type, tags};
use crate::state::{AdminEvent, PendingInner, SessionEvent, SessionState, Timeout};
use crate::storage::MessageStore;

/// Identity of one session: `(BeginString, SenderCompID, TargetCompID)`
/// plus an optional qualifier to distinguish parallel sessions between the
/// same parties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub begin_string: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub qualifier: Option<String>,
}

impl SessionId {
    pub fn new(
        begin_string: impl Into<String>,
        sender_comp_id: impl Into<String>,
        target_comp_id: impl Into<String>,
    ) -> Self {
        Self {
            begin_string: begin_string.into(),
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
            qualifier: None,
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Filesystem-safe name for store backends.
    pub fn file_stem(&self) -> String {
        let mut stem = format!(
            "{}__{}__{}",
            sanitize(&self.begin_string),
            sanitize(&self.sender_comp_id),
            sanitize(&self.target_comp_id)
        );
        if let Some(q) = &self.qualifier {
            stem.push_str("__");
            stem.push_str(&sanitize(q));
        }
        stem
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.begin_string, self.sender_comp_id, self.target_comp_id
        )?;
        if let Some(q) = &self.qualifier {
            write!(f, ":{q}")?;
        }
        Ok(())
    }
}

/// Cheap handle for feeding events to a running session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Queue an application message for sending.
    pub fn send(&self, msg: Message) -> crate::Result<()> {
        self.event(SessionEvent::Send(msg))
    }

    /// Feed one complete inbound frame from the transport.
    pub fn inbound(&self, frame: Bytes) -> crate::Result<()> {
        self.event(SessionEvent::Inbound(frame))
    }

    /// Attach a transport. Outbound frames will be pushed to `out`;
    /// `initiate_logon` selects the initiator role for this connection.
    pub fn connect(&self, initiate_logon: bool, out: mpsc::Sender<Bytes>) -> crate::Result<()> {
        self.event(SessionEvent::Admin(AdminEvent::Connect { initiate_logon, out }))
    }

    /// Ask the session to drop to a fresh sequence-number epoch.
    pub fn reset(&self) -> crate::Result<()> {
        self.event(SessionEvent::Admin(AdminEvent::ResetStore))
    }

    /// Shut the session actor down.
    pub fn stop(&self) -> crate::Result<()> {
        self.event(SessionEvent::Admin(AdminEvent::Stop))
    }

    fn event(&self, event: SessionEvent) -> crate::Result<()> {
        self.events.send(event).map_err(|_| FixError::ChannelClosed)
    }
}

/// Failure while pushing a message toward the wire.
enum SendFailure {
    Store(StoreError),
    /// Outbound channel full or gone. Overflow disconnects rather than
    /// blocking the actor.
    Transport,
}

/// One FIX session and all of its state.
///
/// Owned by exactly one task; nothing here is shared. The registry holds
/// only a [`SessionHandle`].
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    state: SessionState,
    store: Box<dyn MessageStore>,
    app: Arc<dyn Application>,
    dictionary: Arc<dyn Dictionary>,
    out: Option<mpsc::Sender<Bytes>>,
    /// Sends requested while not logged on, in arrival order, unstamped.
    pending: VecDeque<Message>,
    /// Inbound messages ahead of the expected target sequence number.
    stash: BTreeMap<u32, Message>,
    initiate_logon: bool,
    /// Effective heartbeat interval; acceptors adopt the peer's.
    heart_bt_int: Duration,
    last_sent_at: DateTime<Utc>,
    last_received_at: DateTime<Utc>,
    state_entered_at: DateTime<Utc>,
    /// Highest sequence number requested in the outstanding resend.
    resend_range_end: Option<u32>,
    /// Our own logon carried ResetSeqNumFlag; the peer echoing it back
    /// must not trigger a second reset.
    sent_reset: bool,
    last_inbound_seq: u32,
    test_request_counter: u64,
}

impl Session {
    /// Build a session from its configuration and collaborators. Invokes
    /// the application's `on_create` hook exactly once.
    pub async fn new(
        config: SessionConfig,
        store: Box<dyn MessageStore>,
        app: Arc<dyn Application>,
        dictionary: Arc<dyn Dictionary>,
    ) -> Self {
        let mut id = SessionId::new(
            &config.begin_string,
            &config.sender_comp_id,
            &config.target_comp_id,
        );
        if let Some(q) = &config.session_qualifier {
            id = id.with_qualifier(q);
        }

        let now = Utc::now();
        let heart_bt_int = config.heart_bt_int;
        let session = Self {
            id,
            config,
            state: SessionState::Latent,
            store,
            app,
            dictionary,
            out: None,
            pending: VecDeque::new(),
            stash: BTreeMap::new(),
            initiate_logon: false,
            heart_bt_int,
            last_sent_at: now,
            last_received_at: now,
            state_entered_at: now,
            resend_range_end: None,
            sent_reset: false,
            last_inbound_seq: 0,
            test_request_counter: 0,
        };
        session.app.on_create(&session.id).await;
        session
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn MessageStore {
        self.store.as_mut()
    }

    /// Create the input channel for this session. Call once; hand the
    /// receiver to [`Session::run`] and the handle to the registry.
    pub fn handle(&self) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle { id: self.id.clone(), events: tx }, rx)
    }

    /// Actor loop: consume events in arrival order, interleaved with a
    /// one-second clock tick, until stopped.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let flow = tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.process(event).await,
                    None => ControlFlow::Break(()),
                },
                _ = ticker.tick() => self.process(SessionEvent::Tick(Utc::now())).await,
            };
            if flow.is_break() {
                break;
            }
        }
        if let Err(err) = self.store.close().await {
            warn!(session = %self.id, %err, "closing message store failed");
        }
    }

    /// Process one input atomically. `Break` means the session stopped.
    pub async fn process(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Inbound(frame) => {
                self.on_inbound(frame, Utc::now()).await;
                ControlFlow::Continue(())
            }
            SessionEvent::Send(msg) => {
                self.on_send_request(msg, Utc::now()).await;
                ControlFlow::Continue(())
            }
            SessionEvent::Admin(admin) => self.on_admin(admin, Utc::now()).await,
            SessionEvent::Tick(now) => {
                self.on_tick(now).await;
                ControlFlow::Continue(())
            }
            SessionEvent::Timeout(timeout) => {
                self.on_timeout(timeout, Utc::now()).await;
                ControlFlow::Continue(())
            }
        }
    }

    // ------------------------------------------------------------------
    // admin events

    async fn on_admin(&mut self, event: AdminEvent, now: DateTime<Utc>) -> ControlFlow<()> {
        match event {
            AdminEvent::Connect { initiate_logon, out } => {
                self.on_connect(initiate_logon, out, now).await;
                ControlFlow::Continue(())
            }
            AdminEvent::ResetStore => {
                info!(session = %self.id, "session reset requested");
                if self.state.is_logged_on() {
                    self.send_logout_now("session reset", now).await;
                }
                self.disconnect(now).await;
                if let Err(err) = self.store.reset().await {
                    error!(session = %self.id, %err, "store reset failed");
                }
                ControlFlow::Continue(())
            }
            AdminEvent::Stop => {
                info!(session = %self.id, "stop requested");
                if self.state.is_logged_on() {
                    self.send_logout_now("session stopping", now).await;
                }
                self.disconnect(now).await;
                self.set_state(SessionState::Latent, now);
                ControlFlow::Break(())
            }
        }
    }

    async fn on_connect(
        &mut self,
        initiate_logon: bool,
        out: mpsc::Sender<Bytes>,
        now: DateTime<Utc>,
    ) {
        if !self.state.is_session_time() {
            debug!(session = %self.id, "connect refused outside session window");
            return;
        }
        if self.state.is_connected() {
            warn!(session = %self.id, "connect refused, already connected");
            return;
        }

        self.out = Some(out);
        self.initiate_logon = initiate_logon;
        self.heart_bt_int = self.config.heart_bt_int;
        self.last_sent_at = now;
        self.last_received_at = now;
        self.set_state(SessionState::Logon, now);

        if !initiate_logon {
            debug!(session = %self.id, "connected, awaiting peer logon");
            return;
        }

        if self.config.refresh_on_logon {
            if let Err(err) = self.store.refresh().await {
                self.store_failure(err, now).await;
                return;
            }
        }

        let reset = self.config.reset_on_logon;
        self.sent_reset = reset;
        let logon = self.build_logon(reset);
        info!(session = %self.id, "initiating logon");
        let result = if reset {
            self.drop_queued_and_send(logon, true, now).await
        } else {
            self.send_now(logon, now).await
        };
        if let Err(failure) = result {
            self.handle_send_failure(failure, now).await;
        }
    }

    fn build_logon(&self, reset: bool) -> Message {
        let mut logon = Message::new(msg_type::LOGON);
        logon.body.set_int(tags::ENCRYPT_METHOD, 0);
        logon.body.set_int(tags::HEART_BT_INT, self.heart_bt_int.as_secs());
        if reset {
            logon.body.set_bool(tags::RESET_SEQ_NUM_FLAG, true);
        }
        if self.config.begin_string == "FIXT.1.1" {
            if let Some(ver) = &self.config.default_appl_ver_id {
                logon.body.set_string(tags::DEFAULT_APPL_VER_ID, ver);
            }
        }
        logon
    }

    /// Clear the pending queue, optionally reset the store, then send an
    /// administrative message. Used for logons that begin a new sequence
    /// epoch.
    async fn drop_queued_and_send(
        &mut self,
        msg: Message,
        reset_store: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SendFailure> {
        self.pending.clear();
        if reset_store {
            self.store.reset().await.map_err(SendFailure::Store)?;
        }
        self.send_now(msg, now).await
    }

    // ------------------------------------------------------------------
    // outbound path

    async fn on_send_request(&mut self, msg: Message, now: DateTime<Utc>) {
        if !self.state.is_logged_on() {
            debug!(session = %self.id, "not logged on, queueing outbound message");
            self.pending.push_back(msg);
            return;
        }
        if let Err(failure) = self.send_now(msg, now).await {
            self.handle_send_failure(failure, now).await;
        }
    }

    /// Stamp, run callbacks, persist, and emit one message. The sequence
    /// number is consumed only if the message actually goes out.
    async fn send_now(&mut self, mut msg: Message, now: DateTime<Utc>) -> Result<(), SendFailure> {
        let seq = self.store.next_sender_msg_seq_num();
        self.fill_header(&mut msg, seq, now);

        if msg.is_admin() {
            self.app.to_admin(&mut msg, &self.id).await;
        } else if self.app.to_app(&mut msg, &self.id).await.is_err() {
            debug!(session = %self.id, "outbound message vetoed by to_app");
            return Ok(());
        }

        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes.freeze(),
            Err(err) => {
                warn!(session = %self.id, %err, "dropping unencodable outbound message");
                return Ok(());
            }
        };

        if self.config.persist_messages {
            self.store
                .save_message(seq, &bytes)
                .await
                .map_err(SendFailure::Store)?;
        }
        self.store
            .incr_next_sender_msg_seq_num()
            .await
            .map_err(SendFailure::Store)?;
        self.emit(bytes, now)
    }

    fn fill_header(&self, msg: &mut Message, seq: u32, now: DateTime<Utc>) {
        msg.header.set_string(tags::BEGIN_STRING, &self.config.begin_string);
        msg.header.set_string(tags::SENDER_COMP_ID, &self.config.sender_comp_id);
        msg.header.set_string(tags::TARGET_COMP_ID, &self.config.target_comp_id);
        msg.header.set_int(tags::MSG_SEQ_NUM, seq as u64);
        msg.header
            .set_string(tags::SENDING_TIME, &self.config.timestamp_precision.render(now));
        if self.config.enable_last_msg_seq_num_processed {
            msg.header
                .set_int(tags::LAST_MSG_SEQ_NUM_PROCESSED, self.last_inbound_seq as u64);
        }
    }

    /// Hand bytes to the transport without blocking; a full or closed
    /// channel is fatal.
    fn emit(&mut self, bytes: Bytes, now: DateTime<Utc>) -> Result<(), SendFailure> {
        let out = self.out.as_ref().ok_or(SendFailure::Transport)?;
        out.try_send(bytes).map_err(|_| SendFailure::Transport)?;
        self.last_sent_at = now;
        Ok(())
    }

    async fn drain_pending(&mut self, now: DateTime<Utc>) {
        while self.state.is_logged_on() {
            let Some(msg) = self.pending.pop_front() else { break };
            if let Err(failure) = self.send_now(msg, now).await {
                self.handle_send_failure(failure, now).await;
                return;
            }
        }
    }

    async fn handle_send_failure(&mut self, failure: SendFailure, now: DateTime<Utc>) {
        match failure {
            SendFailure::Store(err) => self.store_failure(err, now).await,
            SendFailure::Transport => {
                error!(session = %self.id, "outbound channel full or closed, disconnecting");
                self.disconnect(now).await;
            }
        }
    }

    async fn store_failure(&mut self, err: StoreError, now: DateTime<Utc>) {
        error!(session = %self.id, %err, "message store failure, disconnecting");
        self.disconnect(now).await;
    }

    // ------------------------------------------------------------------
    // inbound path

    async fn on_inbound(&mut self, frame: Bytes, now: DateTime<Utc>) {
        self.last_received_at = now;

        let msg = match protocol::decode(&frame, self.dictionary.as_ref()) {
            Ok(msg) => msg,
            Err(DecodeError::MissingRequiredTag(tag)) => {
                warn!(session = %self.id, tag, "inbound message missing required tag");
                if self.state.is_logged_on() {
                    let reject = RejectError::required_tag_missing(tag);
                    self.send_reject(None, reject, now).await;
                }
                return;
            }
            Err(err) => {
                // garbled bytes: nothing to reject against
                warn!(session = %self.id, %err, "garbled inbound message, disconnecting");
                self.disconnect(now).await;
                return;
            }
        };

        // any well-formed inbound clears an outstanding test request
        if let SessionState::PendingTimeout(inner) = self.state {
            let restored = match inner {
                PendingInner::InSession => SessionState::InSession,
                PendingInner::Resend => SessionState::Resend,
            };
            self.set_state(restored, now);
        }

        match self.state {
            SessionState::Latent | SessionState::NotSessionTime => {
                warn!(session = %self.id, "inbound message without connection, dropping");
            }
            SessionState::Logon => self.handle_logon_state(msg, now).await,
            SessionState::Logout => self.handle_logout_state(msg, now).await,
            SessionState::InSession
            | SessionState::Resend
            | SessionState::PendingTimeout(_) => self.handle_in_session(msg, now).await,
        }
    }

    async fn handle_logon_state(&mut self, msg: Message, now: DateTime<Utc>) {
        match msg.header.get_raw(tags::MSG_TYPE) {
            Some(b"A") => self.process_logon(msg, now).await,
            other => {
                warn!(
                    session = %self.id,
                    msg_type = %String::from_utf8_lossy(other.unwrap_or_default()),
                    "expected Logon, disconnecting"
                );
                self.disconnect(now).await;
            }
        }
    }

    async fn process_logon(&mut self, msg: Message, now: DateTime<Utc>) {
        if self.check_comp_ids(&msg).is_err() {
            warn!(session = %self.id, "CompID mismatch on Logon, disconnecting");
            self.disconnect(now).await;
            return;
        }
        if self.check_begin_string(&msg).is_err() {
            warn!(session = %self.id, "BeginString mismatch on Logon, disconnecting");
            self.disconnect(now).await;
            return;
        }

        let accepting = !self.initiate_logon;
        if accepting && self.config.refresh_on_logon {
            if let Err(err) = self.store.refresh().await {
                self.store_failure(err, now).await;
                return;
            }
        }

        let peer_requested_reset = msg
            .body
            .get_bool(tags::RESET_SEQ_NUM_FLAG)
            .unwrap_or(false);
        if (peer_requested_reset && !self.sent_reset)
            || (accepting && self.config.reset_on_logon)
        {
            if peer_requested_reset {
                info!(session = %self.id, "peer requested sequence reset on logon");
            }
            if let Err(err) = self.store.reset().await {
                self.store_failure(err, now).await;
                return;
            }
        }
        self.sent_reset = false;

        let seq = match msg.header.get_seq_num(tags::MSG_SEQ_NUM) {
            Ok(seq) => seq,
            Err(_) => {
                warn!(session = %self.id, "Logon without MsgSeqNum, disconnecting");
                self.disconnect(now).await;
                return;
            }
        };
        let expected = self.store.next_target_msg_seq_num();
        if seq < expected {
            warn!(
                session = %self.id,
                received = seq, expected,
                "Logon sequence number too low, disconnecting"
            );
            self.disconnect(now).await;
            return;
        }

        if accepting {
            if let Ok(peer_interval) = msg.body.get_int(tags::HEART_BT_INT) {
                self.heart_bt_int = Duration::from_secs(peer_interval);
            }
            let reply = self.build_logon(peer_requested_reset);
            if let Err(failure) = self.send_now(reply, now).await {
                self.handle_send_failure(failure, now).await;
                return;
            }
        }

        info!(session = %self.id, accepting, "logon successful");
        self.set_state(SessionState::InSession, now);
        self.app.on_logon(&self.id).await;

        if let Err(reject) = self.app.from_admin(&msg, &self.id).await {
            self.send_reject(Some(&msg), reject, now).await;
        }

        if seq == expected {
            if !self.incr_target(seq, now).await {
                return;
            }
        } else {
            self.request_resend(expected, seq, now).await;
        }

        self.drain_pending(now).await;
    }

    async fn handle_logout_state(&mut self, msg: Message, now: DateTime<Utc>) {
        if msg.header.get_raw(tags::MSG_TYPE) == Some(&b"5"[..]) {
            info!(session = %self.id, "logout acknowledged by peer");
            if let Ok(seq) = msg.header.get_seq_num(tags::MSG_SEQ_NUM) {
                if seq == self.store.next_target_msg_seq_num() {
                    let _ = self.incr_target(seq, now).await;
                }
            }
            if self.config.reset_on_logout {
                if let Err(err) = self.store.reset().await {
                    error!(session = %self.id, %err, "store reset failed");
                }
            }
            self.disconnect(now).await;
        } else {
            debug!(session = %self.id, "ignoring message while awaiting logout ack");
        }
    }

    async fn handle_in_session(&mut self, msg: Message, now: DateTime<Utc>) {
        if self.check_begin_string(&msg).is_err() {
            warn!(session = %self.id, "incorrect BeginString, logging out");
            self.initiate_logout("incorrect BeginString", now).await;
            return;
        }
        if let Err(reject) = self.check_comp_ids(&msg) {
            self.send_reject(Some(&msg), reject, now).await;
            let seq = msg.header.get_seq_num(tags::MSG_SEQ_NUM).unwrap_or(0);
            let _ = self.incr_target(seq, now).await;
            return;
        }
        if let Err(reject) = self.check_sending_time(&msg, now) {
            // FIX requires a Reject followed by Logout for inaccurate
            // sending times
            self.send_reject(Some(&msg), reject, now).await;
            self.initiate_logout("SendingTime accuracy problem", now).await;
            return;
        }

        let mt = msg.header.get_raw(tags::MSG_TYPE).unwrap_or_default().to_vec();

        // SequenceReset in reset mode is applied regardless of its own
        // sequence number
        if mt == b"4" && !msg.body.get_bool(tags::GAP_FILL_FLAG).unwrap_or(false) {
            self.handle_hard_sequence_reset(msg, now).await;
            return;
        }
        if mt == b"A" {
            self.handle_in_session_logon(msg, now).await;
            return;
        }

        let seq = match msg.header.get_seq_num(tags::MSG_SEQ_NUM) {
            Ok(seq) => seq,
            Err(reject) => {
                self.send_reject(Some(&msg), reject, now).await;
                return;
            }
        };
        let expected = self.store.next_target_msg_seq_num();
        if seq > expected {
            self.handle_target_too_high(msg, seq, expected, now).await;
            return;
        }
        if seq < expected {
            self.handle_target_too_low(msg, seq, expected, now).await;
            return;
        }

        if !self.deliver(msg, now).await {
            return;
        }
        self.drain_stash(now).await;
    }

    /// Deliver a message whose sequence number matched. Returns false when
    /// the session disconnected along the way.
    async fn deliver(&mut self, msg: Message, now: DateTime<Utc>) -> bool {
        let seq = msg.header.get_seq_num(tags::MSG_SEQ_NUM).unwrap_or(0);
        let poss_dup = msg.header.get_bool(tags::POSS_DUP_FLAG).unwrap_or(false);
        let mt = msg.header.get_raw(tags::MSG_TYPE).unwrap_or_default().to_vec();

        // while recovering, retransmitted admin messages are not
        // re-processed, only counted
        if self.state == SessionState::Resend && poss_dup && msg.is_admin() && mt != b"4" {
            return self.incr_target(seq, now).await;
        }

        match mt.as_slice() {
            b"1" => {
                // TestRequest: echo the id on a Heartbeat
                if let Err(reject) = self.app.from_admin(&msg, &self.id).await {
                    self.send_reject(Some(&msg), reject, now).await;
                    return self.incr_target(seq, now).await;
                }
                if !self.incr_target(seq, now).await {
                    return false;
                }
                let mut heartbeat = Message::new(msg_type::HEARTBEAT);
                if let Some(id) = msg.body.get_raw(tags::TEST_REQ_ID) {
                    heartbeat.body.set_field(tags::TEST_REQ_ID, id.to_vec());
                }
                if let Err(failure) = self.send_now(heartbeat, now).await {
                    self.handle_send_failure(failure, now).await;
                    return false;
                }
                true
            }
            b"0" | b"3" => {
                if mt == b"3" {
                    warn!(
                        session = %self.id,
                        text = %msg.body.get_string(tags::TEXT).unwrap_or_default(),
                        "peer rejected one of our messages"
                    );
                }
                if let Err(reject) = self.app.from_admin(&msg, &self.id).await {
                    self.send_reject(Some(&msg), reject, now).await;
                }
                self.incr_target(seq, now).await
            }
            b"2" => {
                if let Err(reject) = self.app.from_admin(&msg, &self.id).await {
                    self.send_reject(Some(&msg), reject, now).await;
                    return self.incr_target(seq, now).await;
                }
                if !self.incr_target(seq, now).await {
                    return false;
                }
                self.handle_resend_request(&msg, now).await
            }
            b"4" => {
                // gap fill: advance the expectation without touching the
                // application
                let new_seq = match msg.body.get_seq_num(tags::NEW_SEQ_NO) {
                    Ok(new_seq) => new_seq,
                    Err(reject) => {
                        self.send_reject(Some(&msg), reject, now).await;
                        return true;
                    }
                };
                if new_seq <= seq {
                    let reject = RejectError::with_text(
                        RejectReason::Other,
                        format!("NewSeqNo {new_seq} must exceed current {seq}"),
                    );
                    self.send_reject(Some(&msg), reject, now).await;
                    return true;
                }
                debug!(session = %self.id, new_seq, "gap fill received");
                if let Err(err) = self.store.set_next_target_msg_seq_num(new_seq).await {
                    self.store_failure(err, now).await;
                    return false;
                }
                self.last_inbound_seq = seq;
                true
            }
            b"5" => {
                info!(session = %self.id, "logout received");
                if let Err(reject) = self.app.from_admin(&msg, &self.id).await {
                    self.send_reject(Some(&msg), reject, now).await;
                }
                if !self.incr_target(seq, now).await {
                    return false;
                }
                self.send_logout_now("responding to logout", now).await;
                if self.config.reset_on_logout {
                    if let Err(err) = self.store.reset().await {
                        error!(session = %self.id, %err, "store reset failed");
                    }
                }
                self.disconnect(now).await;
                false
            }
            _ => {
                // application message
                match self.app.from_app(&msg, &self.id).await {
                    Ok(()) => self.incr_target(seq, now).await,
                    Err(reject) => {
                        self.send_reject(Some(&msg), reject, now).await;
                        self.incr_target(seq, now).await
                    }
                }
            }
        }
    }

    /// Replay stashed messages that have become deliverable; close out the
    /// resend state once the requested range is covered.
    async fn drain_stash(&mut self, now: DateTime<Utc>) {
        while self.state.is_logged_on() {
            let expected = self.store.next_target_msg_seq_num();
            let Some(msg) = self.stash.remove(&expected) else { break };
            debug!(session = %self.id, seq = expected, "replaying buffered message");
            if !self.deliver(msg, now).await {
                return;
            }
        }

        if let Some(end) = self.resend_range_end {
            if self.store.next_target_msg_seq_num() > end {
                self.resend_range_end = None;
                if self.state == SessionState::Resend {
                    debug!(session = %self.id, "resend range complete");
                    self.set_state(SessionState::InSession, now);
                }
            }
        }
    }

    async fn handle_target_too_high(
        &mut self,
        msg: Message,
        seq: u32,
        expected: u32,
        now: DateTime<Utc>,
    ) {
        debug!(
            session = %self.id,
            received = seq, expected,
            "MsgSeqNum too high, buffering and requesting resend"
        );
        self.stash.insert(seq, msg);
        match self.state {
            SessionState::Resend => {
                if let Some(end) = &mut self.resend_range_end {
                    if seq > *end {
                        *end = seq;
                    }
                }
            }
            _ => self.request_resend(expected, seq, now).await,
        }
    }

    async fn request_resend(&mut self, expected: u32, received: u32, now: DateTime<Utc>) {
        let mut request = Message::new(msg_type::RESEND_REQUEST);
        request.body.set_int(tags::BEGIN_SEQ_NO, expected as u64);
        request
            .body
            .set_int(tags::END_SEQ_NO, infinity_end_seq_no(&self.config.begin_string) as u64);
        if let Err(failure) = self.send_now(request, now).await {
            self.handle_send_failure(failure, now).await;
            return;
        }
        self.resend_range_end = Some(received);
        self.set_state(SessionState::Resend, now);
    }

    async fn handle_target_too_low(
        &mut self,
        msg: Message,
        seq: u32,
        expected: u32,
        now: DateTime<Utc>,
    ) {
        let poss_dup = msg.header.get_bool(tags::POSS_DUP_FLAG).unwrap_or(false);
        if !poss_dup {
            error!(
                session = %self.id,
                received = seq, expected,
                "MsgSeqNum too low without PossDupFlag, disconnecting"
            );
            self.disconnect(now).await;
            return;
        }
        debug!(session = %self.id, seq, "dropping possible duplicate");
    }

    /// A Logon arriving mid-session is only meaningful as a sequence-reset
    /// request.
    async fn handle_in_session_logon(&mut self, msg: Message, now: DateTime<Utc>) {
        if !msg.body.get_bool(tags::RESET_SEQ_NUM_FLAG).unwrap_or(false) {
            warn!(session = %self.id, "unexpected Logon while in session, logging out");
            self.initiate_logout("unexpected Logon", now).await;
            return;
        }
        info!(session = %self.id, "peer requested in-session sequence reset");
        if let Err(err) = self.store.reset().await {
            self.store_failure(err, now).await;
            return;
        }
        if let Err(reject) = self.app.from_admin(&msg, &self.id).await {
            self.send_reject(Some(&msg), reject, now).await;
        }
        // the reset logon is seq 1 by definition
        if let Err(err) = self.store.set_next_target_msg_seq_num(2).await {
            self.store_failure(err, now).await;
            return;
        }
        let reply = self.build_logon(true);
        if let Err(failure) = self.send_now(reply, now).await {
            self.handle_send_failure(failure, now).await;
        }
    }

    async fn handle_hard_sequence_reset(&mut self, msg: Message, now: DateTime<Utc>) {
        if let Err(reject) = self.app.from_admin(&msg, &self.id).await {
            self.send_reject(Some(&msg), reject, now).await;
        }
        let new_seq = match msg.body.get_seq_num(tags::NEW_SEQ_NO) {
            Ok(new_seq) => new_seq,
            Err(reject) => {
                self.send_reject(Some(&msg), reject, now).await;
                return;
            }
        };
        let expected = self.store.next_target_msg_seq_num();
        if new_seq < expected {
            let reject = RejectError::with_text(
                RejectReason::Other,
                format!("NewSeqNo {new_seq} below expected {expected}"),
            );
            self.send_reject(Some(&msg), reject, now).await;
            return;
        }
        info!(session = %self.id, new_seq, "sequence reset (reset mode)");
        if let Err(err) = self.store.set_next_target_msg_seq_num(new_seq).await {
            self.store_failure(err, now).await;
        }
    }

    /// Answer a peer's ResendRequest from the store: application messages
    /// are retransmitted with PossDupFlag, administrative messages and
    /// gaps collapse into SequenceReset-GapFill.
    async fn handle_resend_request(&mut self, msg: &Message, now: DateTime<Utc>) -> bool {
        let begin = match msg.body.get_seq_num(tags::BEGIN_SEQ_NO) {
            Ok(begin) => begin,
            Err(reject) => {
                self.send_reject(Some(msg), reject, now).await;
                return true;
            }
        };
        let end_raw = match msg.body.get_seq_num(tags::END_SEQ_NO) {
            Ok(end) => end,
            Err(reject) => {
                self.send_reject(Some(msg), reject, now).await;
                return true;
            }
        };

        let next_sender = self.store.next_sender_msg_seq_num();
        let last_sent = next_sender.saturating_sub(1);
        if begin == 0 || begin > last_sent {
            warn!(session = %self.id, begin, "resend request outside sent range, ignoring");
            return true;
        }
        // 0 means infinity; FIX 4.0/4.1 dialects say 999999 instead
        let end = if end_raw == 0 || end_raw > last_sent { last_sent } else { end_raw };

        info!(session = %self.id, begin, end, "resending message range");
        let stored = if self.config.persist_messages {
            match self.store.messages_in_range(begin, end).await {
                Ok(stored) => stored,
                Err(err) => {
                    self.store_failure(err, now).await;
                    return false;
                }
            }
        } else {
            Vec::new()
        };

        let mut cursor = begin;
        for (seq, raw) in stored {
            let original = match protocol::decode(&raw, self.dictionary.as_ref()) {
                Ok(original) => original,
                Err(err) => {
                    warn!(session = %self.id, seq, %err, "stored message unreadable, gap-filling");
                    continue;
                }
            };
            if original.is_admin() {
                continue;
            }
            if cursor < seq {
                if !self.send_gap_fill(cursor, seq, now).await {
                    return false;
                }
            }

            let mut dup = original.clone();
            if let Ok(orig_time) = dup.header.get_string(tags::SENDING_TIME) {
                dup.header.set_string(tags::ORIG_SENDING_TIME, &orig_time);
            }
            dup.header.set_bool(tags::POSS_DUP_FLAG, true);
            dup.header
                .set_string(tags::SENDING_TIME, &self.config.timestamp_precision.render(now));
            match dup.to_bytes() {
                Ok(bytes) => {
                    if let Err(failure) = self.emit(bytes.freeze(), now) {
                        self.handle_send_failure(failure, now).await;
                        return false;
                    }
                }
                Err(err) => {
                    warn!(session = %self.id, seq, %err, "stored message unencodable, skipping");
                }
            }
            cursor = seq + 1;
        }
        if cursor <= end {
            if !self.send_gap_fill(cursor, end + 1, now).await {
                return false;
            }
        }
        true
    }

    /// SequenceReset-GapFill covering `[msg_seq, new_seq)`. Emitted
    /// outside the normal send path: it reuses an already-consumed
    /// sequence number on purpose.
    async fn send_gap_fill(&mut self, msg_seq: u32, new_seq: u32, now: DateTime<Utc>) -> bool {
        let mut gap_fill = Message::new(msg_type::SEQUENCE_RESET);
        self.fill_header(&mut gap_fill, msg_seq, now);
        gap_fill.header.set_bool(tags::POSS_DUP_FLAG, true);
        gap_fill.body.set_bool(tags::GAP_FILL_FLAG, true);
        gap_fill.body.set_int(tags::NEW_SEQ_NO, new_seq as u64);
        match gap_fill.to_bytes() {
            Ok(bytes) => {
                if let Err(failure) = self.emit(bytes.freeze(), now) {
                    self.handle_send_failure(failure, now).await;
                    return false;
                }
                true
            }
            Err(err) => {
                warn!(session = %self.id, %err, "gap fill unencodable");
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // checks

    fn check_begin_string(&self, msg: &Message) -> Result<(), RejectError> {
        let begin = msg.header.get_string(tags::BEGIN_STRING)?;
        if begin != self.config.begin_string {
            return Err(RejectError::with_text(
                RejectReason::Other,
                format!("incorrect BeginString {begin}"),
            ));
        }
        Ok(())
    }

    /// The peer's SenderCompID must be our TargetCompID and vice versa.
    fn check_comp_ids(&self, msg: &Message) -> Result<(), RejectError> {
        let sender = msg.header.get_string(tags::SENDER_COMP_ID)?;
        let target = msg.header.get_string(tags::TARGET_COMP_ID)?;
        if sender != self.config.target_comp_id || target != self.config.sender_comp_id {
            return Err(RejectError::comp_id_problem());
        }
        Ok(())
    }

    fn check_sending_time(&self, msg: &Message, now: DateTime<Utc>) -> Result<(), RejectError> {
        let sending_time = msg.header.get_utc_timestamp(tags::SENDING_TIME)?;
        let skew = now.signed_duration_since(sending_time).num_seconds().abs();
        if skew > 120 {
            return Err(RejectError::sending_time_accuracy());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // rejects, logout, disconnect

    async fn send_reject(
        &mut self,
        inbound: Option<&Message>,
        reject: RejectError,
        now: DateTime<Utc>,
    ) {
        let extended = dialect_at_least_42(&self.config.begin_string);
        let mut out = if reject.business && extended {
            let mut m = Message::new(msg_type::BUSINESS_MESSAGE_REJECT);
            // BusinessRejectReason 3: unsupported message type
            m.body.set_int(tags::BUSINESS_REJECT_REASON, 3);
            m
        } else {
            let mut m = Message::new(msg_type::REJECT);
            if extended {
                m.body
                    .set_int(tags::SESSION_REJECT_REASON, reject.reason.wire_value() as u64);
                if let Some(tag) = reject.ref_tag_id {
                    m.body.set_int(tags::REF_TAG_ID, tag as u64);
                }
            }
            m
        };

        if let Some(inbound) = inbound {
            if let Ok(seq) = inbound.header.get_seq_num(tags::MSG_SEQ_NUM) {
                out.body.set_int(tags::REF_SEQ_NUM, seq as u64);
            }
            if extended {
                if let Ok(mt) = inbound.msg_type() {
                    out.body.set_string(tags::REF_MSG_TYPE, &mt);
                }
            }
        }
        let text = reject
            .text
            .clone()
            .unwrap_or_else(|| reason_text(reject.reason).to_string());
        out.body.set_string(tags::TEXT, &text);

        warn!(session = %self.id, reason = ?reject.reason, "rejecting inbound message");
        if let Err(failure) = self.send_now(out, now).await {
            self.handle_send_failure(failure, now).await;
        }
    }

    /// Send a Logout without entering the logout-ack wait.
    async fn send_logout_now(&mut self, text: &str, now: DateTime<Utc>) {
        let mut logout = Message::new(msg_type::LOGOUT);
        if !text.is_empty() {
            logout.body.set_string(tags::TEXT, text);
        }
        if let Err(failure) = self.send_now(logout, now).await {
            self.handle_send_failure(failure, now).await;
        }
    }

    /// Open a logout exchange and wait for the peer's acknowledgment.
    async fn initiate_logout(&mut self, text: &str, now: DateTime<Utc>) {
        let was_logged_on = self.state.is_logged_on();
        self.send_logout_now(text, now).await;
        if !self.state.is_connected() {
            // the logout send itself failed and disconnected us
            return;
        }
        self.set_state(SessionState::Logout, now);
        if was_logged_on {
            self.app.on_logout(&self.id).await;
        }
    }

    async fn disconnect(&mut self, now: DateTime<Utc>) {
        let was_logged_on = self.state.is_logged_on();
        let was_connected = self.state.is_connected() || self.out.is_some();
        self.out = None;
        self.stash.clear();
        self.resend_range_end = None;
        if self.state != SessionState::NotSessionTime {
            self.set_state(SessionState::Latent, now);
        }
        if was_logged_on {
            self.app.on_logout(&self.id).await;
        }
        if was_connected {
            info!(session = %self.id, "disconnected");
            if self.config.reset_on_disconnect {
                if let Err(err) = self.store.reset().await {
                    error!(session = %self.id, %err, "store reset failed");
                }
            }
        }
    }

    async fn incr_target(&mut self, seq: u32, now: DateTime<Utc>) -> bool {
        if let Err(err) = self.store.incr_next_target_msg_seq_num().await {
            self.store_failure(err, now).await;
            return false;
        }
        if seq != 0 {
            self.last_inbound_seq = seq;
        }
        true
    }

    fn set_state(&mut self, state: SessionState, now: DateTime<Utc>) {
        if self.state != state {
            debug!(session = %self.id, from = %self.state, to = %state, "state transition");
            self.state = state;
            self.state_entered_at = now;
        }
    }

    // ------------------------------------------------------------------
    // timers

    async fn on_tick(&mut self, now: DateTime<Utc>) {
        self.check_session_time(now).await;
        if !self.state.is_connected() {
            return;
        }

        match self.state {
            SessionState::Logon => {
                if elapsed(self.state_entered_at, now) > self.config.logon_timeout {
                    warn!(session = %self.id, "logon timed out, disconnecting");
                    self.disconnect(now).await;
                }
            }
            SessionState::Logout => {
                if elapsed(self.state_entered_at, now) > self.config.logout_timeout {
                    debug!(session = %self.id, "logout ack timed out, disconnecting");
                    self.disconnect(now).await;
                }
            }
            state if state.is_logged_on() => self.check_liveness(now).await,
            _ => {}
        }
    }

    async fn check_session_time(&mut self, now: DateTime<Utc>) {
        let in_range = self.config.schedule.is_in_range(now);
        if in_range {
            if self.state == SessionState::NotSessionTime {
                self.set_state(SessionState::Latent, now);
            }
            if !self
                .config
                .schedule
                .is_in_same_range(self.store.creation_time(), now)
            {
                info!(session = %self.id, "new session window, resetting store");
                if self.state.is_logged_on() {
                    self.send_logout_now("session window rolled over", now).await;
                }
                self.disconnect(now).await;
                if let Err(err) = self.store.reset().await {
                    error!(session = %self.id, %err, "store reset failed");
                }
            }
        } else if self.state != SessionState::NotSessionTime {
            info!(session = %self.id, "outside session window");
            if self.state.is_logged_on() {
                self.send_logout_now("session window closed", now).await;
            }
            self.disconnect(now).await;
            self.set_state(SessionState::NotSessionTime, now);
        }
    }

    /// Outbound heartbeats and the inbound-silence TestRequest ladder.
    async fn check_liveness(&mut self, now: DateTime<Utc>) {
        if elapsed(self.last_sent_at, now) >= self.heart_bt_int {
            let heartbeat = Message::new(msg_type::HEARTBEAT);
            if let Err(failure) = self.send_now(heartbeat, now).await {
                self.handle_send_failure(failure, now).await;
                return;
            }
        }

        let silence = elapsed(self.last_received_at, now);
        match self.state {
            SessionState::PendingTimeout(_) => {
                if silence >= self.heart_bt_int.mul_f64(2.4) {
                    warn!(session = %self.id, "peer unresponsive to TestRequest, disconnecting");
                    self.disconnect(now).await;
                }
            }
            state if state.is_logged_on() => {
                if silence >= self.heart_bt_int.mul_f64(1.2) {
                    self.test_request_counter += 1;
                    let mut request = Message::new(msg_type::TEST_REQUEST);
                    request
                        .body
                        .set_string(tags::TEST_REQ_ID, &format!("TEST-{}", self.test_request_counter));
                    debug!(session = %self.id, "peer quiet, sending TestRequest");
                    let inner = match self.state {
                        SessionState::Resend => PendingInner::Resend,
                        _ => PendingInner::InSession,
                    };
                    if let Err(failure) = self.send_now(request, now).await {
                        self.handle_send_failure(failure, now).await;
                        return;
                    }
                    self.set_state(SessionState::PendingTimeout(inner), now);
                }
            }
            _ => {}
        }
    }

    async fn on_timeout(&mut self, timeout: Timeout, now: DateTime<Utc>) {
        match timeout {
            Timeout::Heartbeat => {
                if self.state.is_logged_on() {
                    self.check_liveness(now).await;
                }
            }
            Timeout::Logon => {
                if self.state == SessionState::Logon {
                    warn!(session = %self.id, "logon timed out, disconnecting");
                    self.disconnect(now).await;
                }
            }
            Timeout::Logout => {
                if self.state == SessionState::Logout {
                    self.disconnect(now).await;
                }
            }
            Timeout::TestRequest => {
                if matches!(self.state, SessionState::PendingTimeout(_)) {
                    warn!(session = %self.id, "test request timed out, disconnecting");
                    self.disconnect(now).await;
                }
            }
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since).to_std().unwrap_or(Duration::ZERO)
}

/// EndSeqNo meaning "everything from BeginSeqNo on". FIX 4.2 introduced 0;
/// older dialects used 999999.
fn infinity_end_seq_no(begin_string: &str) -> u32 {
    if dialect_at_least_42(begin_string) {
        0
    } else {
        999_999
    }
}

fn dialect_at_least_42(begin_string: &str) -> bool {
    begin_string == "FIXT.1.1" || begin_string >= "FIX.4.2"
}

fn reason_text(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::InvalidTagNumber => "Invalid tag number",
        RejectReason::RequiredTagMissing => "Required tag missing",
        RejectReason::TagNotDefinedForMessageType => "Tag not defined for this message type",
        RejectReason::UndefinedTag => "Undefined tag",
        RejectReason::TagSpecifiedWithoutValue => "Tag specified without a value",
        RejectReason::IncorrectDataFormat => "Incorrect data format for value",
        RejectReason::DecryptionProblem => "Decryption problem",
        RejectReason::SignatureProblem => "Signature problem",
        RejectReason::CompIdProblem => "CompID problem",
        RejectReason::SendingTimeAccuracyProblem => "SendingTime accuracy problem",
        RejectReason::InvalidMsgType => "Invalid MsgType",
        RejectReason::Other => "Other",
    }
}
