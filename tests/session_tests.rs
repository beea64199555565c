//! End-to-end session scenarios: the actor is driven directly through
//! `process`, outbound frames are drained from the wire channel and
//! decoded for inspection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Timelike, Utc};
use tokio::sync::mpsc;

use fixcore::protocol::{self, tags};
use fixcore::{
    AdminEvent, Application, ConnectionType, DoNotSend, MemoryMessageStore, Message, RejectError,
    Session, SessionConfig, SessionConfigBuilder, SessionEvent, SessionId, SessionSchedule,
    SessionState, StandardDictionary,
};

#[derive(Default)]
struct TestApp {
    veto_app_sends: AtomicBool,
    refuse_app_messages: AtomicBool,
    logons: AtomicUsize,
    logouts: AtomicUsize,
    app_messages_in: AtomicUsize,
}

#[async_trait]
impl Application for TestApp {
    async fn on_logon(&self, _session_id: &SessionId) {
        self.logons.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_logout(&self, _session_id: &SessionId) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
    }

    async fn to_app(&self, _msg: &mut Message, _session_id: &SessionId) -> Result<(), DoNotSend> {
        if self.veto_app_sends.load(Ordering::SeqCst) {
            Err(DoNotSend)
        } else {
            Ok(())
        }
    }

    async fn from_app(&self, _msg: &Message, _session_id: &SessionId) -> Result<(), RejectError> {
        if self.refuse_app_messages.load(Ordering::SeqCst) {
            return Err(RejectError::unsupported_message_type());
        }
        self.app_messages_in.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    session: Session,
    wire_rx: mpsc::Receiver<Bytes>,
    app: Arc<TestApp>,
    dict: StandardDictionary,
}

impl Harness {
    async fn acceptor() -> Self {
        Self::with_config(|builder| builder).await
    }

    async fn with_config(
        customize: impl FnOnce(SessionConfigBuilder) -> SessionConfigBuilder,
    ) -> Self {
        let builder = SessionConfig::builder()
            .begin_string("FIX.4.2")
            .sender_comp_id("ISLD")
            .target_comp_id("TW")
            .connection_type(ConnectionType::Acceptor);
        let config = customize(builder).build().unwrap();

        let app = Arc::new(TestApp::default());
        let mut session = Session::new(
            config,
            Box::new(MemoryMessageStore::new()),
            Arc::clone(&app) as Arc<dyn Application>,
            Arc::new(StandardDictionary::new()),
        )
        .await;

        let (wire_tx, wire_rx) = mpsc::channel(64);
        let _ = session
            .process(SessionEvent::Admin(AdminEvent::Connect {
                initiate_logon: false,
                out: wire_tx,
            }))
            .await;

        Self { session, wire_rx, app, dict: StandardDictionary::new() }
    }

    /// Run the peer's half of a logon with sequence number 1.
    async fn logon(&mut self) {
        let logon = encode(&peer_admin("A", 1, |m| {
            m.body.set_int(tags::ENCRYPT_METHOD, 0);
            m.body.set_int(tags::HEART_BT_INT, 30);
        }));
        let _ = self.session.process(SessionEvent::Inbound(logon)).await;
        let reply = self.next_out().expect("logon reply");
        assert_eq!(reply.msg_type().unwrap(), "A");
    }

    async fn inbound(&mut self, msg: &Message) {
        let _ = self
            .session
            .process(SessionEvent::Inbound(encode(msg)))
            .await;
    }

    async fn send(&mut self, msg: Message) {
        let _ = self.session.process(SessionEvent::Send(msg)).await;
    }

    async fn tick(&mut self, now: chrono::DateTime<Utc>) {
        let _ = self.session.process(SessionEvent::Tick(now)).await;
    }

    fn next_out(&mut self) -> Option<Message> {
        let frame = self.wire_rx.try_recv().ok()?;
        Some(protocol::decode(&frame, &self.dict).expect("outbound frame decodes"))
    }

    fn assert_no_output(&mut self) {
        assert!(self.wire_rx.try_recv().is_err(), "unexpected outbound frame");
    }
}

fn sending_time_now() -> String {
    Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

/// A message as the counterparty would stamp it (their sender is TW).
fn peer_message(msg_type: &str, seq: u32) -> Message {
    let mut msg = Message::new(msg_type);
    msg.header.set_string(tags::BEGIN_STRING, "FIX.4.2");
    msg.header.set_string(tags::SENDER_COMP_ID, "TW");
    msg.header.set_string(tags::TARGET_COMP_ID, "ISLD");
    msg.header.set_int(tags::MSG_SEQ_NUM, seq as u64);
    msg.header.set_string(tags::SENDING_TIME, &sending_time_now());
    msg
}

fn peer_admin(msg_type: &str, seq: u32, fill: impl FnOnce(&mut Message)) -> Message {
    let mut msg = peer_message(msg_type, seq);
    fill(&mut msg);
    msg
}

fn peer_order(seq: u32) -> Message {
    let mut msg = peer_message("D", seq);
    msg.body.set_string(11, "order-1");
    msg.body.set_string(55, "MSFT");
    msg
}

fn field(msg: &Message, tag: u32) -> String {
    msg.header
        .get_string(tag)
        .or_else(|_| msg.body.get_string(tag))
        .unwrap_or_default()
}

#[tokio::test]
async fn accepting_logon_on_fresh_store() {
    let mut h = Harness::acceptor().await;

    let logon = encode(&peer_admin("A", 1, |m| {
        m.body.set_int(tags::ENCRYPT_METHOD, 0);
        m.body.set_int(tags::HEART_BT_INT, 30);
    }));
    let _ = h.session.process(SessionEvent::Inbound(logon)).await;

    assert!(h.session.state().is_logged_on());
    assert_eq!(h.app.logons.load(Ordering::SeqCst), 1);

    let reply = h.next_out().expect("logon reply emitted");
    assert_eq!(reply.msg_type().unwrap(), "A");
    assert_eq!(field(&reply, tags::MSG_SEQ_NUM), "1");
    assert_eq!(field(&reply, tags::SENDER_COMP_ID), "ISLD");
    assert_eq!(field(&reply, tags::TARGET_COMP_ID), "TW");

    assert_eq!(h.session.store().next_sender_msg_seq_num(), 2);
    assert_eq!(h.session.store().next_target_msg_seq_num(), 2);
}

#[tokio::test]
async fn gap_detection_requests_resend() {
    let mut h = Harness::acceptor().await;
    h.logon().await;
    h.session
        .store_mut()
        .set_next_target_msg_seq_num(5)
        .await
        .unwrap();

    h.inbound(&peer_order(7)).await;

    let request = h.next_out().expect("resend request emitted");
    assert_eq!(request.msg_type().unwrap(), "2");
    assert_eq!(field(&request, tags::BEGIN_SEQ_NO), "5");
    assert_eq!(field(&request, tags::END_SEQ_NO), "0");
    assert_eq!(h.session.state(), SessionState::Resend);
    assert_eq!(h.session.store().next_target_msg_seq_num(), 5);
    // not delivered to the application yet
    assert_eq!(h.app.app_messages_in.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn heartbeat_after_outbound_silence() {
    let mut h = Harness::acceptor().await;
    h.logon().await;
    let sender_before = h.session.store().next_sender_msg_seq_num();

    h.tick(Utc::now() + chrono::Duration::seconds(31)).await;

    let heartbeat = h.next_out().expect("heartbeat emitted");
    assert_eq!(heartbeat.msg_type().unwrap(), "0");
    assert!(!heartbeat.body.has(tags::TEST_REQ_ID));
    assert_eq!(
        h.session.store().next_sender_msg_seq_num(),
        sender_before + 1
    );
    h.assert_no_output();
}

#[tokio::test]
async fn test_request_echoed_on_heartbeat() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    h.inbound(&peer_admin("1", 2, |m| {
        m.body.set_string(tags::TEST_REQ_ID, "FOO");
    }))
    .await;

    let heartbeat = h.next_out().expect("heartbeat reply");
    assert_eq!(heartbeat.msg_type().unwrap(), "0");
    assert_eq!(field(&heartbeat, tags::TEST_REQ_ID), "FOO");
    assert_eq!(h.session.store().next_target_msg_seq_num(), 3);
}

#[tokio::test]
async fn session_window_close_logs_out() {
    let now = Utc::now();
    let start = (now - chrono::Duration::hours(1)).time().with_nanosecond(0).unwrap();
    let end = (now + chrono::Duration::hours(1)).time().with_nanosecond(0).unwrap();

    let mut h = Harness::with_config(|builder| {
        builder.schedule(SessionSchedule::daily_utc(start, end))
    })
    .await;
    h.logon().await;

    h.tick(now + chrono::Duration::hours(2)).await;

    let logout = h.next_out().expect("logout emitted");
    assert_eq!(logout.msg_type().unwrap(), "5");
    assert_eq!(h.session.state(), SessionState::NotSessionTime);
    assert_eq!(h.app.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn do_not_send_consumes_no_sequence_number() {
    let mut h = Harness::acceptor().await;
    h.logon().await;
    let sender_before = h.session.store().next_sender_msg_seq_num();

    h.app.veto_app_sends.store(true, Ordering::SeqCst);
    let mut order = Message::new("D");
    order.body.set_string(11, "vetoed");
    h.send(order).await;

    h.assert_no_output();
    assert_eq!(h.session.store().next_sender_msg_seq_num(), sender_before);
    assert!(h
        .session
        .store()
        .messages_in_range(sender_before, sender_before)
        .await
        .unwrap()
        .is_empty());

    // the next admin message picks up the unconsumed number
    h.tick(Utc::now() + chrono::Duration::seconds(31)).await;
    let heartbeat = h.next_out().expect("heartbeat emitted");
    assert_eq!(field(&heartbeat, tags::MSG_SEQ_NUM), sender_before.to_string());
}

#[tokio::test]
async fn sends_queued_while_not_logged_on_drain_after_logon() {
    let mut h = Harness::acceptor().await;

    let mut order = Message::new("D");
    order.body.set_string(11, "early");
    h.send(order).await;
    h.assert_no_output();

    h.logon().await;

    let drained = h.next_out().expect("queued order sent after logon");
    assert_eq!(drained.msg_type().unwrap(), "D");
    assert_eq!(field(&drained, tags::MSG_SEQ_NUM), "2");
    assert_eq!(field(&drained, 11), "early");
}

#[tokio::test]
async fn comp_id_mismatch_is_rejected() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    let mut bad = peer_order(2);
    bad.header.set_string(tags::SENDER_COMP_ID, "JCD");
    h.inbound(&bad).await;

    let reject = h.next_out().expect("reject emitted");
    assert_eq!(reject.msg_type().unwrap(), "3");
    assert_eq!(field(&reject, tags::SESSION_REJECT_REASON), "9");
    assert_eq!(field(&reject, tags::REF_SEQ_NUM), "2");
    assert!(h.session.state().is_logged_on());
    assert_eq!(h.session.store().next_target_msg_seq_num(), 3);
    assert_eq!(h.app.app_messages_in.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_sending_time_rejects_then_logs_out() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    let mut stale = peer_order(2);
    let old = Utc::now() - chrono::Duration::seconds(200);
    stale
        .header
        .set_string(tags::SENDING_TIME, &old.format("%Y%m%d-%H:%M:%S%.3f").to_string());
    h.inbound(&stale).await;

    let reject = h.next_out().expect("reject emitted");
    assert_eq!(reject.msg_type().unwrap(), "3");
    assert_eq!(field(&reject, tags::SESSION_REJECT_REASON), "10");
    let logout = h.next_out().expect("logout follows");
    assert_eq!(logout.msg_type().unwrap(), "5");
    assert_eq!(h.session.state(), SessionState::Logout);
    assert_eq!(h.app.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequence_too_low_without_poss_dup_is_fatal() {
    let mut h = Harness::acceptor().await;
    h.logon().await;
    h.session
        .store_mut()
        .set_next_target_msg_seq_num(10)
        .await
        .unwrap();

    h.inbound(&peer_order(3)).await;

    // silent disconnect: no Reject, no Logout
    h.assert_no_output();
    assert_eq!(h.session.state(), SessionState::Latent);
    assert_eq!(h.app.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn poss_dup_below_expected_is_ignored() {
    let mut h = Harness::acceptor().await;
    h.logon().await;
    h.session
        .store_mut()
        .set_next_target_msg_seq_num(10)
        .await
        .unwrap();

    let mut dup = peer_order(3);
    dup.header.set_bool(tags::POSS_DUP_FLAG, true);
    h.inbound(&dup).await;

    h.assert_no_output();
    assert!(h.session.state().is_logged_on());
    assert_eq!(h.session.store().next_target_msg_seq_num(), 10);
    assert_eq!(h.app.app_messages_in.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resend_request_replays_apps_and_gap_fills_admins() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    // one application message on the wire, seq 2 (logon reply was 1)
    let mut order = Message::new("D");
    order.body.set_string(11, "resend-me");
    h.send(order).await;
    let sent = h.next_out().expect("order emitted");
    assert_eq!(field(&sent, tags::MSG_SEQ_NUM), "2");

    h.inbound(&peer_admin("2", 2, |m| {
        m.body.set_int(tags::BEGIN_SEQ_NO, 1);
        m.body.set_int(tags::END_SEQ_NO, 0);
    }))
    .await;

    // the admin logon at seq 1 collapses into a gap fill
    let gap_fill = h.next_out().expect("gap fill emitted");
    assert_eq!(gap_fill.msg_type().unwrap(), "4");
    assert_eq!(field(&gap_fill, tags::MSG_SEQ_NUM), "1");
    assert_eq!(field(&gap_fill, tags::GAP_FILL_FLAG), "Y");
    assert_eq!(field(&gap_fill, tags::NEW_SEQ_NO), "2");
    assert_eq!(field(&gap_fill, tags::POSS_DUP_FLAG), "Y");

    let replayed = h.next_out().expect("order replayed");
    assert_eq!(replayed.msg_type().unwrap(), "D");
    assert_eq!(field(&replayed, tags::MSG_SEQ_NUM), "2");
    assert_eq!(field(&replayed, tags::POSS_DUP_FLAG), "Y");
    assert!(replayed.header.has(tags::ORIG_SENDING_TIME));
    assert_eq!(field(&replayed, 11), "resend-me");

    // the resend request itself advanced the target counter
    assert_eq!(h.session.store().next_target_msg_seq_num(), 3);
    // replays reuse already-consumed numbers
    assert_eq!(h.session.store().next_sender_msg_seq_num(), 3);
}

#[tokio::test]
async fn inbound_gap_fill_advances_target() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    h.inbound(&peer_admin("4", 2, |m| {
        m.body.set_bool(tags::GAP_FILL_FLAG, true);
        m.body.set_int(tags::NEW_SEQ_NO, 8);
    }))
    .await;

    h.assert_no_output();
    assert_eq!(h.session.store().next_target_msg_seq_num(), 8);
    assert_eq!(h.app.app_messages_in.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn hard_sequence_reset_applies_regardless_of_seq() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    // deliberately out-of-order MsgSeqNum: reset mode must still apply
    h.inbound(&peer_admin("4", 99, |m| {
        m.body.set_int(tags::NEW_SEQ_NO, 20);
    }))
    .await;

    h.assert_no_output();
    assert_eq!(h.session.store().next_target_msg_seq_num(), 20);
}

#[tokio::test]
async fn buffered_messages_replay_once_gap_closes() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    h.inbound(&peer_order(4)).await;
    let request = h.next_out().expect("resend request");
    assert_eq!(request.msg_type().unwrap(), "2");
    assert_eq!(h.session.state(), SessionState::Resend);

    h.inbound(&peer_order(2)).await;
    assert_eq!(h.session.state(), SessionState::Resend);
    h.inbound(&peer_order(3)).await;

    // 2, 3 delivered in order, then the stashed 4
    assert_eq!(h.app.app_messages_in.load(Ordering::SeqCst), 3);
    assert_eq!(h.session.state(), SessionState::InSession);
    assert_eq!(h.session.store().next_target_msg_seq_num(), 5);
}

#[tokio::test]
async fn peer_logout_is_acknowledged() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    h.inbound(&peer_admin("5", 2, |_| {})).await;

    let ack = h.next_out().expect("logout ack");
    assert_eq!(ack.msg_type().unwrap(), "5");
    assert_eq!(h.session.state(), SessionState::Latent);
    assert_eq!(h.app.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.store().next_target_msg_seq_num(), 3);
}

#[tokio::test]
async fn stop_sends_logout_and_breaks_the_loop() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    let flow = h
        .session
        .process(SessionEvent::Admin(AdminEvent::Stop))
        .await;

    assert!(flow.is_break());
    let logout = h.next_out().expect("logout emitted");
    assert_eq!(logout.msg_type().unwrap(), "5");
    assert_eq!(h.session.state(), SessionState::Latent);
}

#[tokio::test]
async fn garbled_bytes_disconnect_silently() {
    let mut h = Harness::acceptor().await;
    h.logon().await;

    let _ = h
        .session
        .process(SessionEvent::Inbound(Bytes::from_static(
            b"8=FIX.4.2\x019=banana\x0135=D\x0110=000\x01",
        )))
        .await;

    h.assert_no_output();
    assert_eq!(h.session.state(), SessionState::Latent);
}

#[tokio::test]
async fn quiet_peer_gets_test_request_then_disconnect() {
    let mut h = Harness::acceptor().await;
    h.logon().await;
    let now = Utc::now();

    // 37s of inbound silence with a 30s heartbeat interval
    h.tick(now + chrono::Duration::seconds(37)).await;
    // heartbeat for our own outbound silence comes first
    let heartbeat = h.next_out().expect("heartbeat");
    assert_eq!(heartbeat.msg_type().unwrap(), "0");
    let probe = h.next_out().expect("test request");
    assert_eq!(probe.msg_type().unwrap(), "1");
    assert!(matches!(h.session.state(), SessionState::PendingTimeout(_)));

    // still nothing inbound after the grace period
    h.tick(now + chrono::Duration::seconds(80)).await;
    assert_eq!(h.session.state(), SessionState::Latent);
    assert_eq!(h.app.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn initiator_sends_logon_with_reset_on_logon() {
    let config = SessionConfig::builder()
        .begin_string("FIX.4.2")
        .sender_comp_id("ISLD")
        .target_comp_id("TW")
        .connection_type(ConnectionType::Initiator)
        .reset_on_logon(true)
        .heart_bt_int(Duration::from_secs(45))
        .build()
        .unwrap();
    let app = Arc::new(TestApp::default());
    let mut session = Session::new(
        config,
        Box::new(MemoryMessageStore::new()),
        Arc::clone(&app) as Arc<dyn Application>,
        Arc::new(StandardDictionary::new()),
    )
    .await;
    // pre-existing counters from an earlier epoch
    session.store_mut().set_next_sender_msg_seq_num(40).await.unwrap();

    let (wire_tx, mut wire_rx) = mpsc::channel(8);
    let _ = session
        .process(SessionEvent::Admin(AdminEvent::Connect {
            initiate_logon: true,
            out: wire_tx,
        }))
        .await;

    assert_eq!(session.state(), SessionState::Logon);
    let frame = wire_rx.try_recv().expect("logon emitted");
    let logon = protocol::decode(&frame, &StandardDictionary::new()).unwrap();
    assert_eq!(logon.msg_type().unwrap(), "A");
    // reset-on-logon restarted the epoch before stamping
    assert_eq!(field(&logon, tags::MSG_SEQ_NUM), "1");
    assert_eq!(field(&logon, tags::RESET_SEQ_NUM_FLAG), "Y");
    assert_eq!(field(&logon, tags::HEART_BT_INT), "45");
    assert_eq!(session.store().next_sender_msg_seq_num(), 2);
}

#[tokio::test]
async fn unsupported_message_type_becomes_business_reject() {
    let mut h = Harness::acceptor().await;
    h.logon().await;
    h.app.refuse_app_messages.store(true, Ordering::SeqCst);

    h.inbound(&peer_order(2)).await;

    let reject = h.next_out().expect("business reject emitted");
    assert_eq!(reject.msg_type().unwrap(), "j");
    assert_eq!(field(&reject, tags::BUSINESS_REJECT_REASON), "3");
    assert_eq!(field(&reject, tags::REF_SEQ_NUM), "2");
    assert_eq!(field(&reject, tags::REF_MSG_TYPE), "D");
    // the message still counted against the target sequence
    assert!(h.session.state().is_logged_on());
    assert_eq!(h.session.store().next_target_msg_seq_num(), 3);
}

#[tokio::test]
async fn last_msg_seq_num_processed_is_stamped_when_enabled() {
    let mut h =
        Harness::with_config(|builder| builder.enable_last_msg_seq_num_processed(true)).await;
    h.logon().await;

    h.inbound(&peer_admin("1", 2, |m| {
        m.body.set_string(tags::TEST_REQ_ID, "PING");
    }))
    .await;

    let heartbeat = h.next_out().expect("heartbeat reply");
    assert_eq!(field(&heartbeat, tags::LAST_MSG_SEQ_NUM_PROCESSED), "2");
}

fn encode(msg: &Message) -> Bytes {
    msg.to_bytes().unwrap().freeze()
}
