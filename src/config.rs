use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::FixError;
use crate::schedule::SessionSchedule;

/// Which side of the TCP connection this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Acceptor,
    Initiator,
}

/// Fractional-second precision of outbound SendingTime (tag 52) stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampPrecision {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl TimestampPrecision {
    /// Render a UTCTimestamp the way tag 52 wants it.
    pub fn render(self, t: DateTime<Utc>) -> String {
        let fmt = match self {
            TimestampPrecision::Seconds => "%Y%m%d-%H:%M:%S",
            TimestampPrecision::Millis => "%Y%m%d-%H:%M:%S%.3f",
            TimestampPrecision::Micros => "%Y%m%d-%H:%M:%S%.6f",
            TimestampPrecision::Nanos => "%Y%m%d-%H:%M:%S%.9f",
        };
        t.format(fmt).to_string()
    }
}

/// Everything one session needs to know about itself.
///
/// Mirrors the standard per-session settings keys: `BeginString`,
/// `SenderCompID`, `TargetCompID`, `SessionQualifier`, `DefaultApplVerID`,
/// `ConnectionType`, `HeartBtInt`, the session-time window, the reset and
/// refresh flags, `TimeStampPrecision`, and `PersistMessages`. Parsing a
/// settings file into this struct is the host application's job.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub begin_string: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub session_qualifier: Option<String>,
    /// ApplVerID stamped on FIXT.1.1 logons (tag 1137).
    pub default_appl_ver_id: Option<String>,
    pub connection_type: ConnectionType,
    /// Where an initiator's socket manager should dial. Unused by the
    /// session core itself.
    pub socket_connect_host: Option<String>,
    pub socket_connect_port: Option<u16>,
    pub heart_bt_int: Duration,
    pub logon_timeout: Duration,
    pub logout_timeout: Duration,
    pub schedule: SessionSchedule,
    pub reset_on_logon: bool,
    pub reset_on_logout: bool,
    pub reset_on_disconnect: bool,
    pub refresh_on_logon: bool,
    pub enable_last_msg_seq_num_processed: bool,
    pub timestamp_precision: TimestampPrecision,
    pub persist_messages: bool,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    begin_string: Option<String>,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    session_qualifier: Option<String>,
    default_appl_ver_id: Option<String>,
    connection_type: Option<ConnectionType>,
    socket_connect_host: Option<String>,
    socket_connect_port: Option<u16>,
    heart_bt_int: Option<Duration>,
    logon_timeout: Option<Duration>,
    logout_timeout: Option<Duration>,
    schedule: Option<SessionSchedule>,
    reset_on_logon: bool,
    reset_on_logout: bool,
    reset_on_disconnect: bool,
    refresh_on_logon: bool,
    enable_last_msg_seq_num_processed: bool,
    timestamp_precision: Option<TimestampPrecision>,
    persist_messages: Option<bool>,
}

impl SessionConfigBuilder {
    pub fn begin_string(mut self, v: impl Into<String>) -> Self { self.begin_string = Some(v.into()); self }
    pub fn sender_comp_id(mut self, v: impl Into<String>) -> Self { self.sender_comp_id = Some(v.into()); self }
    pub fn target_comp_id(mut self, v: impl Into<String>) -> Self { self.target_comp_id = Some(v.into()); self }
    pub fn session_qualifier(mut self, v: impl Into<String>) -> Self { self.session_qualifier = Some(v.into()); self }
    pub fn default_appl_ver_id(mut self, v: impl Into<String>) -> Self { self.default_appl_ver_id = Some(v.into()); self }
    pub fn connection_type(mut self, v: ConnectionType) -> Self { self.connection_type = Some(v); self }
    pub fn socket_connect_host(mut self, v: impl Into<String>) -> Self { self.socket_connect_host = Some(v.into()); self }
    pub fn socket_connect_port(mut self, v: u16) -> Self { self.socket_connect_port = Some(v); self }
    pub fn heart_bt_int(mut self, v: Duration) -> Self { self.heart_bt_int = Some(v); self }
    pub fn logon_timeout(mut self, v: Duration) -> Self { self.logon_timeout = Some(v); self }
    pub fn logout_timeout(mut self, v: Duration) -> Self { self.logout_timeout = Some(v); self }
    pub fn schedule(mut self, v: SessionSchedule) -> Self { self.schedule = Some(v); self }
    pub fn reset_on_logon(mut self, v: bool) -> Self { self.reset_on_logon = v; self }
    pub fn reset_on_logout(mut self, v: bool) -> Self { self.reset_on_logout = v; self }
    pub fn reset_on_disconnect(mut self, v: bool) -> Self { self.reset_on_disconnect = v; self }
    pub fn refresh_on_logon(mut self, v: bool) -> Self { self.refresh_on_logon = v; self }
    pub fn enable_last_msg_seq_num_processed(mut self, v: bool) -> Self { self.enable_last_msg_seq_num_processed = v; self }
    pub fn timestamp_precision(mut self, v: TimestampPrecision) -> Self { self.timestamp_precision = Some(v); self }
    pub fn persist_messages(mut self, v: bool) -> Self { self.persist_messages = Some(v); self }

    pub fn build(self) -> crate::Result<SessionConfig> {
        let begin_string = self
            .begin_string
            .ok_or_else(|| FixError::InvalidConfig("begin_string missing".into()))?;
        if !begin_string.starts_with("FIX") {
            return Err(FixError::InvalidConfig(format!(
                "unrecognized BeginString {begin_string:?}"
            )));
        }
        let heart_bt_int = self.heart_bt_int.unwrap_or(Duration::from_secs(30));
        if heart_bt_int.is_zero() {
            return Err(FixError::InvalidConfig("HeartBtInt must be positive".into()));
        }
        Ok(SessionConfig {
            begin_string,
            sender_comp_id: self
                .sender_comp_id
                .ok_or_else(|| FixError::InvalidConfig("sender_comp_id missing".into()))?,
            target_comp_id: self
                .target_comp_id
                .ok_or_else(|| FixError::InvalidConfig("target_comp_id missing".into()))?,
            session_qualifier: self.session_qualifier,
            default_appl_ver_id: self.default_appl_ver_id,
            connection_type: self
                .connection_type
                .ok_or_else(|| FixError::InvalidConfig("connection_type missing".into()))?,
            socket_connect_host: self.socket_connect_host,
            socket_connect_port: self.socket_connect_port,
            heart_bt_int,
            logon_timeout: self.logon_timeout.unwrap_or(Duration::from_secs(10)),
            logout_timeout: self.logout_timeout.unwrap_or(Duration::from_secs(2)),
            schedule: self.schedule.unwrap_or(SessionSchedule::Always),
            reset_on_logon: self.reset_on_logon,
            reset_on_logout: self.reset_on_logout,
            reset_on_disconnect: self.reset_on_disconnect,
            refresh_on_logon: self.refresh_on_logon,
            enable_last_msg_seq_num_processed: self.enable_last_msg_seq_num_processed,
            timestamp_precision: self.timestamp_precision.unwrap_or(TimestampPrecision::Millis),
            persist_messages: self.persist_messages.unwrap_or(true),
        })
    }
}
