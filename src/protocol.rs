//! Tag-value wire codec: framing, checksum, encode/decode, stream
//! extraction.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::dictionary::Dictionary;
use crate::error::DecodeError;
use crate::message::Message;

/// Field separator, ASCII control-A.
pub const SOH: u8 = 0x01;

/// Standard header/trailer and session-level tag numbers.
pub mod tags {
    pub const AVG_PX: u32 = 6;
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECK_SUM: u32 = 10;
    pub const END_SEQ_NO: u32 = 16;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDING_TIME: u32 = 52;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const SIGNATURE: u32 = 89;
    pub const SIGNATURE_LENGTH: u32 = 93;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const ORIG_SENDING_TIME: u32 = 122;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const LAST_MSG_SEQ_NUM_PROCESSED: u32 = 369;
    pub const REF_TAG_ID: u32 = 371;
    pub const REF_MSG_TYPE: u32 = 372;
    pub const SESSION_REJECT_REASON: u32 = 373;
    pub const BUSINESS_REJECT_REASON: u32 = 380;
    pub const DEFAULT_APPL_VER_ID: u32 = 1137;
}

/// MsgType (tag 35) values for the session layer.
pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const LOGON: &str = "A";
    pub const BUSINESS_MESSAGE_REJECT: &str = "j";

    /// The seven administrative message types owned by the session layer.
    pub fn is_admin(mt: &[u8]) -> bool {
        matches!(mt, b"0" | b"1" | b"2" | b"3" | b"4" | b"5" | b"A")
    }
}

/// Sum of all bytes mod 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn put_field(buf: &mut BytesMut, tag: u32, value: &[u8]) {
    buf.put_slice(tag.to_string().as_bytes());
    buf.put_u8(b'=');
    buf.put_slice(value);
    buf.put_u8(SOH);
}

/// Serialize a message with recomputed BodyLength and CheckSum.
///
/// Emission order: 8, 9, 35, remaining header fields in insertion order,
/// body in insertion order, non-checksum trailer fields, then 10.
pub fn encode(msg: &Message) -> Result<BytesMut, DecodeError> {
    let begin_string = msg
        .header
        .get_raw(tags::BEGIN_STRING)
        .ok_or(DecodeError::MissingRequiredTag(tags::BEGIN_STRING))?;
    let msg_type = msg
        .header
        .get_raw(tags::MSG_TYPE)
        .ok_or(DecodeError::MissingRequiredTag(tags::MSG_TYPE))?;

    // everything between BodyLength's SOH and the CheckSum field
    let mut counted = BytesMut::with_capacity(256);
    put_field(&mut counted, tags::MSG_TYPE, msg_type);
    for (tag, value) in msg.header.iter() {
        if tag == tags::BEGIN_STRING || tag == tags::BODY_LENGTH || tag == tags::MSG_TYPE {
            continue;
        }
        put_field(&mut counted, tag, value);
    }
    for (tag, value) in msg.body.iter() {
        put_field(&mut counted, tag, value);
    }
    for (tag, value) in msg.trailer.iter() {
        if tag == tags::CHECK_SUM {
            continue;
        }
        put_field(&mut counted, tag, value);
    }

    let mut out = BytesMut::with_capacity(counted.len() + 32);
    put_field(&mut out, tags::BEGIN_STRING, begin_string);
    put_field(
        &mut out,
        tags::BODY_LENGTH,
        counted.len().to_string().as_bytes(),
    );
    out.extend_from_slice(&counted);

    let ck = checksum(&out);
    out.extend_from_slice(format!("10={:03}\x01", ck).as_bytes());
    Ok(out)
}

struct RawField<'a> {
    tag: u32,
    value: &'a [u8],
    /// Byte offset of the field's first tag character within the frame.
    start: usize,
}

fn split_fields(data: &[u8]) -> Result<Vec<RawField<'_>>, DecodeError> {
    let mut fields = Vec::with_capacity(16);
    let mut pos = 0;
    while pos < data.len() {
        let end = memchr::memchr(SOH, &data[pos..])
            .map(|i| i + pos)
            .ok_or_else(|| DecodeError::Parse("field not terminated by SOH".into()))?;
        let field = &data[pos..end];
        let eq = memchr::memchr(b'=', field)
            .ok_or_else(|| DecodeError::Parse("field missing '='".into()))?;
        let tag = std::str::from_utf8(&field[..eq])
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|t| *t > 0)
            .ok_or_else(|| DecodeError::Parse("non-numeric tag".into()))?;
        fields.push(RawField { tag, value: &field[eq + 1..], start: pos });
        pos = end + 1;
    }
    Ok(fields)
}

/// Decode one complete frame into a [`Message`], partitioning fields into
/// header, body, and trailer per the dictionary.
pub fn decode(data: &[u8], dict: &dyn Dictionary) -> Result<Message, DecodeError> {
    if data.is_empty() || data[data.len() - 1] != SOH {
        return Err(DecodeError::Parse("message must end with SOH".into()));
    }
    let fields = split_fields(data)?;
    if fields.len() < 4 {
        return Err(DecodeError::Parse("too few fields".into()));
    }
    if fields[0].tag != tags::BEGIN_STRING
        || fields[1].tag != tags::BODY_LENGTH
        || fields[2].tag != tags::MSG_TYPE
    {
        return Err(DecodeError::Parse("tags 8, 9, 35 must lead the message".into()));
    }
    let last = &fields[fields.len() - 1];
    if last.tag != tags::CHECK_SUM {
        return Err(DecodeError::MissingRequiredTag(tags::CHECK_SUM));
    }

    // BodyLength covers everything between 9's SOH and the start of 10
    let declared_len: usize = std::str::from_utf8(fields[1].value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DecodeError::Invalid("BodyLength not numeric".into()))?;
    let counted = last.start - fields[2].start;
    if counted != declared_len {
        return Err(DecodeError::Invalid(format!(
            "BodyLength mismatch: declared {declared_len}, counted {counted}"
        )));
    }

    let declared_ck: u32 = std::str::from_utf8(last.value)
        .ok()
        .filter(|s| s.len() == 3)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DecodeError::Invalid("CheckSum not three digits".into()))?;
    let computed_ck = checksum(&data[..last.start]) as u32;
    if declared_ck != computed_ck {
        return Err(DecodeError::Invalid(format!(
            "CheckSum mismatch: declared {declared_ck:03}, computed {computed_ck:03}"
        )));
    }

    let mut msg = Message::default();
    #[derive(Clone, Copy)]
    enum Section {
        Header,
        Body,
        Trailer,
    }
    let mut section = Section::Header;
    for field in &fields {
        match section {
            Section::Header => {
                if dict.is_header_field(field.tag) {
                    msg.header.set_field(field.tag, field.value.to_vec());
                    continue;
                }
                section = Section::Body;
            }
            Section::Body => {}
            Section::Trailer => {
                msg.trailer.set_field(field.tag, field.value.to_vec());
                continue;
            }
        }
        if dict.is_trailer_field(field.tag) {
            section = Section::Trailer;
            msg.trailer.set_field(field.tag, field.value.to_vec());
        } else {
            // repeating groups legitimately repeat tags within the body
            msg.body.append_field(field.tag, field.value.to_vec());
        }
    }

    for tag in dict.required_header_tags() {
        if !msg.header.has(*tag) {
            return Err(DecodeError::MissingRequiredTag(*tag));
        }
    }
    for tag in dict.required_trailer_tags() {
        if !msg.trailer.has(*tag) {
            return Err(DecodeError::MissingRequiredTag(*tag));
        }
    }

    if let Some(mt) = msg.header.get_raw(tags::MSG_TYPE) {
        let mt = std::str::from_utf8(mt).unwrap_or_default().to_string();
        for field in &fields {
            if let Some(spec) = dict.group(&mt, field.tag) {
                msg.read_group(spec)?;
            }
        }
    }

    msg.set_raw(Bytes::copy_from_slice(data));
    Ok(msg)
}

/// Pull one complete frame off an accumulation buffer, if present.
///
/// Scans for `8=`, reads the declared BodyLength, and returns the frame
/// once the trailer has fully arrived. Bytes preceding the frame start are
/// discarded.
pub fn extract_one(buffer: &mut BytesMut) -> Option<Bytes> {
    let data: &[u8] = buffer.as_ref();
    let start = memchr::memmem::find(data, b"8=")?;
    let nine = memchr::memmem::find(&data[start..], b"\x019=").map(|i| i + start + 1)?;
    let nine_end = memchr::memchr(SOH, &data[nine..]).map(|i| i + nine)?;
    let body_len: usize = std::str::from_utf8(&data[nine + 2..nine_end])
        .ok()?
        .parse()
        .ok()?;
    // trailer is a fixed-width "10=" + 3 digits + SOH
    let total = nine_end + 1 + body_len + 7;
    if total > data.len() {
        return None;
    }
    let frame = Bytes::copy_from_slice(&data[start..total]);
    buffer.advance(total);
    Some(frame)
}
