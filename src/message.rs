use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Exchange correlation token: an opaque byte string of up to eight bytes, scoped to a
///  (local endpoint, remote peer) pair. The token is what ties an asynchronous response
///  (or a stream of observe notifications) back to the request that caused it, across
///  arbitrarily many message-id generations.
///
/// Tokens are ordered as big-endian unsigned integers of their own length, with shorter
///  tokens sorting before longer ones. That ordering is what makes successor-based
///  allocation O(1) amortized (see the token allocator).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; 8],
}

impl Token {
    pub const MAX_LEN: usize = 8;

    /// The empty token - valid on the wire (pings and other 'empty' messages use it),
    ///  never handed out by the allocator.
    pub const EMPTY: Token = Token { len: 0, bytes: [0; 8] };

    pub fn from_bytes(bytes: &[u8]) -> Token {
        assert!(bytes.len() <= Self::MAX_LEN, "a token has at most eight bytes");
        let mut result = Token { len: bytes.len() as u8, bytes: [0; 8] };
        result.bytes[..bytes.len()].copy_from_slice(bytes);
        result
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The numeric successor of this token: increment as a big-endian unsigned integer,
    ///  moving to the next length (all zeroes) on overflow. `None` once `max_len` is
    ///  exhausted - the caller must surface that rather than reuse a token.
    pub fn successor(&self, max_len: usize) -> Option<Token> {
        let mut next = *self;
        for i in (0..self.len as usize).rev() {
            match next.bytes[i].checked_add(1) {
                Some(b) => {
                    next.bytes[i] = b;
                    return Some(next);
                }
                None => next.bytes[i] = 0,
            }
        }
        if (self.len as usize) < max_len {
            Some(Token { len: self.len + 1, bytes: [0; 8] })
        }
        else {
            None
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len);
        buf.put_slice(self.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Token> {
        let len = buf.try_get_u8()? as usize;
        if len > Self::MAX_LEN {
            return Err(anyhow::anyhow!("token length {} exceeds the maximum of {}", len, Self::MAX_LEN));
        }
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut().take(len) {
            *b = buf.try_get_u8()?;
        }
        Ok(Token { len: len as u8, bytes })
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        if self.is_empty() {
            write!(f, "<empty>")?;
        }
        Ok(())
    }
}


/// 16-bit message id for duplicate detection and ACK / RST correlation. Short-lived by
///  design: an id stays reserved for the exchange-lifetime window even after its exchange
///  has ended, so stale duplicates arriving late still hit the dedup table.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u16);

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    pub fn is_confirmable(&self) -> bool {
        *self == MessageType::Confirmable
    }
}


/// Message code in `class.detail` notation: three bits of class, five bits of detail.
///  Class 0 is requests (detail 0 being the 'empty' code), classes 2/4/5 are responses.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const fn new(class: u8, detail: u8) -> Code {
        Code(class << 5 | detail)
    }

    pub const EMPTY: Code = Code::new(0, 0);

    pub const GET: Code = Code::new(0, 1);

    pub const VALID: Code = Code::new(2, 3);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_response(&self) -> bool {
        self.class() >= 2
    }

    pub fn is_error(&self) -> bool {
        self.class() == 4 || self.class() == 5
    }
}

impl Debug for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}


/// Observe option value registering interest in a resource.
pub const OBSERVE_REGISTER: u32 = 0;
/// Observe option value explicitly ending an observation.
pub const OBSERVE_DEREGISTER: u32 = 1;

/// The narrow slice of option semantics this engine interprets: the observe marker /
///  sequence number, cache lifetime, entity tags, content format and the request path.
///  Everything else an encoder may add is opaque to the exchange layer.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Options {
    /// registration marker in requests, notification sequence number in responses
    pub observe: Option<u32>,
    /// cache lifetime of the representation, in seconds
    pub max_age: Option<u32>,
    pub content_format: Option<u16>,
    /// entity tags: the current tag on responses, the set the sender already holds on requests
    pub etags: Vec<Bytes>,
    pub uri_path: String,
    /// set when decoding encountered a critical option this engine does not understand;
    ///  requests carrying it are answered 4.02, responses carrying it are used anyway
    pub unknown_critical: bool,
}

const OPT_FLAG_OBSERVE: u8 = 0x01;
const OPT_FLAG_MAX_AGE: u8 = 0x02;
const OPT_FLAG_CONTENT_FORMAT: u8 = 0x04;
const OPT_FLAG_UNKNOWN_CRITICAL: u8 = 0x80;
/// elective option bits that decoders of this generation do not assign a meaning
const OPT_FLAGS_ELECTIVE_UNKNOWN: u8 = 0x78;


/// One decoded message as the exchange layer sees it. The byte-level representation is an
///  opaque boundary: `ser` / `try_deser` stand in for the bit-packed wire codec, which is
///  an external collaborator and replaceable without touching anything above it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: MessageId,
    pub token: Token,
    pub options: Options,
    pub payload: Bytes,
}

impl Message {
    /// bare acknowledgement: acknowledges receipt without carrying a response
    pub fn empty_ack(message_id: MessageId) -> Message {
        Message {
            message_type: MessageType::Acknowledgement,
            code: Code::EMPTY,
            message_id,
            token: Token::EMPTY,
            options: Options::default(),
            payload: Bytes::new(),
        }
    }

    pub fn reset(message_id: MessageId) -> Message {
        Message {
            message_type: MessageType::Reset,
            code: Code::EMPTY,
            message_id,
            token: Token::EMPTY,
            options: Options::default(),
            payload: Bytes::new(),
        }
    }

    /// liveness probe: an empty confirmable message, answered by a reset
    pub fn ping() -> Message {
        Message {
            message_type: MessageType::Confirmable,
            code: Code::EMPTY,
            message_id: MessageId(0),
            token: Token::EMPTY,
            options: Options::default(),
            payload: Bytes::new(),
        }
    }

    pub fn request(message_type: MessageType, code: Code, uri_path: &str) -> Message {
        Message {
            message_type,
            code,
            message_id: MessageId(0),
            token: Token::EMPTY,
            options: Options {
                uri_path: uri_path.to_string(),
                ..Options::default()
            },
            payload: Bytes::new(),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.code.is_response() && !self.code.is_error() && self.options.observe.is_some()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type.into());
        buf.put_u8(self.code.0);
        buf.put_u16(self.message_id.0);
        self.token.ser(buf);

        let mut flags = 0u8;
        if self.options.observe.is_some() { flags |= OPT_FLAG_OBSERVE; }
        if self.options.max_age.is_some() { flags |= OPT_FLAG_MAX_AGE; }
        if self.options.content_format.is_some() { flags |= OPT_FLAG_CONTENT_FORMAT; }
        if self.options.unknown_critical { flags |= OPT_FLAG_UNKNOWN_CRITICAL; }
        buf.put_u8(flags);

        if let Some(observe) = self.options.observe { buf.put_u32(observe); }
        if let Some(max_age) = self.options.max_age { buf.put_u32(max_age); }
        if let Some(content_format) = self.options.content_format { buf.put_u16(content_format); }

        buf.put_u8(self.options.etags.len() as u8);
        for etag in &self.options.etags {
            buf.put_u8(etag.len() as u8);
            buf.put_slice(etag);
        }

        buf.put_u16(self.options.uri_path.len() as u16);
        buf.put_slice(self.options.uri_path.as_bytes());

        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let message_type = MessageType::try_from(buf.try_get_u8()?)?;
        let code = Code(buf.try_get_u8()?);
        let message_id = MessageId(buf.try_get_u16()?);
        let token = Token::try_deser(buf)?;

        let flags = buf.try_get_u8()?;
        if flags & OPT_FLAGS_ELECTIVE_UNKNOWN != 0 {
            // elective options we do not understand are skipped, not an error
            tracing::debug!("ignoring unknown elective option flags {:02x}", flags & OPT_FLAGS_ELECTIVE_UNKNOWN);
        }

        let observe = if flags & OPT_FLAG_OBSERVE != 0 { Some(buf.try_get_u32()?) } else { None };
        let max_age = if flags & OPT_FLAG_MAX_AGE != 0 { Some(buf.try_get_u32()?) } else { None };
        let content_format = if flags & OPT_FLAG_CONTENT_FORMAT != 0 { Some(buf.try_get_u16()?) } else { None };

        let num_etags = buf.try_get_u8()?;
        let mut etags = Vec::with_capacity(num_etags as usize);
        for _ in 0..num_etags {
            let len = buf.try_get_u8()? as usize;
            if buf.remaining() < len {
                return Err(anyhow::anyhow!("truncated entity tag"));
            }
            etags.push(buf.copy_to_bytes(len));
        }

        let path_len = buf.try_get_u16()? as usize;
        if buf.remaining() < path_len {
            return Err(anyhow::anyhow!("truncated uri path"));
        }
        let uri_path = String::from_utf8(buf.copy_to_bytes(path_len).to_vec())?;

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Message {
            message_type,
            code,
            message_id,
            token,
            options: Options {
                observe,
                max_age,
                content_format,
                etags,
                uri_path,
                unknown_critical: flags & OPT_FLAG_UNKNOWN_CRITICAL != 0,
            },
            payload,
        })
    }

    /// best-effort look at the fixed header of an undecodable message, so a reset can
    ///  still be sent for it
    pub fn try_peek_header(buf: &[u8]) -> Option<(MessageType, MessageId)> {
        if buf.len() < 4 {
            return None;
        }
        let message_type = MessageType::try_from(buf[0]).ok()?;
        Some((message_type, MessageId(u16::from_be_bytes([buf[2], buf[3]]))))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(b"", &[])]
    #[case::one(b"\x01", &[1])]
    #[case::eight(b"\x01\x02\x03\x04\x05\x06\x07\x08", &[1,2,3,4,5,6,7,8])]
    fn test_token_from_bytes(#[case] bytes: &[u8], #[case] expected: &[u8]) {
        assert_eq!(Token::from_bytes(bytes).as_bytes(), expected);
    }

    #[rstest]
    #[case::empty_grows(b"", 8, Some(vec![0u8]))]
    #[case::simple(b"\x00", 8, Some(vec![1]))]
    #[case::carry(b"\x01\xff", 8, Some(vec![2, 0]))]
    #[case::overflow_grows(b"\xff", 8, Some(vec![0, 0]))]
    #[case::overflow_grows_two(b"\xff\xff", 8, Some(vec![0, 0, 0]))]
    #[case::exhausted(b"\xff", 1, None)]
    #[case::exhausted_max(b"\xff\xff\xff\xff\xff\xff\xff\xff", 8, None)]
    fn test_token_successor(#[case] token: &[u8], #[case] max_len: usize, #[case] expected: Option<Vec<u8>>) {
        let actual = Token::from_bytes(token).successor(max_len);
        assert_eq!(actual.map(|t| t.as_bytes().to_vec()), expected);
    }

    #[test]
    fn test_token_ordering() {
        // shorter tokens sort before longer ones, same length is big-endian numeric
        assert!(Token::EMPTY < Token::from_bytes(b"\x00"));
        assert!(Token::from_bytes(b"\xff") < Token::from_bytes(b"\x00\x00"));
        assert!(Token::from_bytes(b"\x01\x02") < Token::from_bytes(b"\x01\x03"));
        assert!(Token::from_bytes(b"\x01\x02") < Token::from_bytes(b"\x02\x00"));
    }

    #[rstest]
    #[case::empty(Code::EMPTY, 0, 0, true, false, false, false)]
    #[case::get(Code::GET, 0, 1, false, true, false, false)]
    #[case::content(Code::CONTENT, 2, 5, false, false, true, false)]
    #[case::valid(Code::VALID, 2, 3, false, false, true, false)]
    #[case::not_found(Code::NOT_FOUND, 4, 4, false, false, true, true)]
    #[case::server_error(Code::INTERNAL_SERVER_ERROR, 5, 0, false, false, true, true)]
    fn test_code_classes(
        #[case] code: Code,
        #[case] class: u8,
        #[case] detail: u8,
        #[case] is_empty: bool,
        #[case] is_request: bool,
        #[case] is_response: bool,
        #[case] is_error: bool,
    ) {
        assert_eq!(code.class(), class);
        assert_eq!(code.detail(), detail);
        assert_eq!(code.is_empty(), is_empty);
        assert_eq!(code.is_request(), is_request);
        assert_eq!(code.is_response(), is_response);
        assert_eq!(code.is_error(), is_error);
    }

    #[test]
    fn test_code_debug() {
        assert_eq!(format!("{:?}", Code::CONTENT), "2.05");
        assert_eq!(format!("{:?}", Code::NOT_FOUND), "4.04");
    }

    #[rstest]
    #[case::ping(Message::ping(), &[0, 0, 0,0, 0, 0, 0, 0,0])]
    #[case::empty_ack(Message::empty_ack(MessageId(0x1234)), &[2, 0, 0x12,0x34, 0, 0, 0, 0,0])]
    #[case::reset(Message::reset(MessageId(0xffff)), &[3, 0, 0xff,0xff, 0, 0, 0, 0,0])]
    fn test_ser_fixed(#[case] message: Message, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::ping(Message::ping())]
    #[case::request({
        let mut m = Message::request(MessageType::Confirmable, Code::GET, "temperature");
        m.message_id = MessageId(77);
        m.token = Token::from_bytes(b"\x01\x02");
        m.options.observe = Some(OBSERVE_REGISTER);
        m.options.etags = vec![Bytes::from_static(b"abc")];
        m
    })]
    #[case::notification(Message {
        message_type: MessageType::NonConfirmable,
        code: Code::CONTENT,
        message_id: MessageId(4711),
        token: Token::from_bytes(b"\xab"),
        options: Options {
            observe: Some(2),
            max_age: Some(60),
            content_format: Some(0),
            etags: vec![Bytes::from_static(b"v2")],
            uri_path: "temperature".to_string(),
            unknown_critical: false,
        },
        payload: Bytes::from_static(b"21.5"),
    })]
    fn test_ser_deser_round_trip(#[case] message: Message) {
        let mut buf = message.to_bytes();
        let actual = Message::try_deser(&mut buf).unwrap();
        assert_eq!(actual, message);
    }

    #[rstest]
    #[case::truncated_header(&[0, 0, 0x12][..], false)]
    #[case::invalid_type(&[9, 0, 0, 0, 0, 0, 0, 0, 0][..], false)]
    #[case::token_too_long(&[0, 0, 0, 0, 9, 1,2,3,4,5,6,7,8,9, 0, 0, 0, 0][..], false)]
    #[case::minimal(&[0, 0, 0, 0, 0, 0, 0, 0, 0][..], true)]
    fn test_try_deser_errors(#[case] mut buf: &[u8], #[case] ok: bool) {
        assert_eq!(Message::try_deser(&mut buf).is_ok(), ok);
    }

    #[test]
    fn test_deser_unknown_critical_option() {
        let mut message = Message::request(MessageType::Confirmable, Code::GET, "x");
        message.options.unknown_critical = true;

        let mut buf = message.to_bytes();
        let actual = Message::try_deser(&mut buf).unwrap();
        assert!(actual.options.unknown_critical);
    }

    #[rstest]
    #[case::too_short(&[0, 0, 1][..], None)]
    #[case::invalid_type(&[7, 0, 0x12, 0x34][..], None)]
    #[case::con(&[0, 0, 0x12, 0x34][..], Some((MessageType::Confirmable, MessageId(0x1234))))]
    #[case::ack(&[2, 0, 0, 1, 0xff][..], Some((MessageType::Acknowledgement, MessageId(1))))]
    fn test_try_peek_header(#[case] buf: &[u8], #[case] expected: Option<(MessageType, MessageId)>) {
        assert_eq!(Message::try_peek_header(buf), expected);
    }
}
