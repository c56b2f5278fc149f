use std::fmt::{self, Write};

#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Vec<SipHeader>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<SipHeader>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Unknown(String),
}

impl SipMethod {
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "INVITE" => Self::Invite,
            "ACK" => Self::Ack,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "OPTIONS" => Self::Options,
            "REGISTER" => Self::Register,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Options => "OPTIONS",
            Self::Register => "REGISTER",
            Self::Unknown(token) => token.as_str(),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

impl SipHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Case-insensitive header access shared by requests and responses.
pub trait HeaderAccess {
    fn headers(&self) -> &[SipHeader];

    fn header_value(&self, name: &str) -> Option<&str> {
        let compact = compact_form(name);
        self.headers()
            .iter()
            .find(|h| {
                h.name.eq_ignore_ascii_case(name)
                    || compact.is_some_and(|c| h.name.eq_ignore_ascii_case(c))
            })
            .map(|h| h.value.as_str())
    }

    fn call_id(&self) -> Option<&str> {
        self.header_value("Call-ID")
    }

    /// `(number, method)` from the CSeq header.
    fn cseq(&self) -> Option<(u32, SipMethod)> {
        let raw = self.header_value("CSeq")?;
        let mut parts = raw.split_whitespace();
        let num = parts.next()?.parse().ok()?;
        let method = SipMethod::from_token(parts.next()?);
        Some((num, method))
    }

    fn from_tag(&self) -> Option<&str> {
        self.header_value("From").and_then(tag_param)
    }

    fn to_tag(&self) -> Option<&str> {
        self.header_value("To").and_then(tag_param)
    }
}

impl HeaderAccess for SipRequest {
    fn headers(&self) -> &[SipHeader] {
        &self.headers
    }
}

impl HeaderAccess for SipResponse {
    fn headers(&self) -> &[SipHeader] {
        &self.headers
    }
}

fn compact_form(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "call-id" => Some("i"),
        "from" => Some("f"),
        "to" => Some("t"),
        "via" => Some("v"),
        "contact" => Some("m"),
        "content-length" => Some("l"),
        "content-type" => Some("c"),
        _ => None,
    }
}

/// Value of the `tag` parameter of a From/To header.
pub fn tag_param(value: &str) -> Option<&str> {
    value.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=')?;
        k.trim().eq_ignore_ascii_case("tag").then(|| v.trim())
    })
}

impl SipRequest {
    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.to_string().into_bytes();
        buf.extend_from_slice(&self.body);
        buf
    }
}

impl SipResponse {
    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.to_string().into_bytes();
        buf.extend_from_slice(&self.body);
        buf
    }
}

pub(crate) fn ensure_content_length(headers: &mut Vec<SipHeader>, body_len: usize) {
    let has_len = headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("Content-Length"));
    if !has_len {
        headers.push(SipHeader::new("Content-Length", body_len.to_string()));
    }
}

fn render_headers(headers: &[SipHeader], body_len: usize, out: &mut String) {
    for h in headers {
        let _ = write!(out, "{}: {}\r\n", h.name, h.value);
    }
    if !headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("Content-Length"))
    {
        let _ = write!(out, "Content-Length: {}\r\n", body_len);
    }
    out.push_str("\r\n");
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let _ = write!(out, "{} {} {}\r\n", self.method, self.uri, self.version);
        render_headers(&self.headers, self.body.len(), &mut out);
        f.write_str(&out)
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let _ = write!(
            out,
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        );
        render_headers(&self.headers, self.body.len(), &mut out);
        f.write_str(&out)
    }
}
