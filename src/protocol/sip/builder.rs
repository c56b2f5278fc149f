use super::message::{ensure_content_length, HeaderAccess, SipHeader, SipMethod, SipRequest, SipResponse};

pub struct SipResponseBuilder {
    status_code: u16,
    reason_phrase: String,
    headers: Vec<SipHeader>,
    body: Vec<u8>,
}

pub struct SipRequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<SipHeader>,
    body: Vec<u8>,
}

impl SipResponseBuilder {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code: code,
            reason_phrase: reason.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(SipHeader::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        self.body = body.into();
        set_content_type(&mut self.headers, content_type);
        self
    }

    pub fn build(mut self) -> SipResponse {
        ensure_content_length(&mut self.headers, self.body.len());
        SipResponse {
            version: "SIP/2.0".to_string(),
            status_code: self.status_code,
            reason_phrase: self.reason_phrase,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl SipRequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(SipHeader::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        self.body = body.into();
        set_content_type(&mut self.headers, content_type);
        self
    }

    pub fn build(mut self) -> SipRequest {
        ensure_content_length(&mut self.headers, self.body.len());
        SipRequest {
            method: self.method,
            uri: self.uri,
            version: "SIP/2.0".to_string(),
            headers: self.headers,
            body: self.body,
        }
    }
}

fn set_content_type(headers: &mut Vec<SipHeader>, content_type: &str) {
    let has_ct = headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("Content-Type"));
    if !has_ct {
        headers.push(SipHeader::new("Content-Type", content_type));
    }
}

/// Starts a response that mirrors the transaction headers of `req`.
///
/// Every Via is copied in order. `to_tag` is appended to To unless the request already
/// carries one. Returns `None` when a mandatory header is missing.
pub fn response_from_request(
    req: &SipRequest,
    code: u16,
    to_tag: Option<&str>,
) -> Option<SipResponseBuilder> {
    let from = req.header_value("From")?;
    let mut to = req.header_value("To")?.to_string();
    let call_id = req.header_value("Call-ID")?;
    let cseq = req.header_value("CSeq")?;

    if let Some(tag) = to_tag {
        if req.to_tag().is_none() && code != 100 {
            to = format!("{};tag={}", to, tag);
        }
    }

    let mut builder = SipResponseBuilder::new(code, reason_phrase(code));
    for via in req
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Via") || h.name == "v")
    {
        builder = builder.header("Via", via.value.clone());
    }
    Some(
        builder
            .header("From", from)
            .header("To", to)
            .header("Call-ID", call_id)
            .header("CSeq", cseq),
    )
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        603 => "Decline",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        SipRequestBuilder::new(SipMethod::Invite, "sip:bot@h")
            .header("Via", "SIP/2.0/UDP a:5060;branch=z9hG4bK1")
            .header("Via", "SIP/2.0/UDP b:5060;branch=z9hG4bK2")
            .header("From", "<sip:1000@h>;tag=f1")
            .header("To", "<sip:bot@h>")
            .header("Call-ID", "c1")
            .header("CSeq", "1 INVITE")
            .build()
    }

    #[test]
    fn response_copies_vias_and_adds_tag() {
        let resp = response_from_request(&invite(), 486, Some("t9"))
            .unwrap()
            .build();
        let vias: Vec<_> = resp
            .headers
            .iter()
            .filter(|h| h.name == "Via")
            .collect();
        assert_eq!(vias.len(), 2);
        assert_eq!(resp.to_tag(), Some("t9"));
        assert_eq!(resp.reason_phrase, "Busy Here");
    }

    #[test]
    fn trying_has_no_to_tag() {
        let resp = response_from_request(&invite(), 100, Some("t9"))
            .unwrap()
            .build();
        assert_eq!(resp.to_tag(), None);
    }
}
