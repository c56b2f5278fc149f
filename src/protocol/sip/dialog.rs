use std::net::SocketAddr;

use super::builder::SipRequestBuilder;
use super::message::{HeaderAccess, SipMethod, SipRequest, SipResponse};
use super::uri::uri_of_name_addr;
use super::{generate_branch, USER_AGENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uas,
    Uac,
}

/// Identifiers and routing of one SIP dialog, as seen from this user agent.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub role: DialogRole,
    pub call_id: String,
    /// Our From/To value including our tag.
    pub local: String,
    /// The peer's From/To value, with its tag once known.
    pub remote: String,
    pub remote_target: String,
    pub peer: SocketAddr,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub contact: String,
    pub via_sent_by: String,
}

impl Dialog {
    /// Dialog created by an incoming INVITE. `local_tag` becomes our To tag.
    pub fn from_invite(
        req: &SipRequest,
        peer: SocketAddr,
        local_tag: &str,
        contact: String,
        via_sent_by: String,
    ) -> Option<Self> {
        let call_id = req.call_id()?.to_string();
        let remote = req.header_value("From")?.to_string();
        let to = req.header_value("To")?;
        let local = if req.to_tag().is_some() {
            to.to_string()
        } else {
            format!("{};tag={}", to, local_tag)
        };
        let remote_target = req
            .header_value("Contact")
            .map(|c| uri_of_name_addr(c).to_string())
            .unwrap_or_else(|| uri_of_name_addr(&remote).to_string());
        let (remote_cseq, _) = req.cseq()?;
        Some(Self {
            role: DialogRole::Uas,
            call_id,
            local,
            remote,
            remote_target,
            peer,
            local_cseq: 0,
            remote_cseq,
            contact,
            via_sent_by,
        })
    }

    /// Dialog for an outgoing INVITE, before any response.
    pub fn outgoing(
        call_id: String,
        local: String,
        remote_uri: &str,
        peer: SocketAddr,
        contact: String,
        via_sent_by: String,
    ) -> Self {
        Self {
            role: DialogRole::Uac,
            call_id,
            local,
            remote: format!("<{}>", remote_uri),
            remote_target: remote_uri.to_string(),
            peer,
            local_cseq: 1,
            remote_cseq: 0,
            contact,
            via_sent_by,
        }
    }

    /// Adopts the peer's To tag and Contact from a response to our INVITE.
    pub fn update_from_response(&mut self, resp: &SipResponse) {
        if let Some(to) = resp.header_value("To") {
            if resp.to_tag().is_some() {
                self.remote = to.to_string();
            }
        }
        if let Some(contact) = resp.header_value("Contact") {
            self.remote_target = uri_of_name_addr(contact).to_string();
        }
    }

    /// New in-dialog request with the next local CSeq.
    pub fn request(&mut self, method: SipMethod) -> SipRequestBuilder {
        self.local_cseq += 1;
        self.request_with_cseq(method, self.local_cseq)
    }

    /// Request reusing an existing CSeq number, as ACK and CANCEL do.
    pub fn request_with_cseq(&self, method: SipMethod, cseq: u32) -> SipRequestBuilder {
        SipRequestBuilder::new(method.clone(), self.remote_target.clone())
            .header(
                "Via",
                format!("SIP/2.0/UDP {};branch={};rport", self.via_sent_by, generate_branch()),
            )
            .header("Max-Forwards", "70")
            .header("From", self.local.clone())
            .header("To", self.remote.clone())
            .header("Call-ID", self.call_id.clone())
            .header("CSeq", format!("{} {}", cseq, method))
            .header("Contact", format!("<{}>", self.contact))
            .header("User-Agent", USER_AGENT)
    }

    /// Whether `req` belongs to this dialog.
    pub fn matches(&self, req: &SipRequest) -> bool {
        req.call_id() == Some(self.call_id.as_str())
    }
}
