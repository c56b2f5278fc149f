use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use super::auth::{ChallengeKind, Credentials, DigestChallenge};
use super::builder::SipRequestBuilder;
use super::message::{HeaderAccess, SipHeader, SipMethod, SipRequest, SipResponse};
use super::{generate_branch, generate_call_id, generate_tag, USER_AGENT};
use crate::shared::utils::mask_pii;

const REFRESH_RATIO: f32 = 0.8;
const RETRY_BASE_SECS: u64 = 5;
const RETRY_MAX_SECS: u64 = 60;
const INITIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub addr: SocketAddr,
    pub domain: String,
    pub user: String,
    pub password: Option<String>,
    pub contact_host: String,
    pub contact_port: u16,
    pub expires: u32,
}

/// REGISTER state for the single account VIO owns.
///
/// The client never touches the socket. VIO sends whatever [`RegisterClient::start`],
/// [`RegisterClient::take_pending_request`] and [`RegisterClient::pop_due_request`] hand out.
pub struct RegisterClient {
    cfg: RegistrarConfig,
    call_id: String,
    from_tag: String,
    cseq: u32,
    registered: bool,
    ever_registered: bool,
    auth_nc: u32,
    auth_attempts: u32,
    last_nonce: Option<String>,
    pending_request: Option<SipRequest>,
    current_expires: u32,
    expires_at: Option<Instant>,
    next_refresh_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    retry_delay: Duration,
    initial_deadline: Option<Instant>,
    initial_error: Option<String>,
}

impl RegisterClient {
    pub fn new(cfg: RegistrarConfig) -> Self {
        let expires = cfg.expires;
        let call_id = generate_call_id(&cfg.contact_host);
        Self {
            cfg,
            call_id,
            from_tag: generate_tag(),
            cseq: 1,
            registered: false,
            ever_registered: false,
            auth_nc: 0,
            auth_attempts: 0,
            last_nonce: None,
            pending_request: None,
            current_expires: expires,
            expires_at: None,
            next_refresh_at: None,
            next_retry_at: None,
            retry_delay: Duration::from_secs(RETRY_BASE_SECS),
            initial_deadline: None,
            initial_error: None,
        }
    }

    /// First REGISTER. The account must be registered within 10 s of this call.
    pub fn start(&mut self, now: Instant) -> SipRequest {
        self.initial_deadline = Some(now + INITIAL_TIMEOUT);
        log::info!(
            "[sip register] registering sip:{}@{} via {} password={}",
            self.cfg.user,
            self.cfg.domain,
            self.cfg.addr,
            self.cfg
                .password
                .as_deref()
                .map(mask_pii)
                .unwrap_or_else(|| "<none>".to_string())
        );
        self.build_request_with_expires(self.current_expires, self.cseq)
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.cfg.addr
    }

    pub fn registered(&self) -> bool {
        self.registered
    }

    /// Set when the initial registration failed for good. VIO treats this as fatal.
    pub fn initial_failure(&self, now: Instant) -> Option<String> {
        if self.ever_registered {
            return None;
        }
        if let Some(err) = &self.initial_error {
            return Some(err.clone());
        }
        match self.initial_deadline {
            Some(deadline) if now >= deadline => Some(format!(
                "no answer from registrar {} within {:?}",
                self.cfg.addr, INITIAL_TIMEOUT
            )),
            _ => None,
        }
    }

    pub fn take_pending_request(&mut self) -> Option<SipRequest> {
        self.pending_request.take()
    }

    pub fn pop_due_request(&mut self, now: Instant) -> Option<SipRequest> {
        let due = |t: Option<Instant>| t.is_some_and(|t| now >= t);
        if due(self.next_retry_at) {
            self.next_retry_at = None;
            return Some(self.build_next_request());
        }
        if due(self.next_refresh_at) {
            self.next_refresh_at = None;
            return Some(self.build_next_request());
        }
        None
    }

    pub fn check_expired(&mut self, now: Instant) {
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at && self.registered {
                self.registered = false;
                self.expires_at = None;
                log::warn!("[sip register] registration expired call_id={}", self.call_id);
                self.retry_delay = Duration::from_secs(RETRY_BASE_SECS);
                self.schedule_retry(now);
            }
        }
    }

    /// Consumes a response if it answers our current REGISTER.
    pub fn handle_response(&mut self, resp: &SipResponse, now: Instant) -> bool {
        if resp.call_id() != Some(self.call_id.as_str()) {
            return false;
        }
        match resp.cseq() {
            Some((num, SipMethod::Register)) if num == self.cseq => {}
            _ => return false,
        }
        if resp.is_provisional() {
            return true;
        }
        if resp.is_success() {
            let expires = resp
                .header_value("Expires")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .or_else(|| contact_expires(resp))
                .unwrap_or(self.cfg.expires);
            self.on_register_success(expires, now);
            return true;
        }
        if let Some(kind) = ChallengeKind::from_status(resp.status_code) {
            match self.prepare_authenticated_request(resp, kind) {
                Ok(req) => self.pending_request = Some(req),
                Err(reason) => self.fail(reason, now),
            }
            return true;
        }
        self.fail(
            format!("registrar answered {} {}", resp.status_code, resp.reason_phrase),
            now,
        );
        true
    }

    fn fail(&mut self, reason: String, now: Instant) {
        log::warn!("[sip register] {} call_id={}", reason, self.call_id);
        self.registered = false;
        if !self.ever_registered {
            self.initial_error = Some(reason);
            return;
        }
        self.schedule_retry(now);
    }

    fn prepare_authenticated_request(
        &mut self,
        resp: &SipResponse,
        kind: ChallengeKind,
    ) -> Result<SipRequest, String> {
        let password = self
            .cfg
            .password
            .clone()
            .ok_or_else(|| "registrar requires a password".to_string())?;
        let challenge = resp
            .header_value(kind.challenge_header())
            .and_then(DigestChallenge::parse)
            .ok_or_else(|| format!("missing or unsupported {}", kind.challenge_header()))?;

        if self.last_nonce.as_deref() != Some(challenge.nonce.as_str()) {
            self.last_nonce = Some(challenge.nonce.clone());
            self.auth_nc = 0;
            self.auth_attempts = 0;
        }
        if self.auth_attempts >= 1 {
            return Err("credentials rejected".to_string());
        }

        self.cseq += 1;
        self.auth_nc += 1;
        self.auth_attempts += 1;
        let creds = Credentials {
            username: self.cfg.user.clone(),
            password,
        };
        let value = creds
            .authorize("REGISTER", &self.request_uri(), &challenge, self.auth_nc)
            .ok_or_else(|| "unsupported digest algorithm".to_string())?;
        let mut req = self.build_request_with_expires(self.current_expires, self.cseq);
        req.headers
            .push(SipHeader::new(kind.credentials_header(), value));
        Ok(req)
    }

    fn on_register_success(&mut self, expires: u32, now: Instant) {
        self.registered = true;
        self.ever_registered = true;
        self.auth_attempts = 0;
        let expires = expires.max(1);
        let refresh_after = ((expires as f32) * REFRESH_RATIO).max(1.0) as u64;
        self.current_expires = expires;
        self.expires_at = Some(now + Duration::from_secs(expires as u64));
        self.next_refresh_at = Some(now + Duration::from_secs(refresh_after));
        self.next_retry_at = None;
        self.retry_delay = Duration::from_secs(RETRY_BASE_SECS);
        log::info!(
            "[sip register] registered call_id={} expires={}",
            self.call_id,
            expires
        );
    }

    fn schedule_retry(&mut self, now: Instant) {
        let delay = self.retry_delay;
        self.next_retry_at = Some(now + delay);
        self.retry_delay = (self.retry_delay * 2).min(Duration::from_secs(RETRY_MAX_SECS));
        log::warn!(
            "[sip register] retry scheduled in {:?} call_id={}",
            delay,
            self.call_id
        );
    }

    fn build_next_request(&mut self) -> SipRequest {
        self.cseq += 1;
        self.auth_attempts = 0;
        self.build_request_with_expires(self.current_expires, self.cseq)
    }

    fn request_uri(&self) -> String {
        format!("sip:{}", self.cfg.domain)
    }

    fn build_request_with_expires(&self, expires: u32, cseq: u32) -> SipRequest {
        let aor = format!("sip:{}@{}", self.cfg.user, self.cfg.domain);
        SipRequestBuilder::new(SipMethod::Register, self.request_uri())
            .header(
                "Via",
                format!(
                    "SIP/2.0/UDP {}:{};branch={};rport",
                    self.cfg.contact_host,
                    self.cfg.contact_port,
                    generate_branch()
                ),
            )
            .header("Max-Forwards", "70")
            .header("From", format!("<{}>;tag={}", aor, self.from_tag))
            .header("To", format!("<{}>", aor))
            .header("Call-ID", self.call_id.clone())
            .header("CSeq", format!("{} REGISTER", cseq))
            .header(
                "Contact",
                format!(
                    "<sip:{}@{}:{}>",
                    self.cfg.user, self.cfg.contact_host, self.cfg.contact_port
                ),
            )
            .header("Expires", expires.to_string())
            .header("User-Agent", USER_AGENT)
            .build()
    }
}

fn contact_expires(resp: &SipResponse) -> Option<u32> {
    let contact = resp.header_value("Contact")?;
    contact.split(';').find_map(|p| {
        let (k, v) = p.split_once('=')?;
        if k.trim().eq_ignore_ascii_case("expires") {
            v.trim().parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sip::builder::SipResponseBuilder;

    fn sample_config() -> RegistrarConfig {
        RegistrarConfig {
            addr: "127.0.0.1:5060".parse().unwrap(),
            domain: "example.com".to_string(),
            user: "alice".to_string(),
            password: Some("secret".to_string()),
            contact_host: "127.0.0.1".to_string(),
            contact_port: 5070,
            expires: 3600,
        }
    }

    fn response(client: &RegisterClient, code: u16) -> SipResponseBuilder {
        SipResponseBuilder::new(code, "x")
            .header("Call-ID", client.call_id.clone())
            .header("CSeq", format!("{} REGISTER", client.cseq))
    }

    #[tokio::test(start_paused = true)]
    async fn success_schedules_refresh_at_eighty_percent() {
        let mut client = RegisterClient::new(sample_config());
        let now = Instant::now();
        let req = client.start(now);
        assert_eq!(req.header_value("Expires"), Some("3600"));
        let resp = response(&client, 200).header("Expires", "100").build();
        assert!(client.handle_response(&resp, now));
        assert!(client.registered());
        assert!(client.pop_due_request(now + Duration::from_secs(79)).is_none());
        let refresh = client
            .pop_due_request(now + Duration::from_secs(80))
            .unwrap();
        assert_eq!(refresh.cseq(), Some((2, SipMethod::Register)));
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_produces_authorized_request() {
        let mut client = RegisterClient::new(sample_config());
        let now = Instant::now();
        client.start(now);
        let resp = response(&client, 401)
            .header(
                "WWW-Authenticate",
                r#"Digest realm="example.com", nonce="abc", qop="auth""#,
            )
            .build();
        assert!(client.handle_response(&resp, now));
        let req = client.take_pending_request().unwrap();
        let auth = req.header_value("Authorization").unwrap();
        assert!(auth.starts_with("Digest username=\"alice\""));
        assert!(client.initial_failure(now).is_none());

        // the same nonce again means the password was wrong
        let again = response(&client, 401)
            .header(
                "WWW-Authenticate",
                r#"Digest realm="example.com", nonce="abc", qop="auth""#,
            )
            .build();
        client.handle_response(&again, now);
        assert!(client.initial_failure(now).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_from_registrar_is_fatal_initially() {
        let mut client = RegisterClient::new(sample_config());
        let now = Instant::now();
        client.start(now);
        assert!(client.initial_failure(now + Duration::from_secs(9)).is_none());
        assert!(client.initial_failure(now + Duration::from_secs(10)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_after_registration_back_off() {
        let mut client = RegisterClient::new(sample_config());
        let now = Instant::now();
        client.start(now);
        client.handle_response(&response(&client, 200).build(), now);
        let refresh = client
            .pop_due_request(now + Duration::from_secs(3000))
            .unwrap();
        assert!(refresh.cseq().is_some());
        client.handle_response(&response(&client, 503).build(), now);
        assert!(client.initial_failure(now).is_none());
        assert!(client.pop_due_request(now + Duration::from_secs(4)).is_none());
        assert!(client.pop_due_request(now + Duration::from_secs(5)).is_some());
        assert_eq!(client.retry_delay, Duration::from_secs(10));
    }
}
