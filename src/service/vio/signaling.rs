use std::net::SocketAddr;
use std::time::SystemTime;

use anyhow::{bail, Result};
use tokio::time::Instant;

use super::call::{Call, CallPhase, Media, OutgoingInvite, Retransmit, HANGUP_TIMEOUT, TRANSACTION_TIMEOUT};
use super::destination::Destination;
use super::{resolve, UserAgent};
use crate::protocol::sip::auth::{ChallengeKind, Credentials, DigestChallenge};
use crate::protocol::sip::message::tag_param;
use crate::protocol::sip::sdp::{self, SessionDescription, TELEPHONE_EVENT_PT};
use crate::protocol::sip::uri::{remote_uri_of, SipUri};
use crate::protocol::sip::{
    generate_call_id, generate_tag, parse_sip_message, response_from_request, Dialog, DialogRole,
    HeaderAccess, SipMessage, SipMethod, SipRequest, SipRequestBuilder, SipResponse, ALLOW,
    USER_AGENT,
};
use crate::service::pipeline::VioEvent;

enum TimerAction {
    Retransmit(SipResponse, SocketAddr),
    AckTimeout,
    InviteTimeout,
    HangupTimeout(&'static str),
}

impl UserAgent {
    pub(super) async fn on_sip_datagram(&mut self, buf: &[u8], src: SocketAddr) {
        // keep-alive
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            return;
        }
        match parse_sip_message(buf) {
            Ok(SipMessage::Request(req)) => {
                log::debug!("[vio] <- {} from {}", req.method, src);
                self.on_request(req, src).await;
            }
            Ok(SipMessage::Response(resp)) => {
                log::debug!("[vio] <- {} {} from {}", resp.status_code, resp.reason_phrase, src);
                self.on_response(resp).await;
            }
            Err(e) => log::warn!("[vio] unparsable SIP datagram from {}: {}", src, e),
        }
    }

    async fn send_request(&self, req: &SipRequest, dst: SocketAddr) -> bool {
        log::debug!("[vio] -> {} to {}", req.method, dst);
        self.send_datagram(&req.to_bytes(), dst).await
    }

    async fn send_response(&self, resp: &SipResponse, dst: SocketAddr) -> bool {
        log::debug!("[vio] -> {} to {}", resp.status_code, dst);
        self.send_datagram(&resp.to_bytes(), dst).await
    }

    async fn send_datagram(&self, bytes: &[u8], dst: SocketAddr) -> bool {
        match self.sip.send_to(bytes, dst).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[vio] SIP send to {} failed: {}", dst, e);
                false
            }
        }
    }

    /// Stateless answer to `req`; final responses get a fresh To tag when they need one.
    async fn reply(&self, req: &SipRequest, code: u16, dst: SocketAddr) -> bool {
        let tag = generate_tag();
        let Some(builder) = response_from_request(req, code, Some(&tag)) else {
            log::warn!("[vio] cannot answer malformed {} from {}", req.method, dst);
            return false;
        };
        let mut builder = builder.header("User-Agent", USER_AGENT);
        if req.method == SipMethod::Options {
            builder = builder
                .header("Allow", ALLOW)
                .header("Accept", "application/sdp");
        }
        self.send_response(&builder.build(), dst).await
    }

    pub(super) async fn start_registration(&mut self) {
        let Some(client) = self.register.as_mut() else {
            return;
        };
        let req = client.start(Instant::now());
        let dst = client.target_addr();
        self.send_request(&req, dst).await;
    }

    /// Registration upkeep and call timers. An initial registration failure is fatal.
    pub(super) async fn on_sip_timer(&mut self) -> Result<()> {
        let now = Instant::now();
        if let Some(client) = self.register.as_mut() {
            if let Some(reason) = client.initial_failure(now) {
                bail!("SIP registration failed: {}", reason);
            }
            client.check_expired(now);
            let due = client.pop_due_request(now);
            let dst = client.target_addr();
            if let Some(req) = due {
                self.send_request(&req, dst).await;
            }
        }

        let Some(action) = self.call.as_mut().and_then(|call| call_timer(call, now)) else {
            return Ok(());
        };
        match action {
            TimerAction::Retransmit(resp, dst) => {
                self.send_response(&resp, dst).await;
            }
            TimerAction::AckTimeout => {
                log::warn!("[vio] no ACK for our 200 OK, hanging up");
                self.send_bye(now).await;
                self.finish_call("408");
            }
            TimerAction::InviteTimeout => {
                if let Some(call) = self.call.take() {
                    log::warn!("[vio] no final answer from {}", call.remote_uri);
                    if let Some(invite) = call.outgoing.as_ref().map(|o| &o.request) {
                        self.send_request(&cancel_for(invite), call.dialog.peer).await;
                    }
                    self.events.emit(VioEvent::RejectedCall {
                        remote_uri: call.remote_uri,
                    });
                }
            }
            TimerAction::HangupTimeout(code) => {
                log::warn!("[vio] no answer to our hangup");
                self.finish_call(code);
            }
        }
        Ok(())
    }

    async fn on_request(&mut self, req: SipRequest, src: SocketAddr) {
        match req.method {
            SipMethod::Invite => self.on_invite(req, src).await,
            SipMethod::Ack => self.on_ack(&req),
            SipMethod::Bye => self.on_bye(&req, src).await,
            SipMethod::Cancel => self.on_cancel(&req, src).await,
            SipMethod::Options => {
                self.reply(&req, 200, src).await;
            }
            _ => {
                self.reply(&req, 501, src).await;
            }
        }
    }

    async fn on_invite(&mut self, req: SipRequest, src: SocketAddr) {
        if let Some(call) = self.call.as_mut() {
            if !call.dialog.matches(&req) {
                log::info!("[vio] busy, refusing a second call from {}", src);
                self.reply(&req, 486, src).await;
                return;
            }
            let cseq = req.cseq().map_or(0, |(n, _)| n);
            if call.dialog.role == DialogRole::Uas && cseq <= call.dialog.remote_cseq {
                // retransmission of the INVITE we are answering
                if let Some(resp) = call.last_response.clone() {
                    self.send_response(&resp, src).await;
                }
                return;
            }
            call.dialog.remote_cseq = cseq;
            let ok = response_from_request(&req, 200, None).map(|b| {
                let b = b
                    .header("Contact", format!("<{}>", self.contact))
                    .header("User-Agent", USER_AGENT);
                match call.local_sdp.clone() {
                    Some(sdp) => b.body(sdp, "application/sdp"),
                    None => b,
                }
            });
            if let Some(ok) = ok {
                self.send_response(&ok.build(), src).await;
            }
            return;
        }

        self.reply(&req, 100, src).await;
        let remote_uri = req
            .header_value("From")
            .and_then(remote_uri_of)
            .unwrap_or_else(|| "unknown".to_string());

        if self.cfg.reject_calls {
            log::info!("[vio] rejecting call from {}", remote_uri);
            self.reply(&req, 486, src).await;
            self.events.emit(VioEvent::RejectedCall { remote_uri });
            return;
        }
        if self.blacklist.is_blocked(&remote_uri, SystemTime::now()) {
            log::info!("[vio] rejecting blacklisted caller {}", remote_uri);
            self.reply(&req, 486, src).await;
            self.events
                .emit(VioEvent::RejectedCallFromBlacklistedUri { remote_uri });
            return;
        }

        let negotiated = SessionDescription::parse(req.body_str()).and_then(|sd| {
            Some((
                sd.negotiate()?,
                sd.rtp_addr()?,
                sd.telephone_event.unwrap_or(TELEPHONE_EVENT_PT),
            ))
        });
        let Some((codec, remote_rtp, dtmf_pt)) = negotiated else {
            log::warn!("[vio] no acceptable codec offered by {}", remote_uri);
            self.reply(&req, 488, src).await;
            return;
        };

        let local_tag = generate_tag();
        let Some(dialog) = Dialog::from_invite(
            &req,
            src,
            &local_tag,
            self.contact.clone(),
            self.via_sent_by.clone(),
        ) else {
            self.reply(&req, 400, src).await;
            return;
        };

        let answer = sdp::build_answer(
            &self.cfg.advertised_ip,
            self.rtp_port,
            self.sdp_session_id,
            codec,
            dtmf_pt,
        );
        let contact = format!("<{}>", self.contact);
        let ringing = response_from_request(&req, 180, Some(&local_tag))
            .map(|b| b.header("Contact", contact.clone()).build());
        let ok = response_from_request(&req, 200, Some(&local_tag)).map(|b| {
            b.header("Contact", contact)
                .header("Allow", ALLOW)
                .header("User-Agent", USER_AGENT)
                .body(answer.clone(), "application/sdp")
                .build()
        });
        let (Some(ringing), Some(ok)) = (ringing, ok) else {
            return;
        };

        log::info!(
            "[vio] incoming call from {} codec={}",
            remote_uri,
            codec.encoding_name()
        );
        let mut call = Call::new(dialog, remote_uri.clone(), self.audio.samples_per_frame);
        call.media = Some(Media::new(remote_rtp, codec, dtmf_pt));
        self.events.emit(VioEvent::IncomingCall {
            remote_uri: remote_uri.clone(),
        });
        self.send_response(&ringing, src).await;

        call.phase = CallPhase::Connecting;
        call.connecting_sent = true;
        call.invite = Some(req);
        call.local_sdp = Some(answer);
        call.last_response = Some(ok.clone());
        call.retransmit = Some(Retransmit::new(Instant::now()));
        self.call = Some(call);
        self.events.emit(VioEvent::CallConnecting { remote_uri });
        if !self.send_response(&ok, src).await {
            self.finish_call("---");
        }
    }

    fn on_ack(&mut self, req: &SipRequest) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        if call.dialog.matches(req)
            && call.dialog.role == DialogRole::Uas
            && call.phase == CallPhase::Connecting
        {
            self.confirm_call();
        }
    }

    async fn on_bye(&mut self, req: &SipRequest, src: SocketAddr) {
        if !self.call.as_ref().is_some_and(|c| c.dialog.matches(req)) {
            self.reply(req, 481, src).await;
            return;
        }
        self.reply(req, 200, src).await;
        self.finish_call("200");
    }

    async fn on_cancel(&mut self, req: &SipRequest, src: SocketAddr) {
        let Some(call) = self.call.as_ref().filter(|c| c.dialog.matches(req)) else {
            self.reply(req, 481, src).await;
            return;
        };
        self.reply(req, 200, src).await;
        if call.dialog.role != DialogRole::Uas || call.phase == CallPhase::Confirmed {
            return;
        }
        let local_tag = tag_param(&call.dialog.local).map(str::to_string);
        let terminated = call
            .invite
            .as_ref()
            .and_then(|invite| response_from_request(invite, 487, local_tag.as_deref()))
            .map(|b| b.build());
        let peer = call.dialog.peer;
        if let Some(resp) = terminated {
            self.send_response(&resp, peer).await;
        }
        self.finish_call("487");
    }

    async fn on_response(&mut self, resp: SipResponse) {
        let now = Instant::now();
        if let Some(client) = self.register.as_mut() {
            if client.handle_response(&resp, now) {
                let pending = client.take_pending_request();
                let dst = client.target_addr();
                if let Some(req) = pending {
                    self.send_request(&req, dst).await;
                }
                return;
            }
        }

        let Some((_, method)) = resp.cseq() else {
            log::warn!("[vio] response without CSeq ignored");
            return;
        };
        let ours = self
            .call
            .as_ref()
            .is_some_and(|c| resp.call_id() == Some(c.dialog.call_id.as_str()));
        if !ours {
            log::warn!(
                "[vio] stray {} response to {} ignored",
                resp.status_code,
                method
            );
            return;
        }
        match method {
            SipMethod::Invite => self.on_invite_response(resp, now).await,
            SipMethod::Bye if resp.status_code >= 200 => {
                if self
                    .call
                    .as_ref()
                    .is_some_and(|c| c.phase == CallPhase::Disconnecting)
                {
                    self.finish_call(&resp.status_code.to_string());
                }
            }
            _ => {}
        }
    }

    async fn on_invite_response(&mut self, resp: SipResponse, now: Instant) {
        let code = resp.status_code;
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.dialog.role != DialogRole::Uac {
            return;
        }
        let remote_uri = call.remote_uri.clone();

        if resp.is_provisional() {
            if code >= 180 && call.phase == CallPhase::Ringing {
                call.phase = CallPhase::Connecting;
                call.connecting_sent = true;
                self.events.emit(VioEvent::CallConnecting { remote_uri });
            }
            return;
        }

        if resp.is_success() {
            call.dialog.update_from_response(&resp);
            let cseq = call
                .outgoing
                .as_ref()
                .map_or(call.dialog.local_cseq, |o| o.cseq);
            let ack = call.dialog.request_with_cseq(SipMethod::Ack, cseq).build();
            let peer = call.dialog.peer;
            let phase = call.phase;
            let cancelled = phase == CallPhase::Disconnecting && call.outgoing.is_some();
            if phase == CallPhase::Confirmed || (phase == CallPhase::Disconnecting && !cancelled) {
                // 2xx retransmission
                self.send_request(&ack, peer).await;
                return;
            }
            let media = SessionDescription::parse(resp.body_str()).and_then(|sd| {
                Some(Media::new(
                    sd.rtp_addr()?,
                    sd.negotiate()?,
                    sd.telephone_event.unwrap_or(TELEPHONE_EVENT_PT),
                ))
            });
            let announce_connecting = !call.connecting_sent;
            call.connecting_sent = true;
            call.outgoing = None;
            let usable = media.is_some();
            call.media = media;
            self.send_request(&ack, peer).await;

            if cancelled {
                // answered while our CANCEL was in flight
                self.send_bye(now).await;
                return;
            }
            if !usable {
                log::warn!("[vio] {} answered without a usable SDP", remote_uri);
                self.send_bye(now).await;
                self.call = None;
                self.events.emit(VioEvent::RejectedCall { remote_uri });
                return;
            }
            if announce_connecting {
                self.events.emit(VioEvent::CallConnecting { remote_uri });
            }
            self.confirm_call();
            return;
        }

        // final failure inside the INVITE transaction
        let Some(invite) = call.outgoing.as_ref().map(|o| o.request.clone()) else {
            return;
        };
        let peer = call.dialog.peer;
        let phase = call.phase;
        let ack = ack_for_failure(&invite, &resp);
        let retry = ChallengeKind::from_status(code)
            .filter(|_| phase != CallPhase::Disconnecting)
            .and_then(|kind| authenticated_invite(self.credentials.as_ref(), call, &resp, kind));
        self.send_request(&ack, peer).await;
        if let Some(retry) = retry {
            log::info!("[vio] answering {} challenge from {}", code, remote_uri);
            self.send_request(&retry, peer).await;
            return;
        }
        if phase == CallPhase::Disconnecting {
            self.finish_call(&code.to_string());
            return;
        }
        log::info!("[vio] call to {} failed with {}", remote_uri, code);
        self.call = None;
        self.events.emit(VioEvent::RejectedCall { remote_uri });
    }

    pub(super) async fn make_call(&mut self, destination: &str) {
        let uri = match self.policy.normalize(destination) {
            Destination::Uri(uri) => uri,
            Destination::Blocked => {
                log::info!("[vio] destination {} is blocked", destination);
                self.events.emit(VioEvent::BlockedUri {
                    remote_uri: destination.to_string(),
                });
                return;
            }
        };
        if self.call.is_some() {
            log::warn!("[vio] already in a call, not calling {}", uri);
            return;
        }
        let Some(parsed) = SipUri::parse(&uri) else {
            self.events.emit(VioEvent::BlockedUri {
                remote_uri: destination.to_string(),
            });
            return;
        };
        let remote_uri = parsed.address_of_record();
        let peer = match self.registrar {
            Some(addr) => addr,
            None => {
                let target = format!("{}:{}", parsed.host, parsed.port_or_default());
                match resolve(&target, 5060).await {
                    Ok(addr) => addr,
                    Err(e) => {
                        log::warn!("[vio] cannot reach {}: {:#}", uri, e);
                        self.events.emit(VioEvent::RejectedCall { remote_uri });
                        return;
                    }
                }
            }
        };

        let local = format!("<{}>;tag={}", self.local_aor, generate_tag());
        let dialog = Dialog::outgoing(
            generate_call_id(&self.cfg.advertised_ip),
            local,
            &uri,
            peer,
            self.contact.clone(),
            self.via_sent_by.clone(),
        );
        let offer = sdp::build_offer(&self.cfg.advertised_ip, self.rtp_port, self.sdp_session_id);
        let invite = dialog
            .request_with_cseq(SipMethod::Invite, 1)
            .header("Allow", ALLOW)
            .body(offer.clone(), "application/sdp")
            .build();

        let mut call = Call::new(dialog, remote_uri.clone(), self.audio.samples_per_frame);
        call.local_sdp = Some(offer);
        call.outgoing = Some(OutgoingInvite {
            request: invite.clone(),
            cseq: 1,
            auth_tried: false,
            deadline: Instant::now() + TRANSACTION_TIMEOUT,
        });
        self.call = Some(call);
        log::info!("[vio] calling {} via {}", uri, peer);
        if !self.send_request(&invite, peer).await {
            self.call = None;
            self.events.emit(VioEvent::RejectedCall { remote_uri });
        }
    }

    pub(super) async fn hangup(&mut self) {
        let now = Instant::now();
        let Some(call) = self.call.as_mut() else {
            log::info!("[vio] hangup without a call ignored");
            return;
        };
        match call.phase {
            CallPhase::Disconnecting => log::debug!("[vio] hangup already in progress"),
            _ if call.outgoing.is_none() => self.send_bye(now).await,
            _ => {
                let Some(invite) = call.outgoing.as_ref().map(|o| o.request.clone()) else {
                    return;
                };
                call.phase = CallPhase::Disconnecting;
                call.hangup_deadline = Some(now + HANGUP_TIMEOUT);
                let peer = call.dialog.peer;
                if !self.send_request(&cancel_for(&invite), peer).await {
                    self.finish_call("---");
                }
            }
        }
    }

    pub(super) async fn send_bye(&mut self, now: Instant) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let bye = call.dialog.request(SipMethod::Bye).build();
        let peer = call.dialog.peer;
        call.phase = CallPhase::Disconnecting;
        call.retransmit = None;
        call.hangup_deadline = Some(now + HANGUP_TIMEOUT);
        if !self.send_request(&bye, peer).await {
            self.finish_call("---");
        }
    }
}

fn call_timer(call: &mut Call, now: Instant) -> Option<TimerAction> {
    if call.phase == CallPhase::Disconnecting {
        let expired = call.hangup_deadline.is_some_and(|d| now >= d);
        let code = if call.outgoing.is_some() { "487" } else { "408" };
        return expired.then_some(TimerAction::HangupTimeout(code));
    }
    if let Some(outgoing) = call.outgoing.as_ref() {
        return (now >= outgoing.deadline).then_some(TimerAction::InviteTimeout);
    }
    let retransmit = call.retransmit.as_mut()?;
    if retransmit.expired(now) {
        return Some(TimerAction::AckTimeout);
    }
    if retransmit.poll(now) {
        let resp = call.last_response.clone()?;
        return Some(TimerAction::Retransmit(resp, call.dialog.peer));
    }
    None
}

/// The same INVITE again with digest credentials and the next CSeq, once per call.
fn authenticated_invite(
    credentials: Option<&Credentials>,
    call: &mut Call,
    resp: &SipResponse,
    kind: ChallengeKind,
) -> Option<SipRequest> {
    let credentials = credentials?;
    let outgoing = call.outgoing.as_mut()?;
    if outgoing.auth_tried {
        return None;
    }
    let challenge = resp
        .header_value(kind.challenge_header())
        .and_then(DigestChallenge::parse)?;
    let value = credentials.authorize("INVITE", &outgoing.request.uri, &challenge, 1)?;
    let cseq = outgoing.cseq + 1;
    let req = call
        .dialog
        .request_with_cseq(SipMethod::Invite, cseq)
        .header("Allow", ALLOW)
        .header(kind.credentials_header(), value)
        .body(outgoing.request.body.clone(), "application/sdp")
        .build();
    call.dialog.local_cseq = cseq;
    outgoing.request = req.clone();
    outgoing.cseq = cseq;
    outgoing.auth_tried = true;
    Some(req)
}

/// Copies the transaction identity of `invite` into a request of `method`.
fn same_transaction(invite: &SipRequest, method: SipMethod, to: Option<&str>) -> SipRequest {
    let cseq = invite.cseq().map_or(1, |(n, _)| n);
    let mut builder = SipRequestBuilder::new(method.clone(), invite.uri.clone());
    for name in ["Via", "From", "Call-ID"] {
        if let Some(value) = invite.header_value(name) {
            builder = builder.header(name, value);
        }
    }
    if let Some(to) = to.or_else(|| invite.header_value("To")) {
        builder = builder.header("To", to);
    }
    builder
        .header("Max-Forwards", "70")
        .header("CSeq", format!("{} {}", cseq, method))
        .header("User-Agent", USER_AGENT)
        .build()
}

fn ack_for_failure(invite: &SipRequest, resp: &SipResponse) -> SipRequest {
    same_transaction(invite, SipMethod::Ack, resp.header_value("To"))
}

fn cancel_for(invite: &SipRequest) -> SipRequest {
    same_transaction(invite, SipMethod::Cancel, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sip::SipHeader;

    fn invite() -> SipRequest {
        SipRequest {
            method: SipMethod::Invite,
            uri: "sip:1000@10.0.0.2".to_string(),
            version: "SIP/2.0".to_string(),
            headers: vec![
                SipHeader::new("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-abc"),
                SipHeader::new("From", "<sip:bot@10.0.0.1>;tag=ours"),
                SipHeader::new("To", "<sip:1000@10.0.0.2>"),
                SipHeader::new("Call-ID", "c1@10.0.0.1"),
                SipHeader::new("CSeq", "2 INVITE"),
            ],
            body: Vec::new(),
        }
    }

    #[test]
    fn cancel_keeps_branch_and_cseq_number() {
        let cancel = cancel_for(&invite());
        assert_eq!(cancel.method, SipMethod::Cancel);
        assert_eq!(cancel.uri, "sip:1000@10.0.0.2");
        assert_eq!(
            cancel.header_value("Via"),
            Some("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-abc")
        );
        assert_eq!(cancel.cseq(), Some((2, SipMethod::Cancel)));
        assert_eq!(cancel.to_tag(), None);
    }

    #[test]
    fn failure_ack_takes_to_tag_from_response() {
        let resp = SipResponse {
            version: "SIP/2.0".to_string(),
            status_code: 486,
            reason_phrase: "Busy Here".to_string(),
            headers: vec![SipHeader::new("To", "<sip:1000@10.0.0.2>;tag=theirs")],
            body: Vec::new(),
        };
        let ack = ack_for_failure(&invite(), &resp);
        assert_eq!(ack.cseq(), Some((2, SipMethod::Ack)));
        assert_eq!(ack.to_tag(), Some("theirs"));
        assert_eq!(ack.from_tag(), Some("ours"));
    }
}
