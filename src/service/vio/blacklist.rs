use std::collections::HashMap;
use std::time::SystemTime;

use crate::protocol::sip::uri::SipUri;

/// Callers refused until a wall-clock expiry, keyed by the user part of their URI.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashMap<String, SystemTime>,
}

fn key_of(remote_uri: &str) -> String {
    SipUri::parse(remote_uri)
        .and_then(|uri| uri.user)
        .unwrap_or_else(|| remote_uri.to_string())
}

impl Blacklist {
    /// Repeated insertion keeps the later expiry.
    pub fn insert(&mut self, remote_uri: &str, expire: SystemTime) {
        let entry = self.entries.entry(key_of(remote_uri)).or_insert(expire);
        if expire > *entry {
            *entry = expire;
        }
    }

    pub fn is_blocked(&self, remote_uri: &str, now: SystemTime) -> bool {
        self.expiry(remote_uri).is_some_and(|expire| now < expire)
    }

    pub fn expiry(&self, remote_uri: &str) -> Option<SystemTime> {
        self.entries.get(&key_of(remote_uri)).copied()
    }

    pub fn prune(&mut self, now: SystemTime) {
        self.entries.retain(|_, expire| now < *expire);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn blocks_until_expiry() {
        let now = SystemTime::now();
        let mut list = Blacklist::default();
        list.insert("sip:bad@10.0.0.1", now + Duration::from_secs(60));
        assert!(list.is_blocked("sip:bad@10.0.0.1", now));
        // same caller behind another proxy
        assert!(list.is_blocked("sip:bad@pbx.example.com", now));
        assert!(!list.is_blocked("sip:bad@10.0.0.1", now + Duration::from_secs(60)));
        assert!(!list.is_blocked("sip:good@10.0.0.1", now));
    }

    #[test]
    fn insertion_keeps_latest_expiry() {
        let now = SystemTime::now();
        let mut list = Blacklist::default();
        list.insert("sip:bad@h", now + Duration::from_secs(120));
        list.insert("sip:bad@h", now + Duration::from_secs(30));
        list.insert("sip:bad@h", now + Duration::from_secs(30));
        assert_eq!(list.len(), 1);
        assert_eq!(list.expiry("sip:bad@h"), Some(now + Duration::from_secs(120)));
    }

    #[test]
    fn prune_drops_expired() {
        let now = SystemTime::now();
        let mut list = Blacklist::default();
        list.insert("sip:a@h", now);
        list.insert("sip:b@h", now + Duration::from_secs(5));
        list.prune(now);
        assert_eq!(list.len(), 1);
    }
}
