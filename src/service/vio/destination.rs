use regex::Regex;

use crate::protocol::sip::uri::SipUri;
use crate::shared::config::VioConfig;
use crate::shared::error::ConfigError;

const PHONE_NUMBER_PATTERN: &str = r"^\+?[0-9]{1,12}$";
const SIP_URI_PATTERN: &str = r"sip:[a-zA-Z0-9_\.]+@[a-zA-Z0-9_\.]+(:[0-9]{1,4})?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Uri(String),
    Blocked,
}

/// Allow/deny rules applied to `make_call` destinations.
#[derive(Debug, Clone)]
pub struct DestinationPolicy {
    phone_number: Regex,
    sip_uri: Regex,
    domain: String,
    allowed_phone_numbers: Option<Regex>,
    forbidden_phone_numbers: Option<Regex>,
    allowed_users: Option<Regex>,
    forbidden_users: Option<Regex>,
    allowed_hosts: Option<Regex>,
    forbidden_hosts: Option<Regex>,
}

fn passes(value: &str, allowed: Option<&Regex>, forbidden: Option<&Regex>) -> bool {
    allowed.map_or(true, |re| re.is_match(value)) && !forbidden.is_some_and(|re| re.is_match(value))
}

impl DestinationPolicy {
    pub fn from_config(cfg: &VioConfig) -> Result<Self, ConfigError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                key: "builtin".to_string(),
                source,
            })
        };
        Ok(Self {
            phone_number: compile(PHONE_NUMBER_PATTERN)?,
            sip_uri: compile(SIP_URI_PATTERN)?,
            domain: cfg.domain.clone(),
            allowed_phone_numbers: cfg.allowed_phone_numbers.clone(),
            forbidden_phone_numbers: cfg.forbidden_phone_numbers.clone(),
            allowed_users: cfg.allowed_users.clone(),
            forbidden_users: cfg.forbidden_users.clone(),
            allowed_hosts: cfg.allowed_hosts.clone(),
            forbidden_hosts: cfg.forbidden_hosts.clone(),
        })
    }

    /// Turns a phone number or a string holding a SIP URI into a plain SIP URI.
    ///
    /// Phone numbers become `sip:<digits>@<domain>`. Anything that is neither, or that a rule
    /// refuses, is [`Destination::Blocked`].
    pub fn normalize(&self, destination: &str) -> Destination {
        let destination = destination.trim();
        if self.phone_number.is_match(destination) {
            if passes(
                destination,
                self.allowed_phone_numbers.as_ref(),
                self.forbidden_phone_numbers.as_ref(),
            ) {
                return Destination::Uri(format!("sip:{}@{}", destination, self.domain));
            }
            return Destination::Blocked;
        }
        let Some(found) = self.sip_uri.find(destination) else {
            return Destination::Blocked;
        };
        let Some(uri) = SipUri::parse(found.as_str()) else {
            return Destination::Blocked;
        };
        let user = uri.user.as_deref().unwrap_or_default();
        if passes(user, self.allowed_users.as_ref(), self.forbidden_users.as_ref())
            && passes(&uri.host, self.allowed_hosts.as_ref(), self.forbidden_hosts.as_ref())
        {
            Destination::Uri(found.as_str().to_string())
        } else {
            Destination::Blocked
        }
    }
}
