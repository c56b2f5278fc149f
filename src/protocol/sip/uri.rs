use std::fmt;

/// The parts of a `sip:` URI the user agent routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    /// Parses `sip:[user[:password]@]host[:port][;params][?headers]`.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let rest = input
            .strip_prefix("sip:")
            .or_else(|| input.strip_prefix("sips:"))?;
        let rest = rest.split(['?', ';']).next().unwrap_or(rest);
        let (user, hostport) = match rest.rsplit_once('@') {
            Some((user, hostport)) => {
                let user = user.split(':').next().unwrap_or(user);
                (Some(user.to_string()), hostport)
            }
            None => (None, rest),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
            None => (hostport, None),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            user: user.filter(|u| !u.is_empty()),
            host: host.to_string(),
            port,
        })
    }

    /// `sip:user@host` without port or parameters, the form used to key calls.
    pub fn address_of_record(&self) -> String {
        match &self.user {
            Some(user) => format!("sip:{}@{}", user, self.host),
            None => format!("sip:{}", self.host),
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// The URI inside a name-addr (`"Bob" <sip:bob@h>;tag=x`) or addr-spec header value.
pub fn uri_of_name_addr(value: &str) -> &str {
    if let Some(start) = value.find('<') {
        if let Some(len) = value[start + 1..].find('>') {
            return value[start + 1..start + 1 + len].trim();
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// `sip:user@host` of the party named in a From/To/Contact header.
pub fn remote_uri_of(value: &str) -> Option<String> {
    SipUri::parse(uri_of_name_addr(value)).map(|u| u.address_of_record())
}
