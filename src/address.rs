use std::fmt;
use std::net::Ipv6Addr;

use url::{Host, Url};

use crate::transport::Credentials;

pub const DEFAULT_PORT: u16 = 1883;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Empty broker address")]
    Empty,
    #[error("Unsupported scheme = {0}")]
    UnknownScheme(String),
    #[error("Malformed url = {0}")]
    Malformed(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ssl,
    Ws,
}

impl Scheme {
    fn from_prefix(prefix: &str) -> Result<Scheme, AddressError> {
        match prefix.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Scheme::Tcp),
            "ssl" => Ok(Scheme::Ssl),
            "ws" => Ok(Scheme::Ws),
            _ => Err(AddressError::UnknownScheme(prefix.to_owned())),
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
            Scheme::Ws => "ws",
        }
    }
}

/// Broker address in its normalized `scheme://host:port[/path]` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: Scheme,
    host: Host<String>,
    pub port: u16,
    /// path and query, empty for plain brokers
    pub path: String,
    /// user info embedded in the url. Not part of the normalized form
    pub credentials: Option<Credentials>,
}

impl Address {
    /// Parses a user supplied broker address. A missing scheme defaults to
    /// `tcp://` and a missing port to 1883.
    pub fn parse(input: &str) -> Result<Address, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Empty);
        }

        let (scheme, rest) = match input.split_once("://") {
            Some((prefix, rest)) => (Scheme::from_prefix(prefix)?, rest),
            None if input.parse::<Ipv6Addr>().is_ok() => {
                return Address::parse(&format!("tcp://[{}]", input))
            }
            None => (Scheme::Tcp, input),
        };

        // Parsed under one non special scheme so that explicit ports equal to
        // a scheme default (ws and 80) are not dropped by the url crate
        let url = Url::parse(&format!("tcp://{}", rest))?;
        let host = match url.host() {
            None | Some(Host::Domain("")) => return Err(AddressError::Empty),
            Some(host) => host.to_owned(),
        };

        let credentials = match url.username() {
            "" => None,
            username => Some(Credentials {
                username: username.to_owned(),
                password: url.password().unwrap_or_default().to_owned(),
            }),
        };

        let mut path = url.path().to_owned();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Address {
            scheme,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            path,
            credentials,
        })
    }

    /// Host to open the socket to, ipv6 literals without brackets
    pub fn host(&self) -> String {
        match &self.host {
            Host::Ipv6(ip) => ip.to_string(),
            host => host.to_string(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme.prefix(),
            self.host,
            self.port,
            self.path
        )
    }
}

/// Normalizes a broker address to the key used by the connection registry
pub fn normalize(input: &str) -> Result<String, AddressError> {
    Address::parse(input).map(|address| address.to_string())
}
