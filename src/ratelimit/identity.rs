//! Client identity resolution and whitelists.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::settings::Settings;
use crate::middleware::Credentials;

/// Identifier used when the transport address is not available.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Resolve the client IP for a request.
///
/// The proxy header is only consulted when `trust_proxy` is set; otherwise, or
/// when it yields nothing, the connection's remote address is used.
pub fn client_ip(request: &Parts, settings: &Settings) -> String {
    proxy_ip(request, settings)
        .or_else(|| {
            request
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

fn proxy_ip(request: &Parts, settings: &Settings) -> Option<String> {
    if !settings.trust_proxy {
        return None;
    }

    let value = request
        .headers
        .get(settings.proxy_header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())?;

    match &settings.get_ip_from_proxy_header {
        Some(extractor) => extractor.extract(value),
        None => value.split(',').next().map(|ip| ip.trim().to_string()),
    }
}

/// Resolve the authenticated user for a request.
///
/// Returns `None` for unauthenticated requests and when `user_attribute` does
/// not resolve inside the credentials. Numeric ids are rendered as strings so
/// they compare equal to whitelist entries of either type.
pub fn client_user(request: &Parts, settings: &Settings) -> Option<String> {
    let credentials = request.extensions.get::<Credentials>()?;
    reach(&credentials.0, &settings.user_attribute).and_then(identity_string)
}

/// Walk a dot-separated path through nested objects and arrays.
pub fn reach<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn identity_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Addresses and address ranges exempt from per-user limits.
///
/// Entries that parse as neither a network nor an address are matched as
/// exact strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct IpWhitelist {
    networks: Vec<IpNet>,
    literals: Vec<String>,
}

impl IpWhitelist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut whitelist = Self::default();
        for entry in entries {
            let entry = entry.into();
            let trimmed = entry.trim();
            if let Ok(network) = trimmed.parse::<IpNet>() {
                whitelist.networks.push(network);
            } else if let Some(host) = trimmed.parse::<IpAddr>().ok().and_then(host_network) {
                whitelist.networks.push(host);
            } else {
                whitelist.literals.push(entry);
            }
        }
        whitelist
    }

    /// Whether `ip` is covered by any entry.
    pub fn contains(&self, ip: &str) -> bool {
        if self.literals.iter().any(|literal| literal == ip) {
            return true;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) => self.networks.iter().any(|network| network.contains(&addr)),
            Err(_) => false,
        }
    }
}

fn host_network(addr: IpAddr) -> Option<IpNet> {
    match addr {
        IpAddr::V4(v4) => Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
        IpAddr::V6(v6) => Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
    }
}

impl From<Vec<String>> for IpWhitelist {
    fn from(entries: Vec<String>) -> Self {
        Self::new(entries)
    }
}

/// User identifiers exempt from per-user limits, compared as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserWhitelist(Vec<String>);

impl UserWhitelist {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self(users.into_iter().map(|user| user.to_string()).collect())
    }

    pub fn contains(&self, user: &str) -> bool {
        self.0.iter().any(|entry| entry == user)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUser {
    Text(String),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl RawUser {
    fn into_string(self) -> String {
        match self {
            RawUser::Text(s) => s,
            RawUser::Unsigned(n) => n.to_string(),
            RawUser::Signed(n) => n.to_string(),
            RawUser::Float(n) => n.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for UserWhitelist {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let users = Vec::<RawUser>::deserialize(deserializer)?;
        Ok(Self(users.into_iter().map(RawUser::into_string).collect()))
    }
}
