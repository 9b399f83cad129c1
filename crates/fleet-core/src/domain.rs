use std::{fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::PairingError;

/// Longest phone number accepted for pairing (E.164 upper bound).
pub const MAX_PHONE_DIGITS: usize = 15;

/// Canonical phone-number identity of a session (digits only).
///
/// This is the key for every per-session table: live sessions, settings and
/// identity records.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Canonicalize a user-supplied phone number.
    ///
    /// Strips `+`, whitespace, dashes, dots and parentheses, then requires the
    /// remainder to be digits only with a length in `min_digits..=15`.
    pub fn parse_phone(raw: &str, min_digits: usize) -> Result<Self, PairingError> {
        let cleaned: String = raw
            .chars()
            .filter(|c| !matches!(c, '+' | '-' | '.' | '(' | ')') && !c.is_whitespace())
            .collect();

        if !digits_re().is_match(&cleaned) {
            return Err(PairingError::InvalidFormat(format!(
                "{raw:?} must contain only digits after removing +, spaces and dashes"
            )));
        }
        if cleaned.len() < min_digits || cleaned.len() > MAX_PHONE_DIGITS {
            return Err(PairingError::InvalidFormat(format!(
                "{raw:?} must have between {min_digits} and {MAX_PHONE_DIGITS} digits"
            )));
        }
        Ok(Self(cleaned))
    }

    /// Lenient form for operator input: drops any server or device suffix,
    /// then keeps only the digits. `None` when no digit is left.
    pub fn from_loose(raw: &str) -> Option<Self> {
        let digits: String = normalize_id(raw)
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        (!digits.is_empty()).then_some(Self(digits))
    }

    /// The session id owning a (primary) address: its bare identifier.
    pub fn from_address(addr: &Address) -> Self {
        Self(addr.user.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The session's primary address in the phone namespace.
    pub fn primary_address(&self) -> Address {
        Address::phone(self.0.clone())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]+$").expect("valid regex"))
}

/// Address namespace marker (the part after `@`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Direct phone-number addresses.
    Phone,
    /// Linked-device alias addresses (LID).
    Lid,
    Group,
    Broadcast,
    Other(String),
}

impl Namespace {
    pub fn from_server(server: &str) -> Self {
        match server {
            "s.whatsapp.net" | "c.us" => Self::Phone,
            "lid" => Self::Lid,
            "g.us" => Self::Group,
            "broadcast" => Self::Broadcast,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn server(&self) -> &str {
        match self {
            Self::Phone => "s.whatsapp.net",
            Self::Lid => "lid",
            Self::Group => "g.us",
            Self::Broadcast => "broadcast",
            Self::Other(s) => s,
        }
    }
}

/// A protocol address: `user[:device]@server`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub user: String,
    pub device: Option<u16>,
    pub namespace: Namespace,
}

impl Address {
    pub fn phone(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: None,
            namespace: Namespace::Phone,
        }
    }

    pub fn lid(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: None,
            namespace: Namespace::Lid,
        }
    }

    pub fn with_device(mut self, device: u16) -> Self {
        self.device = Some(device);
        self
    }

    /// Bare identifier: no device suffix, no namespace.
    pub fn bare(&self) -> &str {
        &self.user
    }

    pub fn is_alias(&self) -> bool {
        self.namespace == Namespace::Lid
    }

    pub fn is_group(&self) -> bool {
        self.namespace == Namespace::Group
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.namespace == Namespace::Broadcast && self.user == "status"
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(d) => write!(f, "{}:{}@{}", self.user, d, self.namespace.server()),
            None => write!(f, "{}@{}", self.user, self.namespace.server()),
        }
    }
}

impl FromStr for Address {
    type Err = String;

    /// Parse `user[:device][@server]`. A missing server means the phone namespace.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (local, server) = match raw.rsplit_once('@') {
            Some((l, s)) => (l, s),
            None => (raw, "s.whatsapp.net"),
        };

        let (user, device) = match local.split_once(':') {
            Some((u, d)) => {
                let device = d
                    .parse::<u16>()
                    .map_err(|_| format!("invalid device suffix in address {raw:?}"))?;
                (u, Some(device))
            }
            None => (local, None),
        };

        if user.is_empty() {
            return Err(format!("empty user in address {raw:?}"));
        }
        if server.is_empty() {
            return Err(format!("empty server in address {raw:?}"));
        }

        Ok(Self {
            user: user.to_string(),
            device,
            namespace: Namespace::from_server(server),
        })
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// Strip the device suffix and namespace from a raw address string.
///
/// `"12345:7@lid"` and `"12345@lid"` both normalize to `"12345"`.
pub fn normalize_id(raw: &str) -> &str {
    let raw = raw.trim();
    let no_server = raw.split('@').next().unwrap_or(raw);
    no_server.split(':').next().unwrap_or(no_server)
}
