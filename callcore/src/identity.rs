use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest code accepted from the relay or the user.
pub const MAX_CODE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    Empty,
    TooLong(usize),
    InvalidChar(char),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Empty => write!(f, "user code is empty"),
            IdentityError::TooLong(len) => {
                write!(f, "user code is {len} chars long (max {MAX_CODE_LEN})")
            }
            IdentityError::InvalidChar(c) => write!(f, "user code contains invalid char {c:?}"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Short opaque code naming one endpoint, e.g. `AB12CD`.
///
/// Codes are compared byte-wise; that ordering is what breaks ties when both
/// sides offer at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserCode(String);

impl UserCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserCode {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.len() > MAX_CODE_LEN {
            return Err(IdentityError::TooLong(s.len()));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(IdentityError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for UserCode {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserCode> for String {
    fn from(code: UserCode) -> Self {
        code.0
    }
}

impl fmt::Display for UserCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
