//! Client tokens correlating requests with their responses.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque request token, echoed back by the services as `clientToken`.
///
/// Generated tokens are the simple (hyphen-free) form of a v4 UUID: 32
/// characters, well under the service limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(String);

impl ClientToken {
    pub fn generate() -> Self {
        ClientToken(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for ClientToken {
    fn from(value: String) -> Self {
        ClientToken(value)
    }
}

impl From<&str> for ClientToken {
    fn from(value: &str) -> Self {
        ClientToken(value.to_string())
    }
}

impl AsRef<str> for ClientToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
