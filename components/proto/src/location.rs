use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Network identity of a meta or chunk server. A non-positive port means
/// "unset".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerLocation {
    pub host: String,
    pub port: i32,
}

impl ServerLocation {
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port > 0
    }

    pub fn reset(&mut self) {
        self.host.clear();
        self.port = -1;
    }
}

impl Display for ServerLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
