use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        branded_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConnectionId, "conn");
branded_id!(SessionId, "lace");
branded_id!(ProjectId, "proj");
branded_id!(TaskId, "task");
// Derived from the owning session; see `ThreadId::for_agent`.
branded_id!(ThreadId);

impl ThreadId {
    /// Thread (and agent) IDs are `<sessionId>.<n>`; the session is everything
    /// before the last dot. Returns `None` when there is no dot or either side
    /// is empty.
    pub fn session_id(&self) -> Option<SessionId> {
        let (session, index) = self.0.rsplit_once('.')?;
        if session.is_empty() || index.is_empty() {
            return None;
        }
        Some(SessionId::from_raw(session))
    }

    /// Build the thread ID of the `n`th agent in a session.
    pub fn for_agent(session_id: &SessionId, n: u32) -> Self {
        Self(format!("{}.{}", session_id, n))
    }
}
