//! Identity and session key types
//!
//! Every persisted entity is keyed by a UUID. The newtypes below keep step,
//! bot and credential identities from being mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identity
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Derive a stable identity from a namespace and a human key
            pub fn derived(namespace: &Uuid, key: &str) -> Self {
                Self(Uuid::new_v5(namespace, key.as_bytes()))
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identity of a bot, the owner of a step graph
    BotId
);
uuid_id!(
    /// Identity of a step within a bot's graph
    StepId
);
uuid_id!(
    /// Identity of a directed connection between two steps
    ConnectionId
);
uuid_id!(
    /// Identity of an emitter binding
    EmitterId
);
uuid_id!(
    /// Identity of a recurrence spec
    RecurrenceId
);
uuid_id!(
    /// Identity of an encrypted credential
    CredentialId
);
uuid_id!(
    /// Identity of a subscriber (end user) talking to a bot
    SubscriberId
);
uuid_id!(
    /// Identity of the channel a conversation happens on
    ChannelId
);

/// Key of one logical session: one per (subscriber, bot, channel) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub subscriber: SubscriberId,
    pub bot: BotId,
    pub channel: ChannelId,
}

impl SessionKey {
    pub fn new(subscriber: SubscriberId, bot: BotId, channel: ChannelId) -> Self {
        Self {
            subscriber,
            bot,
            channel,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subscriber, self.bot, self.channel)
    }
}

/// Connection labels with engine-level meaning
pub mod labels {
    /// Outcome of a conditional preset whose predicate holds
    pub const TRUE: &str = "true";

    /// Outcome of a conditional preset whose predicate fails
    pub const FALSE: &str = "false";

    /// Followed by request steps when the outbound call fails
    pub const ERROR: &str = "error";

    /// Fallback outcome of the switch preset
    pub const DEFAULT: &str = "default";
}
