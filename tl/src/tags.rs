//! Message tags shared by the coordinator and the workers
//!
//! The control channel only ever carries the reserved tags below. Protocols
//! allocate their own tags from [`Tag::FIRST_PROTOCOL`] upwards and use them on
//! their own channels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// First tag value available to applications on top of the transport
const FIRST_APPLICATION_TAG: u32 = 100;

/// A message tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag(pub u32);

impl Tag {
    /// Worker must leave its receive loop / shutdown acknowledgement
    pub const EXIT: Tag = Tag(FIRST_APPLICATION_TAG);
    /// Channel announcement (count on the control channel, notification on new channels)
    pub const STREAM: Tag = Tag(FIRST_APPLICATION_TAG + 1);
    /// Protocol identifier being dispatched
    pub const PROTOCOL_ID: Tag = Tag(FIRST_APPLICATION_TAG + 2);
    /// Acknowledgement carrying a count
    pub const ACK: Tag = Tag(FIRST_APPLICATION_TAG + 3);
    /// Wildcard: accept whatever tag arrives
    pub const ANY: Tag = Tag(FIRST_APPLICATION_TAG + 4);

    /// First tag protocols may use for their own messages
    pub const FIRST_PROTOCOL: Tag = Tag(FIRST_APPLICATION_TAG + 5);

    /// The n-th protocol tag
    pub const fn protocol(n: u32) -> Tag {
        Tag(Self::FIRST_PROTOCOL.0 + n)
    }

    /// Whether this tag belongs to the reserved control range
    pub fn is_reserved(self) -> bool {
        (Self::EXIT.0..Self::FIRST_PROTOCOL.0).contains(&self.0)
    }

    /// Whether a received tag satisfies an expectation (ANY matches everything)
    pub fn accepts(self, received: Tag) -> bool {
        self == Tag::ANY || self == received
    }

    fn name(self) -> Option<&'static str> {
        match self {
            Tag::EXIT => Some("EXIT"),
            Tag::STREAM => Some("STREAM"),
            Tag::PROTOCOL_ID => Some("PROTOCOL_ID"),
            Tag::ACK => Some("ACK"),
            Tag::ANY => Some("ANY"),
            _ => None,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}
