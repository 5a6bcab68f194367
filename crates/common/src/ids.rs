use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Ordering follows the canonical hyphenated string form, so sorting ids
/// is the same as sorting them lexically.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identifier of a ticket document.
    TicketId
);

uuid_id!(
    /// Identifier of an admission event (the thing tickets grant entry to).
    EventId
);

uuid_id!(
    /// Identifier of a pending or settled ownership transfer.
    TransferId
);

/// Identifier of a user as issued by the identity provider.
///
/// User ids are opaque strings; the ledger never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Idempotency key of a fulfillment: the payment or order reference that
/// settled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FulfillmentKey(String);

impl FulfillmentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FulfillmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FulfillmentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FulfillmentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_id_new_creates_unique_ids() {
        let id1 = TicketId::new();
        let id2 = TicketId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn ticket_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = TicketId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn uuid_ids_order_like_their_string_form() {
        let mut ids: Vec<TicketId> = (0..32).map(|_| TicketId::new()).collect();
        ids.sort();
        let strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut sorted = strings.clone();
        sorted.sort();
        assert_eq!(strings, sorted);
    }

    #[test]
    fn event_id_parses_from_string() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }

    #[test]
    fn user_id_serializes_transparently() {
        let id = UserId::new("uid_123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"uid_123\"");
    }

    #[test]
    fn fulfillment_key_displays_raw_value() {
        let key = FulfillmentKey::from("pi_1");
        assert_eq!(key.to_string(), "pi_1");
        assert_eq!(key.as_str(), "pi_1");
    }
}
