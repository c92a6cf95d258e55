use serde::{Deserialize, Serialize};

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

newtype_id!(UserId);
newtype_id!(ChatId);
newtype_id!(MessageId);
newtype_id!(ConnectionId);

impl MessageId {
    /// Time-ordered id, so `(created_at, id)` sorts the same way messages were accepted.
    pub fn new_v7() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Client-supplied idempotency key, validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.trim().is_empty() {
            return Err("idempotency key must not be empty".into());
        }
        if s.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(format!(
                "idempotency key too long (max {MAX_IDEMPOTENCY_KEY_LEN} characters)"
            ));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Read-only view of a chat's membership, fetched per operation.
#[derive(Debug, Clone)]
pub struct Membership {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub members: Vec<UserId>,
}

impl Membership {
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.members.iter().any(|m| m == user_id)
    }

    /// Everyone who is expected to read a message sent by `sender_id`.
    pub fn recipients_of(&self, sender_id: &UserId) -> impl Iterator<Item = &UserId> {
        self.members.iter().filter(move |m| *m != sender_id)
    }
}
