//! Core identifier types for vmplane.
//!
//! This module provides strongly-typed identifiers for owners, VMs, backup
//! jobs and schedules, and alert rules and their history records.
//! All IDs are designed for efficient storage and lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a 32-byte identifier shown and serialized as lowercase hex.
macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create the identifier from raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Parse the identifier from 64 hex characters.
            ///
            /// # Errors
            ///
            /// Returns an error if the string is not valid hex or not exactly 64 characters.
            pub fn from_hex(s: &str) -> Result<Self, IdError> {
                decode_hex_32(s).map(Self)
            }

            /// Return the underlying bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Return the hex-encoded string representation.
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::from_hex(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_hex()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

hex_id!(
    /// Owner of a VM, as issued by the identity provider in front of the REST layer.
    OwnerId
);

hex_id!(
    /// A VM, derived by hashing its owner, name and creation time with blake3.
    VmId
);

impl VmId {
    /// Generate a new unique `VmId` from the owner, name, and current time.
    #[must_use]
    pub fn generate(owner_id: &OwnerId, name: &str) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self::hash_parts(owner_id, name, &nanos.to_le_bytes())
    }

    /// Generate a reproducible `VmId` for tests.
    #[must_use]
    pub fn generate_deterministic(owner_id: &OwnerId, name: &str, seed: u64) -> Self {
        Self::hash_parts(owner_id, name, &seed.to_le_bytes())
    }

    fn hash_parts(owner_id: &OwnerId, name: &str, salt: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(owner_id.as_bytes());
        hasher.update(name.as_bytes());
        hasher.update(salt);
        Self(*hasher.finalize().as_bytes())
    }

    /// Short prefix of the hex form, used in file and domain names.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

fn decode_hex_32(s: &str) -> Result<[u8; 32], IdError> {
    let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
    bytes.try_into().map_err(|_| IdError::InvalidLength {
        expected: 32,
        got: s.len() / 2,
    })
}

/// Declares a UUID-backed identifier with string serde and parsing.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create the identifier from a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Return the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }

            /// Return the bytes of the UUID.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
                Ok(Self(uuid))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single backup execution record.
    BackupJobId
);

uuid_id!(
    /// Identifier of a recurring backup schedule.
    BackupScheduleId
);

uuid_id!(
    /// Identifier of an alert rule.
    AlertRuleId
);

uuid_id!(
    /// Identifier of a fired alert occurrence.
    AlertHistoryId
);

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string contains invalid hexadecimal characters.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The input has an incorrect length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// The expected number of bytes.
        expected: usize,
        /// The actual number of bytes.
        got: usize,
    },

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}
