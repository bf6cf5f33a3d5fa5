//! Permission codec.
//!
//! The remote service stores permissions as nine flags: use, manage and admin
//! for each of owner, group and other. Users write them as three octal-like
//! digits (`"640"`), one per scope, each digit being `use*4 + manage*2 + admin`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::clients::{Caller, Value};
use crate::error::{Error, Result};

/// use/manage/admin flags for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rights {
    pub use_: bool,
    pub manage: bool,
    pub admin: bool,
}

impl Rights {
    pub const NONE: Rights = Rights {
        use_: false,
        manage: false,
        admin: false,
    };

    fn from_digit(d: u8) -> Self {
        Self {
            use_: d & 4 != 0,
            manage: d & 2 != 0,
            admin: d & 1 != 0,
        }
    }

    fn digit(self) -> u8 {
        (u8::from(self.use_) << 2) | (u8::from(self.manage) << 1) | u8::from(self.admin)
    }
}

/// Fully specified permission set. An absent flag is `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PermissionSet {
    pub owner: Rights,
    pub group: Rights,
    pub other: Rights,
}

impl PermissionSet {
    /// Build a set from its nine flags in wire order.
    pub fn from_flags(flags: [bool; 9]) -> Self {
        let [ou, om, oa, gu, gm, ga, xu, xm, xa] = flags;
        Self {
            owner: Rights {
                use_: ou,
                manage: om,
                admin: oa,
            },
            group: Rights {
                use_: gu,
                manage: gm,
                admin: ga,
            },
            other: Rights {
                use_: xu,
                manage: xm,
                admin: xa,
            },
        }
    }

    /// The nine flags in wire order: owner, group, other; each use, manage, admin.
    pub fn flags(&self) -> [bool; 9] {
        [
            self.owner.use_,
            self.owner.manage,
            self.owner.admin,
            self.group.use_,
            self.group.manage,
            self.group.admin,
            self.other.use_,
            self.other.manage,
            self.other.admin,
        ]
    }

    /// Nine discrete integer arguments, as the chmod calls expect them.
    pub fn to_rpc_args(&self) -> Vec<Value> {
        self.flags()
            .iter()
            .map(|&f| Value::Int(i64::from(f)))
            .collect()
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.owner.digit(),
            self.group.digit(),
            self.other.digit()
        )
    }
}

impl FromStr for PermissionSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        let [owner, group, other] = bytes else {
            return Err(Error::Validation(format!(
                "permissions {s:?} must specify 3 permission sets: owner-group-other"
            )));
        };

        let digit = |b: u8| match b {
            b'0'..=b'7' => Ok(b - b'0'),
            _ => Err(Error::Validation(format!(
                "each character in permissions {s:?} must be a digit from 0 to 7"
            ))),
        };

        Ok(Self {
            owner: Rights::from_digit(digit(*owner)?),
            group: Rights::from_digit(digit(*group)?),
            other: Rights::from_digit(digit(*other)?),
        })
    }
}

impl Serialize for PermissionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PermissionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Issue one chmod call for `id`. Associated objects are never cascaded.
pub async fn apply_permissions(
    client: &dyn Caller,
    method: &str,
    id: i64,
    permissions: &PermissionSet,
) -> Result<String> {
    debug!(id, method, permissions = %permissions, "Applying permissions");

    let mut args = Vec::with_capacity(11);
    args.push(Value::Int(id));
    args.extend(permissions.to_rpc_args());
    // recursive: leave associated images alone
    args.push(Value::Bool(false));

    client.call(method, args).await
}
