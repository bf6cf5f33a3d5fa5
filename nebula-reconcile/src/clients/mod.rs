//! Clients for the remote virtualization-management service.
//!
//! - `Transport`: moves one method call over the wire and hands back the raw response array
//! - `Caller`: the narrow capability the reconcilers consume, `call(method, args) -> payload`
//! - `SessionClient`: a `Caller` that embeds the session credential and interprets the
//!   success flag

pub mod session;
pub mod xmlrpc;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

pub use session::SessionClient;
pub use xmlrpc::XmlRpcTransport;

/// Primitive call argument or response element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// Wire-level call primitive. Implementations perform no retries.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Invoke `method` and return the elements of the response array.
    async fn invoke(&self, method: &str, params: &[Value]) -> Result<Vec<Value>>;
}

/// Authenticated request/response capability shared by all reconcilers.
#[async_trait]
pub trait Caller: Send + Sync {
    /// Call `method`; the payload is the decimal id or the returned document.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<String>;

    /// Name of the user the session acts as.
    fn username(&self) -> &str;
}
