//! Session-authenticated call client.

use async_trait::async_trait;
use tracing::debug;

use super::{Caller, Transport, Value, XmlRpcTransport};
use crate::config::Config;
use crate::error::{Error, Result};

/// Client that prefixes every call with the session credential.
///
/// Holds no mutable state, so one instance can be shared by every reconciler.
pub struct SessionClient<T: Transport> {
    transport: T,
    session: String,
    username: String,
}

impl SessionClient<XmlRpcTransport> {
    /// Connect over XML-RPC using the endpoint and credentials from `config`.
    pub fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let transport = XmlRpcTransport::new(&config.endpoint, config.http_timeout)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> SessionClient<T> {
    pub fn new(transport: T, config: &Config) -> Self {
        Self {
            transport,
            session: config.session(),
            username: config.username.clone(),
        }
    }

    /// Interpret `[success, result_or_error]`.
    fn interpret(method: &str, response: Vec<Value>) -> Result<String> {
        let mut elements = response.into_iter();
        let (Some(flag), Some(payload)) = (elements.next(), elements.next()) else {
            return Err(Error::Decode(format!(
                "{method} returned fewer than two response elements"
            )));
        };

        let Value::Bool(success) = flag else {
            return Err(Error::Decode(format!(
                "{method} returned a non-boolean success flag: {flag}"
            )));
        };

        if !success {
            let message = match payload {
                Value::Str(s) => s,
                other => other.to_string(),
            };
            return Err(Error::RemoteRejected {
                method: method.to_string(),
                message,
            });
        }

        match payload {
            Value::Int(v) => Ok(v.to_string()),
            Value::Str(s) => Ok(s),
            Value::Bool(v) => Ok(v.to_string()),
        }
    }
}

#[async_trait]
impl<T: Transport> Caller for SessionClient<T> {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<String> {
        debug!(method, args = args.len(), "Calling remote service");

        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::Str(self.session.clone()));
        params.extend(args);

        let response = self.transport.invoke(method, &params).await?;
        Self::interpret(method, response)
    }

    fn username(&self) -> &str {
        &self.username
    }
}
