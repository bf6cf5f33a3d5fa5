//! Connection and reconciliation settings.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use reqwest::Url;

use crate::error::{Error, Result};
use crate::poller::PollBudget;
use crate::resolver::MatchPolicy;

/// Default HTTP timeout for a single remote call.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings constructed once by the host and passed by reference to every component.
#[derive(Clone)]
pub struct Config {
    /// XML-RPC endpoint, e.g. `http://frontend:2633/RPC2`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub http_timeout: Duration,
    /// How a name shared by several objects is resolved.
    pub match_policy: MatchPolicy,
    /// Budget for waiting on asynchronously provisioned objects.
    pub budget: PollBudget,
    /// Per-kind budgets (keyed by kind label, e.g. `image`) replacing `budget`.
    pub kind_budgets: BTreeMap<String, PollBudget>,
}

impl Config {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            match_policy: MatchPolicy::default(),
            budget: PollBudget::default(),
            kind_budgets: BTreeMap::new(),
        }
    }

    /// Budget for objects of `kind`.
    pub fn budget_for(&self, kind: &str) -> PollBudget {
        self.kind_budgets.get(kind).copied().unwrap_or(self.budget)
    }

    /// Session credential sent as the first argument of every call.
    pub fn session(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }

    /// Check the settings without touching the network.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Validation(format!("invalid endpoint {:?}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "endpoint {:?} must use http or https",
                self.endpoint
            )));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Validation("username is required".to_string()));
        }
        self.budget.validate()?;
        self.kind_budgets.values().try_for_each(PollBudget::validate)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("http_timeout", &self.http_timeout)
            .field("match_policy", &self.match_policy)
            .field("budget", &self.budget)
            .field("kind_budgets", &self.kind_budgets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_joins_credentials() {
        let config = Config::new("http://one:2633/RPC2", "oneadmin", "pw");
        assert_eq!(config.session(), "oneadmin:pw");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_hides_password() {
        let config = Config::new("http://one:2633/RPC2", "oneadmin", "hunter2");
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn kind_budget_overrides_the_default() {
        let mut config = Config::new("http://one:2633/RPC2", "oneadmin", "pw");
        let slow = PollBudget {
            timeout: Duration::from_secs(3600),
            ..PollBudget::default()
        };
        config.kind_budgets.insert("image".to_string(), slow);

        assert_eq!(config.budget_for("image"), slow);
        assert_eq!(config.budget_for("network"), PollBudget::default());

        config.kind_budgets.insert(
            "network".to_string(),
            PollBudget {
                timeout: Duration::from_secs(60),
                poll_interval: Duration::ZERO,
                min_interval: Duration::ZERO,
            },
        );
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_bad_endpoint_and_empty_user() {
        assert!(matches!(
            Config::new("ftp://one/RPC2", "a", "b").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            Config::new("one:2633", "a", "b").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            Config::new("http://one:2633/RPC2", " ", "b").validate(),
            Err(Error::Validation(_))
        ));
    }
}
