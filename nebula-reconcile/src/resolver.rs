//! Identity resolution.
//!
//! The only stable key is the numeric id, which the caller may not know yet
//! (first run) or may hold stale (object deleted out of band). A known id is
//! tried first; otherwise the caller's own pool is scanned by name, which acts
//! as a de facto compound key of (owner, name).

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clients::{Caller, Value};
use crate::document::{self, ObservedObject};
use crate::error::{Error, Result};

/// Pool filter selecting only objects owned by the session user.
pub const POOL_FILTER_MINE: i64 = -3;

/// How to treat several objects sharing the requested name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Fail with `AmbiguousMatch`.
    #[default]
    RejectAmbiguous,
    /// Take the first entry in pool order and log a warning.
    FirstMatch,
}

/// Locates the authoritative remote object for a (maybe-id, name) pair.
pub struct Resolver<'a> {
    client: &'a dyn Caller,
    kind: &'static str,
    info_call: &'static str,
    pool_call: &'static str,
    element: &'static str,
    policy: MatchPolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(
        client: &'a dyn Caller,
        kind: &'static str,
        info_call: &'static str,
        pool_call: &'static str,
        element: &'static str,
        policy: MatchPolicy,
    ) -> Self {
        Self {
            client,
            kind,
            info_call,
            pool_call,
            element,
            policy,
        }
    }

    async fn by_id(&self, id: i64) -> Result<ObservedObject> {
        let body = self
            .client
            .call(self.info_call, vec![Value::Int(id), Value::Bool(false)])
            .await?;
        document::decode_one(&body, self.element)
    }

    async fn by_name(&self, name: &str) -> Result<Option<ObservedObject>> {
        // mine, no start/end id bounds
        let body = self
            .client
            .call(
                self.pool_call,
                vec![
                    Value::Int(POOL_FILTER_MINE),
                    Value::Int(-1),
                    Value::Int(-1),
                ],
            )
            .await?;
        let pool = document::decode_pool(&body, self.element)?;

        let mut matches = pool.into_iter().filter(|o| o.name == name);
        let Some(first) = matches.next() else {
            return Ok(None);
        };
        let others: Vec<i64> = matches.map(|o| o.id).collect();
        if others.is_empty() {
            return Ok(Some(first));
        }

        let mut ids = vec![first.id];
        ids.extend(others);
        match self.policy {
            MatchPolicy::RejectAmbiguous => Err(Error::AmbiguousMatch {
                kind: self.kind,
                name: name.to_string(),
                ids,
            }),
            MatchPolicy::FirstMatch => {
                warn!(
                    kind = self.kind,
                    name,
                    ?ids,
                    "Several objects share this name, using the first"
                );
                Ok(Some(first))
            }
        }
    }

    /// Resolve the object, `Ok(None)` meaning it does not exist.
    ///
    /// A failed lookup by id is not fatal: the id may be stale, so the name
    /// scan runs instead. Only failures of the pool listing itself propagate.
    pub async fn resolve(&self, known_id: Option<i64>, name: &str) -> Result<Option<ObservedObject>> {
        if let Some(id) = known_id {
            match self.by_id(id).await {
                Ok(obj) => return Ok(Some(obj)),
                Err(e) => {
                    debug!(kind = self.kind, id, error = %e, "Could not find object by id");
                }
            }
        }

        let found = self.by_name(name).await?;
        if found.is_none() {
            debug!(
                kind = self.kind,
                name,
                user = self.client.username(),
                "Could not find object by name"
            );
        }
        Ok(found)
    }
}
