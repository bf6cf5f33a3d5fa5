//! Reconcilers for the remote object kinds.
//!
//! One generic `Reconciler` drives create/read/update/delete for every kind.
//! A `ResourceKind` supplies only what differs: call names, document tag,
//! how the allocate body and arguments are built, whether creation has an
//! asynchronous ready phase, and any nested calls after allocation.

pub mod image;
pub mod network;
pub mod template;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clients::{Caller, Value};
use crate::config::Config;
use crate::document::{ObjectRef, ObservedObject};
use crate::error::{Error, Result};
use crate::permissions::{PermissionSet, apply_permissions};
use crate::poller::{PollBudget, Poller, TargetState};
use crate::resolver::{MatchPolicy, Resolver};

pub use image::{ImageAttrs, ImageKind};
pub use network::{NetworkAttrs, NetworkKind, Reservation, ReservationMode};
pub use template::{TemplateAttrs, TemplateKind};

/// Remote method names bound to one kind.
#[derive(Debug, Clone, Copy)]
pub struct Calls {
    pub allocate: &'static str,
    pub clone: Option<&'static str>,
    pub info: &'static str,
    pub pool_info: &'static str,
    pub update: &'static str,
    pub rename: &'static str,
    pub delete: &'static str,
    pub chmod: &'static str,
}

/// Desired state of one object: the shared attributes plus the kind's own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Desired<A> {
    pub name: String,
    /// Free-form template body in the remote service's attribute syntax.
    #[serde(default)]
    pub description: String,
    pub permissions: PermissionSet,
    #[serde(flatten)]
    pub attrs: A,
}

/// Kind-specific behavior plugged into the generic reconciler.
#[async_trait]
pub trait ResourceKind: Send + Sync {
    type Attrs: Clone + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned;

    /// Human-readable kind label used in logs and errors.
    const KIND: &'static str;
    /// Root tag of the info document and member tag of the pool document.
    const ELEMENT: &'static str;
    const CALLS: Calls;

    /// State to wait for after creation, if the kind provisions asynchronously.
    fn ready_state(&self) -> Option<TargetState> {
        None
    }

    /// Kind-specific input checks, run before any remote call.
    fn validate(&self, _spec: &Desired<Self::Attrs>) -> Result<()> {
        Ok(())
    }

    /// Template body without the name header. Compared to decide on update calls.
    fn body(&self, spec: &Desired<Self::Attrs>) -> String {
        spec.description.clone()
    }

    /// Arguments of the allocate call, given the body with its name header.
    fn allocate_args(&self, _spec: &Desired<Self::Attrs>, body: String) -> Vec<Value> {
        vec![Value::Str(body)]
    }

    /// Arguments of the clone call, when the object should be cloned.
    fn clone_args(&self, _spec: &Desired<Self::Attrs>) -> Option<Vec<Value>> {
        None
    }

    /// Nested calls issued once, after the object exists and has its permissions.
    async fn after_create(
        &self,
        _client: &dyn Caller,
        _id: i64,
        _spec: &Desired<Self::Attrs>,
    ) -> Result<()> {
        Ok(())
    }

    /// Calls for kind-specific attribute changes from `old` to `new.attrs`.
    async fn update_attrs(
        &self,
        _client: &dyn Caller,
        _id: i64,
        _old: &Self::Attrs,
        _new: &Desired<Self::Attrs>,
    ) -> Result<()> {
        Ok(())
    }

    /// Project observed remote attributes onto the kind's attributes.
    fn observe_attrs(&self, observed: &ObservedObject, baseline: &Self::Attrs) -> Self::Attrs;
}

/// Quote a value for a `KEY = "value"` template line.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Drives the lifecycle of objects of kind `K`.
pub struct Reconciler<K: ResourceKind> {
    kind: K,
    client: Arc<dyn Caller>,
    budget: PollBudget,
    policy: MatchPolicy,
    cancel: CancellationToken,
}

impl<K: ResourceKind> Reconciler<K> {
    pub fn new(kind: K, client: Arc<dyn Caller>, config: &Config) -> Self {
        Self {
            kind,
            client,
            budget: config.budget_for(K::KIND),
            policy: config.match_policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort provisioning waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(
            self.client.as_ref(),
            K::KIND,
            K::CALLS.info,
            K::CALLS.pool_info,
            K::ELEMENT,
            self.policy,
        )
    }

    fn validate(&self, spec: &Desired<K::Attrs>) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation(format!("{} name is required", K::KIND)));
        }
        self.kind.validate(spec)
    }

    async fn chmod(&self, id: i64, permissions: &PermissionSet) -> Result<()> {
        apply_permissions(self.client.as_ref(), K::CALLS.chmod, id, permissions).await?;
        Ok(())
    }

    /// Create the object, wait until it is usable, apply permissions and
    /// return the normalized remote record.
    pub async fn create(&self, spec: &Desired<K::Attrs>) -> Result<ObservedObject> {
        self.validate(spec)?;

        let response = match (K::CALLS.clone, self.kind.clone_args(spec)) {
            (Some(method), Some(args)) => {
                info!(kind = K::KIND, name = %spec.name, "Cloning object");
                self.client.call(method, args).await?
            }
            _ => {
                info!(kind = K::KIND, name = %spec.name, "Allocating object");
                let body = format!("NAME = {}\n{}", quote(&spec.name), self.kind.body(spec));
                let args = self.kind.allocate_args(spec, body);
                self.client.call(K::CALLS.allocate, args).await?
            }
        };

        let id: i64 = response.trim().parse().map_err(|_| {
            Error::Decode(format!(
                "expected a numeric {} id, got {response:?}",
                K::KIND
            ))
        })?;
        info!(kind = K::KIND, id, name = %spec.name, "Object created");

        if let Some(target) = self.kind.ready_state() {
            Poller::new(self.client.as_ref(), K::CALLS.info, K::ELEMENT, self.budget)
                .with_cancellation(self.cancel.clone())
                .wait_for(id, target)
                .await
                .map_err(|e| Error::NotReady {
                    kind: K::KIND,
                    id,
                    source: Box::new(e),
                })?;
        }

        self.chmod(id, &spec.permissions).await?;
        self.kind.after_create(self.client.as_ref(), id, spec).await?;

        self.read(&ObjectRef::new(Some(id), spec.name.clone()))
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: K::KIND,
                name: spec.name.clone(),
            })
    }

    /// Locate the object; `None` means it needs to be (re)created.
    pub async fn read(&self, object: &ObjectRef) -> Result<Option<ObservedObject>> {
        self.resolver().resolve(object.id, &object.name).await
    }

    /// Issue one mutating call per changed field. Earlier calls stay applied
    /// if a later one fails.
    pub async fn update(
        &self,
        id: i64,
        old: &Desired<K::Attrs>,
        new: &Desired<K::Attrs>,
    ) -> Result<()> {
        self.validate(new)?;

        let body = self.kind.body(new);
        if self.kind.body(old) != body {
            // 0: replace the whole template instead of merging
            self.client
                .call(
                    K::CALLS.update,
                    vec![Value::Int(id), Value::Str(body), Value::Int(0)],
                )
                .await?;
            info!(kind = K::KIND, id, "Updated template body");
        }

        if old.name != new.name {
            self.client
                .call(
                    K::CALLS.rename,
                    vec![Value::Int(id), Value::Str(new.name.clone())],
                )
                .await?;
            info!(kind = K::KIND, id, from = %old.name, to = %new.name, "Renamed object");
        }

        if old.attrs != new.attrs {
            self.kind
                .update_attrs(self.client.as_ref(), id, &old.attrs, new)
                .await?;
        }

        if old.permissions != new.permissions {
            self.chmod(id, &new.permissions).await?;
            info!(
                kind = K::KIND,
                id,
                permissions = %new.permissions,
                "Updated permissions"
            );
        }

        Ok(())
    }

    /// Delete the object if it still exists. Associated objects are not cascaded.
    pub async fn delete(&self, object: &ObjectRef) -> Result<()> {
        let Some(current) = self.read(object).await? else {
            debug!(kind = K::KIND, name = %object.name, "Already absent, nothing to delete");
            return Ok(());
        };

        self.client
            .call(
                K::CALLS.delete,
                vec![Value::Int(current.id), Value::Bool(false)],
            )
            .await?;
        info!(kind = K::KIND, id = current.id, name = %current.name, "Deleted object");
        Ok(())
    }

    /// Desired-state view of a remote record, filling what the remote cannot
    /// echo back (the free-form body, clone source) from `baseline`.
    pub fn normalize(
        &self,
        observed: &ObservedObject,
        baseline: &Desired<K::Attrs>,
    ) -> Desired<K::Attrs> {
        Desired {
            name: observed.name.clone(),
            description: baseline.description.clone(),
            permissions: observed.permissions,
            attrs: self.kind.observe_attrs(observed, &baseline.attrs),
        }
    }
}
