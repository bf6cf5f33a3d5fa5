//! Manifest agent: applies a declared set of objects and prunes the ones that
//! were dropped from the declaration.
//!
//! Every object is reconciled on its own. A failure is logged and collected,
//! and the remaining objects still get their turn. The observed records are
//! persisted as the baseline for the next run.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clients::Caller;
use crate::config::Config;
use crate::document::{ObjectRef, ObservedObject};
use crate::reconciler::{
    Desired, ImageAttrs, ImageKind, NetworkAttrs, NetworkKind, Reconciler, ResourceKind,
    TemplateAttrs, TemplateKind,
};

/// Declared objects, keyed by a stable local name per kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub networks: BTreeMap<String, Desired<NetworkAttrs>>,
    #[serde(default)]
    pub images: BTreeMap<String, Desired<ImageAttrs>>,
    #[serde(default)]
    pub templates: BTreeMap<String, Desired<TemplateAttrs>>,
}

impl Manifest {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid manifest {}", path.display()))
    }
}

/// What was last applied for one object, plus what the remote reported back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Applied<A> {
    pub spec: Desired<A>,
    pub observed: ObservedObject,
}

/// Persisted baseline from the previous run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub networks: BTreeMap<String, Applied<NetworkAttrs>>,
    #[serde(default)]
    pub images: BTreeMap<String, Applied<ImageAttrs>>,
    #[serde(default)]
    pub templates: BTreeMap<String, Applied<TemplateAttrs>>,
}

impl State {
    /// Load the state file; a missing file is an empty state.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Invalid state file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read state file {}", path.display()))
            }
        }
    }

    /// Write the state file, replacing the previous one only once fully written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Outcome of one agent run.
#[derive(Debug, Default)]
pub struct Report {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reconciles manifests against the remote service.
pub struct Agent {
    networks: Reconciler<NetworkKind>,
    images: Reconciler<ImageKind>,
    templates: Reconciler<TemplateKind>,
}

impl Agent {
    pub fn new(client: Arc<dyn Caller>, config: &Config) -> Self {
        Self {
            networks: Reconciler::new(NetworkKind, Arc::clone(&client), config),
            images: Reconciler::new(ImageKind, Arc::clone(&client), config),
            templates: Reconciler::new(TemplateKind, client, config),
        }
    }

    /// Abort provisioning waits of every kind when `cancel` fires.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self {
            networks: self.networks.with_cancellation(cancel.clone()),
            images: self.images.with_cancellation(cancel.clone()),
            templates: self.templates.with_cancellation(cancel),
        }
    }

    pub fn networks(&self) -> &Reconciler<NetworkKind> {
        &self.networks
    }

    pub fn images(&self) -> &Reconciler<ImageKind> {
        &self.images
    }

    pub fn templates(&self) -> &Reconciler<TemplateKind> {
        &self.templates
    }

    /// Apply `manifest`: networks first, then images, then templates. Objects
    /// present in `state` but gone from the manifest are deleted afterwards,
    /// in reverse order.
    pub async fn apply(&self, manifest: &Manifest, state: &mut State) -> Report {
        info!(
            networks = manifest.networks.len(),
            images = manifest.images.len(),
            templates = manifest.templates.len(),
            "Applying manifest"
        );
        let mut report = Report::default();

        apply_kind(&self.networks, &manifest.networks, &mut state.networks, &mut report).await;
        apply_kind(&self.images, &manifest.images, &mut state.images, &mut report).await;
        apply_kind(&self.templates, &manifest.templates, &mut state.templates, &mut report).await;

        prune_kind(&self.templates, &manifest.templates, &mut state.templates, &mut report).await;
        prune_kind(&self.images, &manifest.images, &mut state.images, &mut report).await;
        prune_kind(&self.networks, &manifest.networks, &mut state.networks, &mut report).await;

        report
    }

    /// Delete everything recorded in `state`.
    pub async fn destroy(&self, state: &mut State) -> Report {
        self.apply(&Manifest::default(), state).await
    }
}

fn object_label<K: ResourceKind>(key: &str) -> String {
    format!("{}/{}", K::KIND, key)
}

async fn apply_one<K: ResourceKind>(
    reconciler: &Reconciler<K>,
    spec: &Desired<K::Attrs>,
    previous: Option<&Applied<K::Attrs>>,
) -> crate::error::Result<(ObservedObject, bool)> {
    let known_id = previous.map(|p| p.observed.id);
    let lookup_name = previous
        .map(|p| p.observed.name.clone())
        .unwrap_or_else(|| spec.name.clone());

    let Some(current) = reconciler
        .read(&ObjectRef::new(known_id, lookup_name))
        .await?
    else {
        return Ok((reconciler.create(spec).await?, true));
    };

    let baseline = previous.map(|p| &p.spec).unwrap_or(spec);
    let observed = reconciler.normalize(&current, baseline);
    reconciler.update(current.id, &observed, spec).await?;

    let refreshed = reconciler
        .read(&ObjectRef::new(Some(current.id), spec.name.clone()))
        .await?
        .unwrap_or(current);
    Ok((refreshed, false))
}

async fn apply_kind<K: ResourceKind>(
    reconciler: &Reconciler<K>,
    desired: &BTreeMap<String, Desired<K::Attrs>>,
    known: &mut BTreeMap<String, Applied<K::Attrs>>,
    report: &mut Report,
) {
    for (key, spec) in desired {
        let label = object_label::<K>(key);
        match apply_one(reconciler, spec, known.get(key)).await {
            Ok((observed, created)) => {
                info!(object = %label, id = observed.id, created, "Object reconciled");
                known.insert(
                    key.clone(),
                    Applied {
                        spec: spec.clone(),
                        observed,
                    },
                );
                if created {
                    report.created.push(label);
                } else {
                    report.updated.push(label);
                }
            }
            Err(e) => {
                error!(object = %label, error = %e, "Reconciliation failed");
                report.failed.push((label, e.to_string()));
            }
        }
    }
}

async fn prune_kind<K: ResourceKind>(
    reconciler: &Reconciler<K>,
    desired: &BTreeMap<String, Desired<K::Attrs>>,
    known: &mut BTreeMap<String, Applied<K::Attrs>>,
    report: &mut Report,
) {
    let stale: Vec<String> = known
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .cloned()
        .collect();

    for key in stale {
        let label = object_label::<K>(&key);
        let Some(applied) = known.get(&key) else {
            continue;
        };
        info!(object = %label, id = applied.observed.id, "Pruning object");
        match reconciler.delete(&applied.observed.object_ref()).await {
            Ok(()) => {
                known.remove(&key);
                report.deleted.push(label);
            }
            Err(e) => {
                error!(object = %label, error = %e, "Failed to prune object");
                report.failed.push((label, e.to_string()));
            }
        }
    }
}
