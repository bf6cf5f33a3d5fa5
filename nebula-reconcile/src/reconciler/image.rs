//! Disk images: allocated or cloned into a datastore, then copied in the
//! background until the remote service marks them ready.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Calls, Desired, ResourceKind};
use crate::clients::{Caller, Value};
use crate::document::ObservedObject;
use crate::error::{Error, Result};
use crate::poller::TargetState;

/// Image lifecycle code for READY.
pub const IMAGE_STATE_READY: i64 = 1;

pub const READY: TargetState = TargetState {
    label: "ready",
    matches: |obj| obj.state == Some(IMAGE_STATE_READY),
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttrs {
    /// Datastore the image lives in.
    pub datastore_id: i64,
    /// Clone from this image instead of allocating a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_from: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageKind;

#[async_trait]
impl ResourceKind for ImageKind {
    type Attrs = ImageAttrs;

    const KIND: &'static str = "image";
    const ELEMENT: &'static str = "IMAGE";
    const CALLS: Calls = Calls {
        allocate: "one.image.allocate",
        clone: Some("one.image.clone"),
        info: "one.image.info",
        pool_info: "one.imagepool.info",
        update: "one.image.update",
        rename: "one.image.rename",
        delete: "one.image.delete",
        chmod: "one.image.chmod",
    };

    fn ready_state(&self) -> Option<TargetState> {
        Some(READY)
    }

    fn validate(&self, spec: &Desired<ImageAttrs>) -> Result<()> {
        if spec.attrs.datastore_id < 0 {
            return Err(Error::Validation(format!(
                "image {} has negative datastore id {}",
                spec.name, spec.attrs.datastore_id
            )));
        }
        match spec.attrs.clone_from {
            Some(source) if source < 0 => Err(Error::Validation(format!(
                "image {} clones from negative image id {source}",
                spec.name
            ))),
            _ => Ok(()),
        }
    }

    fn allocate_args(&self, spec: &Desired<ImageAttrs>, body: String) -> Vec<Value> {
        vec![Value::Str(body), Value::Int(spec.attrs.datastore_id)]
    }

    fn clone_args(&self, spec: &Desired<ImageAttrs>) -> Option<Vec<Value>> {
        spec.attrs.clone_from.map(|source| {
            vec![
                Value::Int(source),
                Value::Str(spec.name.clone()),
                Value::Int(spec.attrs.datastore_id),
            ]
        })
    }

    async fn update_attrs(
        &self,
        _client: &dyn Caller,
        id: i64,
        old: &ImageAttrs,
        new: &Desired<ImageAttrs>,
    ) -> Result<()> {
        if old.datastore_id != new.attrs.datastore_id {
            warn!(
                id,
                from = old.datastore_id,
                to = new.attrs.datastore_id,
                "Moving an image to another datastore is not supported"
            );
        }
        if old.clone_from != new.attrs.clone_from {
            warn!(id, "The clone source of an image only applies at creation time");
        }
        Ok(())
    }

    fn observe_attrs(&self, observed: &ObservedObject, baseline: &ImageAttrs) -> ImageAttrs {
        ImageAttrs {
            datastore_id: observed
                .int_field("DATASTORE_ID")
                .unwrap_or(baseline.datastore_id),
            clone_from: baseline.clone_from,
        }
    }
}
