//! VM templates: plain documents with no provisioning phase.

use serde::{Deserialize, Serialize};

use super::{Calls, ResourceKind};
use crate::document::ObservedObject;

/// Templates carry nothing beyond the shared attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAttrs {}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateKind;

impl ResourceKind for TemplateKind {
    type Attrs = TemplateAttrs;

    const KIND: &'static str = "template";
    const ELEMENT: &'static str = "VMTEMPLATE";
    const CALLS: Calls = Calls {
        allocate: "one.template.allocate",
        clone: None,
        info: "one.template.info",
        pool_info: "one.templatepool.info",
        update: "one.template.update",
        rename: "one.template.rename",
        delete: "one.template.delete",
        chmod: "one.template.chmod",
    };

    fn observe_attrs(&self, _observed: &ObservedObject, _baseline: &TemplateAttrs) -> TemplateAttrs {
        TemplateAttrs {}
    }
}
