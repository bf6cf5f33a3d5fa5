//! Decoding of remote object documents.
//!
//! Info calls return one element such as `<IMAGE>...</IMAGE>`; pool calls
//! return `<IMAGE_POOL>` wrapping many of them. Every decode fills the full set
//! of computed ownership fields, since hosts persist the whole record as their
//! next baseline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::permissions::PermissionSet;

/// Owner and group, assigned by the remote service at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: i64,
    pub gid: i64,
    pub uname: String,
    pub gname: String,
}

/// Identity of a remote object: the immutable id (once known) and the mutable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: Option<i64>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(id: Option<i64>, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Decoded remote representation of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedObject {
    pub id: i64,
    pub name: String,
    pub ownership: Ownership,
    pub permissions: PermissionSet,
    /// Lifecycle state code, for kinds that report one.
    pub state: Option<i64>,
    pub registered_at: Option<DateTime<Utc>>,
    /// Remaining top-level scalar elements, e.g. `DATASTORE_ID`, `BRIDGE`.
    pub fields: BTreeMap<String, String>,
    /// Scalar attributes from the object's `TEMPLATE` section.
    pub template: BTreeMap<String, String>,
    /// `AR_POOL/AR` entries of virtual networks.
    pub address_ranges: Vec<BTreeMap<String, String>>,
}

impl ObservedObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(Some(self.id), self.name.clone())
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Parse a top-level field as an integer.
    pub fn int_field(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(|v| v.trim().parse().ok())
    }
}

const PERMISSION_TAGS: [&str; 9] = [
    "OWNER_U", "OWNER_M", "OWNER_A", "GROUP_U", "GROUP_M", "GROUP_A", "OTHER_U", "OTHER_M",
    "OTHER_A",
];

/// Elements decoded into dedicated fields rather than `fields`.
const COMMON_TAGS: [&str; 10] = [
    "ID",
    "NAME",
    "UID",
    "GID",
    "UNAME",
    "GNAME",
    "PERMISSIONS",
    "STATE",
    "REGTIME",
    "REG",
];

fn elements<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    elements(node).find(|n| n.tag_name().name() == name)
}

fn text(node: Node<'_, '_>) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
}

fn is_leaf(node: Node<'_, '_>) -> bool {
    elements(node).next().is_none()
}

fn required_text(node: Node<'_, '_>, name: &str) -> Result<String> {
    child(node, name).map(text).ok_or_else(|| {
        Error::Decode(format!(
            "<{}> is missing <{name}>",
            node.tag_name().name()
        ))
    })
}

fn required_int(node: Node<'_, '_>, name: &str) -> Result<i64> {
    let raw = required_text(node, name)?;
    raw.trim().parse().map_err(|e| {
        Error::Decode(format!(
            "<{}><{name}> is not an integer ({raw:?}): {e}",
            node.tag_name().name()
        ))
    })
}

fn optional_int(node: Node<'_, '_>, name: &str) -> Result<Option<i64>> {
    match child(node, name) {
        Some(_) => required_int(node, name).map(Some),
        None => Ok(None),
    }
}

fn leaves(node: Node<'_, '_>) -> BTreeMap<String, String> {
    elements(node)
        .filter(|n| is_leaf(*n))
        .map(|n| (n.tag_name().name().to_string(), text(n)))
        .collect()
}

fn decode_permissions(node: Node<'_, '_>) -> Result<PermissionSet> {
    let perms = child(node, "PERMISSIONS")
        .ok_or_else(|| Error::Decode("object is missing <PERMISSIONS>".to_string()))?;

    let mut flags = [false; 9];
    for (flag, tag) in flags.iter_mut().zip(PERMISSION_TAGS) {
        *flag = required_int(perms, tag)? != 0;
    }
    Ok(PermissionSet::from_flags(flags))
}

fn decode_object(node: Node<'_, '_>) -> Result<ObservedObject> {
    let registered = match optional_int(node, "REGTIME")? {
        Some(ts) => Some(ts),
        None => optional_int(node, "REG")?,
    };
    let registered_at = registered.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

    let fields = elements(node)
        .filter(|n| is_leaf(*n) && !COMMON_TAGS.contains(&n.tag_name().name()))
        .map(|n| (n.tag_name().name().to_string(), text(n)))
        .collect();

    let template = child(node, "TEMPLATE").map(leaves).unwrap_or_default();

    let address_ranges = child(node, "AR_POOL")
        .map(|pool| {
            elements(pool)
                .filter(|n| n.tag_name().name() == "AR")
                .map(leaves)
                .collect()
        })
        .unwrap_or_default();

    Ok(ObservedObject {
        id: required_int(node, "ID")?,
        name: required_text(node, "NAME")?,
        ownership: Ownership {
            uid: required_int(node, "UID")?,
            gid: required_int(node, "GID")?,
            uname: required_text(node, "UNAME")?,
            gname: required_text(node, "GNAME")?,
        },
        permissions: decode_permissions(node)?,
        state: optional_int(node, "STATE")?,
        registered_at,
        fields,
        template,
        address_ranges,
    })
}

fn parse(xml: &str) -> Result<Document<'_>> {
    Document::parse(xml).map_err(|e| Error::Decode(format!("invalid XML document: {e}")))
}

/// Decode a single object document whose root tag is `element`.
pub fn decode_one(xml: &str, element: &str) -> Result<ObservedObject> {
    let doc = parse(xml)?;
    let root = doc.root_element();
    if root.tag_name().name() != element {
        return Err(Error::Decode(format!(
            "expected <{element}>, got <{}>",
            root.tag_name().name()
        )));
    }
    decode_object(root)
}

/// Decode every `element` child of a pool document, in document order.
pub fn decode_pool(xml: &str, element: &str) -> Result<Vec<ObservedObject>> {
    let doc = parse(xml)?;
    elements(doc.root_element())
        .filter(|n| n.tag_name().name() == element)
        .map(decode_object)
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Canned documents shaped like the remote service's output.

    pub fn object(element: &str, id: i64, name: &str, perms: &str, extra: &str) -> String {
        let digits: Vec<u8> = perms.bytes().map(|b| b - b'0').collect();
        let bit = |d: u8, mask: u8| u8::from(d & mask != 0);
        format!(
            "<{element}><ID>{id}</ID><UID>2</UID><GID>1</GID><UNAME>tester</UNAME>\
             <GNAME>users</GNAME><NAME>{name}</NAME><PERMISSIONS>\
             <OWNER_U>{}</OWNER_U><OWNER_M>{}</OWNER_M><OWNER_A>{}</OWNER_A>\
             <GROUP_U>{}</GROUP_U><GROUP_M>{}</GROUP_M><GROUP_A>{}</GROUP_A>\
             <OTHER_U>{}</OTHER_U><OTHER_M>{}</OTHER_M><OTHER_A>{}</OTHER_A>\
             </PERMISSIONS>{extra}</{element}>",
            bit(digits[0], 4),
            bit(digits[0], 2),
            bit(digits[0], 1),
            bit(digits[1], 4),
            bit(digits[1], 2),
            bit(digits[1], 1),
            bit(digits[2], 4),
            bit(digits[2], 2),
            bit(digits[2], 1),
        )
    }

    pub fn pool(element: &str, members: &[String]) -> String {
        format!("<{element}_POOL>{}</{element}_POOL>", members.concat())
    }
}
