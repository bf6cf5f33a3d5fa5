//! XML-RPC transport over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::escape::escape;
use reqwest::Url;
use roxmltree::{Document, Node};
use tracing::{debug, warn};

use super::{Transport, Value};
use crate::error::{Error, Result};

/// Posts `methodCall` documents to a single endpoint.
#[derive(Debug, Clone)]
pub struct XmlRpcTransport {
    http: reqwest::Client,
    endpoint: Url,
}

impl XmlRpcTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Validation(format!("invalid endpoint {endpoint:?}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for XmlRpcTransport {
    async fn invoke(&self, method: &str, params: &[Value]) -> Result<Vec<Value>> {
        let body = encode_call(method, params);

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(method, %status, "XML-RPC endpoint returned HTTP error");
            return Err(Error::Transport(format!("{method}: HTTP {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("{method}: {e}")))?;
        debug!(method, bytes = text.len(), "XML-RPC response received");

        decode_response(&text)
    }
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::Int(v) => format!("<int>{v}</int>"),
        Value::Bool(v) => format!("<boolean>{}</boolean>", u8::from(*v)),
        Value::Str(v) => format!("<string>{}</string>", escape(v.as_str())),
    }
}

/// Render a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param><value>");
        out.push_str(&encode_value(param));
        out.push_str("</value></param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn text_of(node: Node<'_, '_>) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn decode_value(value: Node<'_, '_>) -> Result<Value> {
    let Some(typed) = value.children().find(|n| n.is_element()) else {
        // untyped values are strings
        return Ok(Value::Str(text_of(value)));
    };

    let raw = text_of(typed);
    match typed.tag_name().name() {
        "boolean" => match raw.trim() {
            "1" => Ok(Value::Bool(true)),
            "0" => Ok(Value::Bool(false)),
            other => Err(Error::Transport(format!("invalid XML-RPC boolean {other:?}"))),
        },
        "int" | "i4" | "i8" => raw
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|e| Error::Transport(format!("invalid XML-RPC integer {raw:?}: {e}"))),
        "string" => Ok(Value::Str(raw)),
        other => Err(Error::Transport(format!(
            "unsupported XML-RPC value type <{other}>"
        ))),
    }
}

fn fault_message(fault: Node<'_, '_>) -> String {
    fault
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "member")
        .find(|m| child(*m, "name").map(text_of).as_deref() == Some("faultString"))
        .and_then(|m| child(m, "value"))
        .map(text_of_value)
        .unwrap_or_else(|| "unknown fault".to_string())
}

fn text_of_value(value: Node<'_, '_>) -> String {
    match decode_value(value) {
        Ok(Value::Str(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => text_of(value),
    }
}

/// Decode a `methodResponse` whose single parameter is an array.
pub fn decode_response(text: &str) -> Result<Vec<Value>> {
    let doc = Document::parse(text)
        .map_err(|e| Error::Transport(format!("unparseable XML-RPC response: {e}")))?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodResponse" {
        return Err(Error::Transport(format!(
            "expected <methodResponse>, got <{}>",
            root.tag_name().name()
        )));
    }

    if let Some(fault) = child(root, "fault") {
        return Err(Error::Transport(format!(
            "XML-RPC fault: {}",
            fault_message(fault)
        )));
    }

    let data = child(root, "params")
        .and_then(|n| child(n, "param"))
        .and_then(|n| child(n, "value"))
        .and_then(|n| child(n, "array"))
        .and_then(|n| child(n, "data"))
        .ok_or_else(|| Error::Transport("XML-RPC response is not an array".to_string()))?;

    data.children()
        .filter(|n| n.is_element() && n.tag_name().name() == "value")
        .map(decode_value)
        .collect()
}
