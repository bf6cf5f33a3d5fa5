//! Scripted `Caller` for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Caller, Value};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub args: Vec<Value>,
}

/// Replays queued responses per method and records every call it sees.
#[derive(Default)]
pub struct FakeCaller {
    responses: Mutex<HashMap<String, VecDeque<Result<String>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeCaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for `method`.
    pub fn respond(&self, method: &str, response: Result<String>) {
        self.responses
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn reject(&self, method: &str, message: &str) {
        self.respond(
            method,
            Err(Error::RemoteRejected {
                method: method.to_string(),
                message: message.to_string(),
            }),
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }
}

#[async_trait]
impl Caller for FakeCaller {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: method.to_string(),
            args,
        });
        self.responses
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(Error::Transport(format!("no response scripted for {method}"))))
    }

    fn username(&self) -> &str {
        "tester"
    }
}
