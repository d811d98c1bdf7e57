use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unknown http method: {other}")),
        }
    }
}

/// A write captured while offline, waiting in the durable queue. Carries
/// everything needed to resubmit without ambient context, including the
/// bearer credential snapshotted at capture time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAction {
    pub id: i64,
    pub url: String,
    pub method: HttpMethod,
    pub payload: Value,
    pub token: String,
}

/// A pending action before the queue assigns its local id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub url: String,
    pub method: HttpMethod,
    pub payload: Value,
    pub token: String,
}

impl NewAction {
    pub fn new(method: HttpMethod, url: impl Into<String>, payload: Value, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            payload,
            token: token.into(),
        }
    }
}
