//! Control messages exchanged over the daemon socket.
//!
//! Each connection carries exactly one UTF-8 JSON line terminated by a
//! newline, and gets exactly one JSON response line back. There is no
//! persistent session.

use crate::state::ProcessState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type StatusMap = BTreeMap<String, ProcessState>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Request {
    Add {
        name: String,
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Remove {
        name: String,
    },
    Status,
    Shutdown,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<StatusMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
            services: None,
            error: None,
        }
    }

    pub fn services(services: StatusMap) -> Self {
        Self {
            ok: true,
            message: None,
            services: Some(services),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: None,
            services: None,
            error: Some(error.into()),
        }
    }
}

/// Lenient server-side parse: distinguishes malformed JSON, unknown
/// commands, and known commands with missing fields, so each maps to the
/// failure response the caller expects.
#[derive(Debug, Deserialize)]
struct RawRequest {
    command: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
}

pub fn parse_line(line: &str) -> Result<Request, Response> {
    let raw: RawRequest = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(_) => return Err(Response::error("Invalid JSON")),
    };
    match raw.command.as_str() {
        "add" => match (raw.name, raw.cmd) {
            (Some(name), Some(cmd)) => Ok(Request::Add {
                name,
                cmd,
                cwd: raw.cwd,
            }),
            _ => Err(Response::error("add requires name and cmd")),
        },
        "remove" => match raw.name {
            Some(name) => Ok(Request::Remove { name }),
            None => Err(Response::error("remove requires a name")),
        },
        "status" => Ok(Request::Status),
        "shutdown" => Ok(Request::Shutdown),
        "ping" => Ok(Request::Ping),
        other => Err(Response::error(format!("unknown command: {other}"))),
    }
}
