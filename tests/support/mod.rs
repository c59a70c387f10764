// Scripted in-memory gateway shared by the integration tests. Replies are
// handed out in the order they were pushed; every request is recorded so
// tests can assert on the exact call sequence.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use ctw::api::{ApiResponse, Gateway, GatewayError, Payload, Query};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub type Reply = Result<ApiResponse, GatewayError>;

#[derive(Debug, Clone)]
pub struct Call {
    pub method: &'static str,
    pub path: String,
    pub query: Query,
    pub payload: Option<Payload>,
}

impl Call {
    /// Value of a form or multipart text field.
    pub fn field(&self, name: &str) -> Option<&str> {
        let fields = match self.payload.as_ref()? {
            Payload::Form(fields) => fields,
            Payload::Multipart { fields, .. } => fields,
            _ => return None,
        };
        fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Size of the binary part of a multipart payload.
    pub fn chunk_len(&self) -> Option<usize> {
        match self.payload.as_ref()? {
            Payload::Multipart { bytes, .. } => Some(bytes.len()),
            _ => None,
        }
    }

    /// The upload command, from the query (STATUS) or the body.
    pub fn command(&self) -> Option<&str> {
        self.query
            .get("command")
            .map(String::as_str)
            .or_else(|| self.field("command"))
    }
}

#[derive(Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: Reply) -> &Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.command().map(str::to_string))
            .collect()
    }

    fn next(&self, method: &'static str, path: &str, query: &Query, payload: Option<Payload>) -> Reply {
        self.calls.lock().unwrap().push(Call {
            method,
            path: path.to_string(),
            query: query.clone(),
            payload,
        });
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(transport("script exhausted")))
    }
}

impl Gateway for ScriptedGateway {
    fn get(&self, path: &str, query: &Query) -> Reply {
        self.next("GET", path, query, None)
    }

    fn get_streaming(&self, path: &str, query: &Query) -> Reply {
        self.next("GET", path, query, None)
    }

    fn post(&self, path: &str, payload: Payload, query: &Query) -> Reply {
        self.next("POST", path, query, Some(payload))
    }

    fn delete(&self, path: &str, query: &Query) -> Reply {
        self.next("DELETE", path, query, None)
    }
}

pub fn respond(status: u16, body: impl Into<Vec<u8>>) -> Reply {
    Ok(ApiResponse::new(
        status,
        HeaderMap::new(),
        Box::new(Cursor::new(body.into())),
    ))
}

pub fn json(value: serde_json::Value) -> Reply {
    respond(200, value.to_string())
}

/// 204 with no body, what APPEND answers.
pub fn no_content() -> Reply {
    respond(204, Vec::new())
}

pub fn with_header(reply: Reply, name: &'static str, value: &str) -> Reply {
    reply.map(|mut res| {
        res.headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).unwrap(),
        );
        res
    })
}

/// A stream connection that delivers `lines` and then ends (EOF).
pub fn stream(lines: &str) -> Reply {
    respond(200, lines.as_bytes().to_vec())
}

/// A stream connection that delivers `prefix` and then never sends
/// another byte.
pub fn hanging(prefix: &str) -> Reply {
    Ok(ApiResponse::new(
        200,
        HeaderMap::new(),
        Box::new(Hanging(Cursor::new(prefix.as_bytes().to_vec()))),
    ))
}

pub fn transport(message: &str) -> GatewayError {
    GatewayError::Io(io::Error::new(io::ErrorKind::ConnectionReset, message.to_string()))
}

struct Hanging(Cursor<Vec<u8>>);

impl Read for Hanging {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        thread::sleep(Duration::from_secs(3600));
        Ok(0)
    }
}

/// One feed line carrying the given tweet ids.
pub fn tweet_line(ids: &[&str]) -> String {
    let data: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| serde_json::json!({ "id": id, "text": format!("tweet {id}") }))
        .collect();
    format!("{}\n", serde_json::json!({ "data": data }))
}
