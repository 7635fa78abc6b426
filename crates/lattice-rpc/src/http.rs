//! Minimal blocking HTTP/1.1 framing.
//!
//! The connector listener, the metrics endpoint, and the outbound client all
//! speak one-shot HTTP exchanges: a single request and a single response per
//! connection, framed by `Content-Length`. This module implements exactly
//! that subset; it is not a general-purpose HTTP implementation.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use serde_json::{Map, Value};
use thiserror::Error;
use url::form_urlencoded;

/// A parsed inbound HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method (`GET`, `POST`, ...), uppercased.
    pub method: String,
    /// Request path including any query string.
    pub path: String,
    headers: BTreeMap<String, String>,
    /// Raw request body.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Returns a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the declared content type, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Decodes the body into a JSON value.
    ///
    /// JSON bodies are parsed as-is. Urlencoded bodies become an object whose
    /// values are all strings, matching what form submission produces.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Body`] when the body is not valid for the
    /// declared content type.
    pub fn body_as_json(&self) -> Result<Value, HttpError> {
        let content_type = self.content_type().unwrap_or("application/json");
        if content_type.starts_with("application/x-www-form-urlencoded") {
            let mut object = Map::new();
            for (key, value) in form_urlencoded::parse(&self.body) {
                object.insert(key.into_owned(), Value::String(value.into_owned()));
            }
            return Ok(Value::Object(object));
        }

        serde_json::from_slice(&self.body).map_err(|source| HttpError::Body {
            message: source.to_string(),
        })
    }
}

/// An HTTP response ready for serialisation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Content type header value.
    pub content_type: String,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Builds a `200 OK` response with a JSON body.
    #[must_use]
    pub fn ok_json(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body,
        }
    }

    /// Builds a `200 OK` response with a plain-text body.
    #[must_use]
    pub fn ok_text(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: content_type.into(),
            body,
        }
    }

    /// Builds an empty response with the given status.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: reason_phrase(status).as_bytes().to_vec(),
        }
    }
}

/// Errors surfaced by the HTTP codec.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Reading or writing the stream failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The request line did not match `METHOD PATH VERSION`.
    #[error("malformed request line: {line}")]
    RequestLine { line: String },
    /// The status line did not match `VERSION STATUS REASON`.
    #[error("malformed status line: {line}")]
    StatusLine { line: String },
    /// A header line lacked the `name: value` shape.
    #[error("malformed header: {line}")]
    Header { line: String },
    /// The `Content-Length` value was not a number.
    #[error("invalid content length: {value}")]
    ContentLength { value: String },
    /// The declared body size exceeds the configured limit.
    #[error("request body of {size} bytes exceeds {limit} byte limit")]
    BodyTooLarge { size: u64, limit: u64 },
    /// The body was not valid for the declared content type.
    #[error("invalid request body: {message}")]
    Body { message: String },
    /// The peer closed the connection before a full message arrived.
    #[error("connection closed mid-message")]
    UnexpectedEof,
}

/// Reads one HTTP request from the stream, bounding the body size.
///
/// Returns `Ok(None)` when the peer disconnects before sending anything.
///
/// # Errors
///
/// Returns [`HttpError`] on framing violations, oversized bodies, or IO
/// failures.
pub fn read_request<R: BufRead>(
    reader: &mut R,
    body_limit: u64,
) -> Result<Option<HttpRequest>, HttpError> {
    let Some(line) = read_line(reader)? else {
        return Ok(None);
    };

    let mut parts = line.split_whitespace();
    let method = parts.next().map(str::to_ascii_uppercase);
    let path = parts.next().map(str::to_string);
    let has_version = parts.next().is_some();
    let (Some(method), Some(path), true) = (method, path, has_version) else {
        return Err(HttpError::RequestLine { line });
    };

    let headers = read_headers(reader)?;
    let body = read_body(reader, &headers, body_limit)?;

    Ok(Some(HttpRequest {
        method,
        path,
        headers,
        body,
    }))
}

/// Writes an HTTP response, closing the exchange.
///
/// # Errors
///
/// Returns [`HttpError::Io`] when the stream write fails.
pub fn write_response<W: Write>(writer: &mut W, response: &HttpResponse) -> Result<(), HttpError> {
    write!(
        writer,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len()
    )?;
    writer.write_all(&response.body)?;
    writer.flush()?;
    Ok(())
}

/// Writes an HTTP POST request carrying a JSON body.
///
/// # Errors
///
/// Returns [`HttpError::Io`] when the stream write fails.
pub fn write_request<W: Write>(
    writer: &mut W,
    path: &str,
    host: &str,
    body: &[u8],
) -> Result<(), HttpError> {
    write!(
        writer,
        "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one HTTP response from the stream.
///
/// When no `Content-Length` header is present the body is read until EOF,
/// which is correct for `Connection: close` exchanges.
///
/// # Errors
///
/// Returns [`HttpError`] on framing violations or IO failures.
pub fn read_response<R: BufRead>(reader: &mut R) -> Result<HttpResponse, HttpError> {
    let line = read_line(reader)?.ok_or(HttpError::UnexpectedEof)?;
    let mut parts = line.split_whitespace();
    let status = parts
        .next()
        .and_then(|_version| parts.next())
        .and_then(|status| status.parse::<u16>().ok());
    let Some(status) = status else {
        return Err(HttpError::StatusLine { line });
    };

    let headers = read_headers(reader)?;
    let body = match headers.get("content-length") {
        Some(_) => read_body(reader, &headers, u64::MAX)?,
        None => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            body
        }
    };

    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| "application/json".to_string());

    Ok(HttpResponse {
        status,
        content_type,
        body,
    })
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>, HttpError> {
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line)?;
    if bytes_read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<BTreeMap<String, String>, HttpError> {
    let mut headers = BTreeMap::new();
    loop {
        let line = read_line(reader)?.ok_or(HttpError::UnexpectedEof)?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Header { line: line.clone() })?;
        headers.insert(
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }
}

fn read_body<R: BufRead>(
    reader: &mut R,
    headers: &BTreeMap<String, String>,
    limit: u64,
) -> Result<Vec<u8>, HttpError> {
    let Some(raw_length) = headers.get("content-length") else {
        return Ok(Vec::new());
    };
    let length: u64 = raw_length.parse().map_err(|_| HttpError::ContentLength {
        value: raw_length.clone(),
    })?;
    if length > limit {
        return Err(HttpError::BodyTooLarge {
            size: length,
            limit,
        });
    }

    let mut body = vec![0_u8; length as usize];
    reader
        .read_exact(&mut body)
        .map_err(|error| match error.kind() {
            io::ErrorKind::UnexpectedEof => HttpError::UnexpectedEof,
            _ => HttpError::Io(error),
        })?;
    Ok(body)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
