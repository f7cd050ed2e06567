//! Command payload parsing and response serialization
//!
//! A command frame carries an HTTP-like request head: a request line
//! (`GET /run HTTP/1.1`) followed by zero or more header lines and a
//! blank line. Body bytes arrive separately as data frames on the same
//! channel, so the head never contains a body.

use crate::error::ProtocolError;

/// A parsed command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Request method (`GET`, `PUT`, ...)
    pub method: String,
    /// Request path, including any query string
    pub path: String,
    /// Header name/value pairs in arrival order
    pub headers: Vec<(String, String)>,
}

/// Parse a command frame payload into a request head
pub fn parse_command(payload: &[u8]) -> Result<CommandRequest, ProtocolError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| ProtocolError::InvalidCommand("payload is not UTF-8".to_string()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ProtocolError::InvalidCommand("empty payload".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProtocolError::InvalidCommand("missing method".to_string()))?;
    let path = parts
        .next()
        .ok_or_else(|| ProtocolError::InvalidCommand("missing path".to_string()))?;
    if !path.starts_with('/') {
        return Err(ProtocolError::InvalidCommand(format!(
            "path does not start with '/': {}",
            path
        )));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ProtocolError::InvalidCommand(format!("malformed header line: {}", line))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(CommandRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
    })
}

/// Serialize an HTTP/1.1 response head
///
/// The caller appends the body; `Content-Length` must already be present
/// in `headers` if the peer is expected to delimit the body by length.
pub fn encode_response_head(
    status: u16,
    reason: &str,
    headers: &[(String, String)],
) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_command() {
        let req = parse_command(b"GET /run HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/run");
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_parse_command_with_headers() {
        let req = parse_command(
            b"PUT /write/statsd HTTP/1.1\r\nContent-Type: application/json\r\nX-Request-Id: 7\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.path, "/write/statsd");
        assert_eq!(
            req.headers,
            vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Request-Id".to_string(), "7".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_command_without_terminator() {
        // a head missing the trailing blank line is still usable
        let req = parse_command(b"GET /inventory HTTP/1.1").unwrap();
        assert_eq!(req.path, "/inventory");
    }

    #[test]
    fn test_parse_command_rejects_garbage() {
        assert!(parse_command(b"").is_err());
        assert!(parse_command(b"CONNECT").is_err());
        assert!(parse_command(b"GET noslash HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_command(b"GET /x HTTP/1.1\r\nbroken header\r\n\r\n").is_err());
        assert!(parse_command(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_encode_response_head() {
        let head = encode_response_head(
            200,
            "OK",
            &[
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Content-Length".to_string(), "2".to_string()),
            ],
        );
        assert_eq!(
            head,
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n"
        );
    }
}
