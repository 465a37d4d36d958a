//! Header lists
//!
//! `Headers` is an ordered name/value list with case-insensitive lookups,
//! used for decoded request header blocks (pseudo-headers included).
//! `RespHeaders` is the response head the application hands to a stream for
//! serialization.

use std::fmt;

/// Header names that only make sense on a single HTTP/1 hop
const CONNECTION_HEADERS: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Ordered header list
///
/// Headers are stored in insertion order and support:
/// - Case-insensitive header name lookups
/// - Multiple values for the same header name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty header list
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Build a header list from raw name/value octets, as produced by the
    /// header codec. Invalid UTF-8 is replaced rather than rejected.
    pub fn from_raw(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        pairs
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect()
    }

    /// Append a header; an existing name gets another value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all instances of a header (case-insensitive)
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.headers.len()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `:method` pseudo-header
    pub fn method(&self) -> Option<&str> {
        self.get(":method")
    }

    /// `:path` pseudo-header
    pub fn path(&self) -> Option<&str> {
        self.get(":path")
    }

    /// `:authority` pseudo-header, falling back to `host`
    pub fn authority(&self) -> Option<&str> {
        self.get(":authority").or_else(|| self.get("host"))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Headers {
            headers: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }
}

/// Response head to serialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespHeaders {
    status: u16,
    headers: Headers,
}

impl RespHeaders {
    pub fn new(status: u16) -> Self {
        RespHeaders {
            status,
            headers: Headers::new(),
        }
    }

    /// Add a header (builder style)
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Remove hop-by-hop headers that multiplexed protocols forbid
    pub fn drop_connection_headers(&mut self) {
        for name in CONNECTION_HEADERS {
            self.headers.remove(name);
        }
    }

    /// Field list for a multiplexed protocol: `:status` first, names
    /// lower-cased, hop-by-hop headers skipped
    pub fn field_list(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(self.headers.len() + 1);
        fields.push((":status".to_string(), self.status.to_string()));
        for (name, value) in self.headers.iter() {
            let name = name.to_ascii_lowercase();
            if CONNECTION_HEADERS.contains(&name.as_str()) {
                continue;
            }
            fields.push((name, value.to_string()));
        }
        fields
    }

    /// HTTP/1.1 status line and header section
    pub fn to_http1_head(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.headers.len() * 32);
        buf.extend_from_slice(format!("HTTP/1.1 {} \r\n", self.status).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}
