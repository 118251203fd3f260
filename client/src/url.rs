//! Minimal absolute-URL parsing for the client: `http://host[:port][/path]`
//! and the `https` equivalent, default ports 80 and 443.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Url {
    pub fn parse(raw: &str) -> Option<Self> {
        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = raw.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else {
            return None;
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return None;
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            // Bracketed IPv6 literal.
            let end = rest.find(']')?;
            let host = &rest[..end];
            match &rest[end + 1..] {
                "" => (host, scheme.default_port()),
                port => (host, port.strip_prefix(':')?.parse().ok()?),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => (host, port.parse().ok()?),
                Some(_) => return None,
                None => (authority, scheme.default_port()),
            }
        };
        if host.is_empty() {
            return None;
        }

        Some(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// The request target for the request line.
    pub fn request_target(&self) -> String {
        self.path.clone()
    }

    /// Value for the `Host` header; the port is spelled out only when it
    /// is not the scheme default.
    pub fn host_header(&self) -> String {
        let bracketed = self.host.contains(':');
        let host = if bracketed {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}
