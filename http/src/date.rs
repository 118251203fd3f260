use std::{
    cell::RefCell,
    time::{SystemTime, UNIX_EPOCH},
};

/// Cached RFC 7231 date string for the `Date` header, reformatted at most
/// once per second.
pub struct HttpDate {
    cached: RefCell<(u64, String)>,
}

impl HttpDate {
    pub fn new() -> Self {
        Self {
            cached: RefCell::new((0, String::new())),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        let now = SystemTime::now();
        let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let mut cached = self.cached.borrow_mut();
        if cached.0 != secs || cached.1.is_empty() {
            *cached = (secs, httpdate::fmt_http_date(now));
        }
        f(&cached.1)
    }
}

impl Default for HttpDate {
    fn default() -> Self {
        Self::new()
    }
}
