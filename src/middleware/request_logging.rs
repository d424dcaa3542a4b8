use std::time::Instant;
use tracing::{info, warn};

/// One line per proxied request, emitted when the response is ready
pub struct RequestLog<'a> {
    method: &'a str,
    endpoint: &'a str,
    request_id: &'a str,
    started: Instant,
}

impl<'a> RequestLog<'a> {
    pub fn start(method: &'a str, endpoint: &'a str, request_id: &'a str) -> Self {
        Self {
            method,
            endpoint,
            request_id,
            started: Instant::now(),
        }
    }

    pub fn finish(&self, status: u16, cache: &str) {
        let latency_ms = self.started.elapsed().as_millis() as u64;

        if status >= 500 {
            warn!(
                method = self.method,
                endpoint = self.endpoint,
                request_id = self.request_id,
                status,
                cache,
                latency_ms,
                "Request failed"
            );
        } else {
            info!(
                method = self.method,
                endpoint = self.endpoint,
                request_id = self.request_id,
                status,
                cache,
                latency_ms,
                "Request processed"
            );
        }
    }
}
