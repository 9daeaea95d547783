use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::warn;

/// One HTTP-entry instance: a backing URL plus a single-writer health flag
/// flipped by request failures and, in the other direction, only by the
/// background health-check tick.
pub struct Instance {
    pub url: String,
    healthy: AtomicBool,
}

impl Instance {
    fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
    }
}

/// Round-robin cursor across a fixed instance list, skipping unhealthy
/// entries. A request failing with a 5xx or transport error marks its
/// instance unhealthy; only the health-check tick marks one healthy again.
pub struct HttpPool {
    pub instances: Vec<Instance>,
    pub health_check_path: String,
    cursor: AtomicUsize,
    client: reqwest::Client,
}

impl HttpPool {
    pub fn new(urls: Vec<String>, health_check_path: impl Into<String>) -> Self {
        Self {
            instances: urls.into_iter().map(Instance::new).collect(),
            health_check_path: health_check_path.into(),
            cursor: AtomicUsize::new(0),
            client: reqwest::Client::new(),
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_healthy()).count()
    }

    /// Picks the next healthy instance in round-robin order. Returns `None`
    /// if every instance is currently marked unhealthy.
    pub fn next_healthy(&self) -> Option<&Instance> {
        let len = self.instances.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let candidate = &self.instances[idx];
            if candidate.is_healthy() {
                return Some(candidate);
            }
        }
        None
    }

    /// Forward a request verbatim to the next healthy instance, marking it
    /// unhealthy on a 5xx or transport error. `path` is appended to the
    /// instance's base URL as-is.
    pub async fn forward(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> crate::error::Result<(http::StatusCode, Vec<u8>)> {
        let Some(instance) = self.next_healthy() else {
            return Err(crate::error::Error::GatewayNoHealthyInstance(
                "no healthy instance available".to_string(),
            ));
        };

        let url = format!("{}{}", instance.url.trim_end_matches('/'), path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.body(body);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_server_error() {
                    warn!(url = %instance.url, %status, "instance returned 5xx, marking unhealthy");
                    instance.mark_unhealthy();
                }
                let status = http::StatusCode::from_u16(status.as_u16())
                    .unwrap_or(http::StatusCode::BAD_GATEWAY);
                let bytes = resp
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                Ok((status, bytes))
            }
            Err(e) => {
                warn!(url = %instance.url, error = %e, "request failed, marking unhealthy");
                instance.mark_unhealthy();
                Err(crate::error::Error::BackendUnreachable(e.to_string()))
            }
        }
    }

    /// Probe every currently-unhealthy instance's health path; re-mark
    /// healthy on a 2xx response. Called by the background health tick.
    pub async fn probe_unhealthy(&self) {
        for instance in &self.instances {
            if instance.is_healthy() {
                continue;
            }
            let url = format!(
                "{}{}",
                instance.url.trim_end_matches('/'),
                self.health_check_path
            );
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(url = %instance.url, "instance recovered");
                    instance.mark_healthy();
                }
                Ok(resp) => {
                    tracing::debug!(url = %instance.url, status = %resp.status(), "instance still unhealthy");
                }
                Err(e) => {
                    tracing::debug!(url = %instance.url, error = %e, "health probe failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_distributes_evenly_across_healthy_instances() {
        let pool = HttpPool::new(
            vec!["http://x".into(), "http://y".into(), "http://z".into()],
            "/health",
        );
        let mut counts = std::collections::HashMap::new();
        for _ in 0..9 {
            let picked = pool.next_healthy().unwrap();
            *counts.entry(picked.url.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts.get("http://x"), Some(&3));
        assert_eq!(counts.get("http://y"), Some(&3));
        assert_eq!(counts.get("http://z"), Some(&3));
    }

    #[test]
    fn unhealthy_instance_is_skipped() {
        let pool = HttpPool::new(vec!["http://x".into(), "http://y".into()], "/health");
        pool.instances[0].mark_unhealthy();
        for _ in 0..4 {
            assert_eq!(pool.next_healthy().unwrap().url, "http://y");
        }
    }

    #[test]
    fn all_unhealthy_returns_none() {
        let pool = HttpPool::new(vec!["http://x".into()], "/health");
        pool.instances[0].mark_unhealthy();
        assert!(pool.next_healthy().is_none());
    }
}
