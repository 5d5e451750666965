//! Prometheus-format metrics for monitoring (RED: Rate, Errors, Duration).

use crate::cache::DnLoginCache;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket upper bounds in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram: buckets + count + sum (in microseconds).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Non-cumulative storage: only the first bucket with secs <= le.
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Thread-safe, lock-free counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Accepted client sessions.
    pub sessions_total: AtomicU64,
    /// Bytes relayed client -> upstream.
    pub request_bytes_total: AtomicU64,
    /// Bytes relayed upstream -> client (including synthetic responses).
    pub response_bytes_total: AtomicU64,
    /// Simple binds armed for second-factor enforcement.
    pub binds_observed_total: AtomicU64,
    pub second_factor_allowed_total: AtomicU64,
    pub second_factor_denied_total: AtomicU64,
    /// DN -> login mappings recorded from observed searches.
    pub logins_cached_total: AtomicU64,
    /// Chunks that did not decode as an LDAP message (forwarded unchanged).
    pub decode_failures_total: AtomicU64,
    /// Duration of second-factor service calls.
    second_factor_duration: DurationHistogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_sessions(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_request_bytes(&self, n: u64) {
        self.request_bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_response_bytes(&self, n: u64) {
        self.response_bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_binds_observed(&self) {
        self.binds_observed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_second_factor_allowed(&self) {
        self.second_factor_allowed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_second_factor_denied(&self) {
        self.second_factor_denied_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_logins_cached(&self) {
        self.logins_cached_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn observe_second_factor(&self, duration: Duration) {
        self.second_factor_duration.observe(duration);
    }

    /// Render in Prometheus exposition format. `cache_entries` is the current
    /// DN cache size (gauge).
    pub fn render(&self, cache_entries: usize) -> String {
        let mut out = String::new();
        for (name, help, val) in [
            (
                "ldap_mfa_sessions_total",
                "Total number of client sessions accepted.",
                self.sessions_total.load(Ordering::Relaxed),
            ),
            (
                "ldap_mfa_request_bytes_total",
                "Bytes relayed from clients to the upstream directory.",
                self.request_bytes_total.load(Ordering::Relaxed),
            ),
            (
                "ldap_mfa_response_bytes_total",
                "Bytes relayed from the upstream directory to clients.",
                self.response_bytes_total.load(Ordering::Relaxed),
            ),
            (
                "ldap_mfa_binds_observed_total",
                "Simple binds subject to second-factor enforcement.",
                self.binds_observed_total.load(Ordering::Relaxed),
            ),
            (
                "ldap_mfa_logins_cached_total",
                "DN to login mappings recorded from observed searches.",
                self.logins_cached_total.load(Ordering::Relaxed),
            ),
            (
                "ldap_mfa_decode_failures_total",
                "Chunks that did not decode as an LDAP message (forwarded unchanged).",
                self.decode_failures_total.load(Ordering::Relaxed),
            ),
        ] {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, val));
        }

        out.push_str("# HELP ldap_mfa_second_factor_total Second-factor verdicts by outcome.\n");
        out.push_str("# TYPE ldap_mfa_second_factor_total counter\n");
        for (outcome, val) in [
            (
                "allowed",
                self.second_factor_allowed_total.load(Ordering::Relaxed),
            ),
            (
                "denied",
                self.second_factor_denied_total.load(Ordering::Relaxed),
            ),
        ] {
            out.push_str(&format!(
                "ldap_mfa_second_factor_total{{outcome=\"{}\"}} {}\n",
                outcome, val
            ));
        }

        out.push_str("# HELP ldap_mfa_dn_cache_entries Current entries in the DN to login cache.\n");
        out.push_str("# TYPE ldap_mfa_dn_cache_entries gauge\n");
        out.push_str(&format!("ldap_mfa_dn_cache_entries {}\n", cache_entries));

        let hist = &self.second_factor_duration;
        let count = hist.count.load(Ordering::Relaxed);
        out.push_str(
            "# HELP ldap_mfa_second_factor_duration_seconds Second-factor call duration in seconds.\n",
        );
        out.push_str("# TYPE ldap_mfa_second_factor_duration_seconds histogram\n");
        let mut cum = 0u64;
        for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
            cum += hist.buckets[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "ldap_mfa_second_factor_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                le, cum
            ));
        }
        out.push_str(&format!(
            "ldap_mfa_second_factor_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            count
        ));
        let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        out.push_str(&format!(
            "ldap_mfa_second_factor_duration_seconds_sum {}\n",
            sum_secs
        ));
        out.push_str(&format!(
            "ldap_mfa_second_factor_duration_seconds_count {}\n",
            count
        ));

        out
    }
}

/// Path from the first line of an HTTP request ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// HTTP server for GET /metrics and GET /health.
pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<Metrics>,
    cache: Arc<DnLoginCache>,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!(
        "Metrics server listening on http://{} (GET /metrics, /health)",
        socket_addr
    );

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let cache = Arc::clone(&cache);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if total >= 4 && buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body) = match path {
                "/health" => ("200 OK", "ok".to_string()),
                "/metrics" => ("200 OK", metrics.render(cache.len())),
                _ => (
                    "404 Not Found",
                    "Not found. Supported: GET /metrics, GET /health.\n".to_string(),
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{request_path, Metrics};
    use std::time::Duration;

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /metrics HTTP/1.1"), "/metrics");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_render_contains_counters() {
        let m = Metrics::new();
        m.inc_sessions();
        m.inc_binds_observed();
        m.inc_second_factor_allowed();
        m.inc_second_factor_denied();
        m.observe_second_factor(Duration::from_millis(20));
        let out = m.render(3);
        assert!(out.contains("ldap_mfa_sessions_total 1"));
        assert!(out.contains("ldap_mfa_binds_observed_total 1"));
        assert!(out.contains("ldap_mfa_second_factor_total{outcome=\"allowed\"} 1"));
        assert!(out.contains("ldap_mfa_second_factor_total{outcome=\"denied\"} 1"));
        assert!(out.contains("ldap_mfa_dn_cache_entries 3"));
        assert!(out.contains("ldap_mfa_second_factor_duration_seconds_count 1"));
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let m = Metrics::new();
        m.observe_second_factor(Duration::from_millis(1));
        m.observe_second_factor(Duration::from_millis(300));
        let out = m.render(0);
        assert!(out.contains("ldap_mfa_second_factor_duration_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(out.contains("ldap_mfa_second_factor_duration_seconds_bucket{le=\"0.005\"} 1"));
        assert!(out.contains("ldap_mfa_second_factor_duration_seconds_bucket{le=\"0.5\"} 2"));
    }
}
