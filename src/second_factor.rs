//! Second-factor authentication client.
//!
//! The proxy only consumes a boolean verdict: `authenticate(login)` is true
//! when the out-of-band factor approves the login. Every failure mode on the
//! way to that verdict (connect error, timeout, non-2xx status, malformed
//! body) collapses to false: the proxy fails closed.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Boolean contract of the out-of-band factor. Generic seam so sessions can be
/// driven by a test double.
pub trait SecondFactor: Send + Sync + 'static {
    fn authenticate(&self, login: &str) -> impl Future<Output = bool> + Send;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    login: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    allow: bool,
}

/// HTTP second-factor client: POSTs `{"login": ...}` to the configured
/// endpoint and reads `{"allow": bool}` back.
pub struct HttpSecondFactor {
    host: String,
    port: u16,
    path: String,
    timeout: Duration,
}

impl HttpSecondFactor {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let (host, port, path) = parse_http_url(url)?;
        Ok(Self {
            host,
            port,
            path,
            timeout,
        })
    }

    /// One request/response exchange. HTTP/1.1 with Connection: close, so the
    /// response body is simply everything after the header block.
    async fn call(&self, login: &str) -> Result<bool> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Connect to second-factor service {}", addr))?;

        let body = serde_json::to_string(&VerifyRequest { login })?;
        let request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.path,
            self.host,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::with_capacity(1024);
        stream.read_to_end(&mut response).await?;
        let response = String::from_utf8_lossy(&response);

        let status_line = response
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty response from second-factor service"))?;
        let status: u16 = status_line
            .split_ascii_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("Bad status line: {}", status_line))?;
        if !(200..300).contains(&status) {
            return Err(anyhow!("Second-factor service returned {}", status));
        }

        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b)
            .unwrap_or("");
        let verdict: VerifyResponse =
            serde_json::from_str(body.trim()).context("Parse second-factor response body")?;
        Ok(verdict.allow)
    }
}

impl SecondFactor for HttpSecondFactor {
    async fn authenticate(&self, login: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.call(login)).await {
            Ok(Ok(allow)) => {
                debug!("Second factor for {}: allow={}", login, allow);
                allow
            }
            Ok(Err(e)) => {
                warn!("Second factor check for {} failed (deny): {:#}", login, e);
                false
            }
            Err(_) => {
                warn!(
                    "Second factor check for {} timed out after {:?} (deny)",
                    login, self.timeout
                );
                false
            }
        }
    }
}

/// Parse "http://host:port/path" into (host, port, path). Port defaults to 80,
/// path to "/".
fn parse_http_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow!("Second-factor URL must be http://, got: {}", url))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .with_context(|| format!("Invalid port in URL: {}", url))?;
            (h.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return Err(anyhow!("Empty host in URL: {}", url));
    }
    Ok((host, port, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_http_url() {
        let (h, p, path) = parse_http_url("http://127.0.0.1:4242/api/authenticate").unwrap();
        assert_eq!(h, "127.0.0.1");
        assert_eq!(p, 4242);
        assert_eq!(path, "/api/authenticate");

        let (h, p, path) = parse_http_url("http://mfa.internal").unwrap();
        assert_eq!(h, "mfa.internal");
        assert_eq!(p, 80);
        assert_eq!(path, "/");
    }

    #[test]
    fn test_parse_http_url_rejects_https_and_garbage() {
        assert!(parse_http_url("https://mfa.internal/").is_err());
        assert!(parse_http_url("mfa.internal:80").is_err());
        assert!(parse_http_url("http://:80/").is_err());
        assert!(parse_http_url("http://h:notaport/").is_err());
    }

    /// One-shot HTTP server returning a fixed response, for client tests.
    async fn spawn_one_shot(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let mut total = 0;
            // Read until the header block is complete; body follows in the
            // same segment for these small requests.
            loop {
                let n = stream.read(&mut buf[total..]).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
                if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        format!("http://{}/check", addr)
    }

    #[tokio::test]
    async fn test_http_second_factor_allow() {
        let url =
            spawn_one_shot("HTTP/1.1 200 OK\r\nContent-Length: 14\r\n\r\n{\"allow\":true}").await;
        let sf = HttpSecondFactor::new(&url, Duration::from_secs(2)).unwrap();
        assert!(sf.authenticate("alice").await);
    }

    #[tokio::test]
    async fn test_http_second_factor_deny() {
        let url =
            spawn_one_shot("HTTP/1.1 200 OK\r\nContent-Length: 15\r\n\r\n{\"allow\":false}").await;
        let sf = HttpSecondFactor::new(&url, Duration::from_secs(2)).unwrap();
        assert!(!sf.authenticate("alice").await);
    }

    #[tokio::test]
    async fn test_http_second_factor_non_2xx_denies() {
        let url = spawn_one_shot("HTTP/1.1 500 Internal Server Error\r\n\r\n").await;
        let sf = HttpSecondFactor::new(&url, Duration::from_secs(2)).unwrap();
        assert!(!sf.authenticate("alice").await);
    }

    #[tokio::test]
    async fn test_http_second_factor_malformed_body_denies() {
        let url = spawn_one_shot("HTTP/1.1 200 OK\r\n\r\nnot json").await;
        let sf = HttpSecondFactor::new(&url, Duration::from_secs(2)).unwrap();
        assert!(!sf.authenticate("alice").await);
    }

    #[tokio::test]
    async fn test_http_second_factor_connect_error_denies() {
        // Bind then drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let sf = HttpSecondFactor::new(&format!("http://{}/check", addr), Duration::from_secs(2))
            .unwrap();
        assert!(!sf.authenticate("alice").await);
    }

    #[tokio::test]
    async fn test_http_second_factor_timeout_denies() {
        // Accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let sf = HttpSecondFactor::new(
            &format!("http://{}/check", addr),
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(!sf.authenticate("alice").await);
    }
}
