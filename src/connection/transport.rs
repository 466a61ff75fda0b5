//! Request transports. The connection only needs "send this verb and
//! request, give me the envelope back".

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use std::sync::OnceLock;
use std::time::Duration;

use super::wire::{Request, Response, Verb};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, verb: Verb, request: &Request) -> Result<Response>;
}

static HTTP: OnceLock<reqwest::Client> = OnceLock::new();

fn http_client() -> Result<&'static reqwest::Client> {
    if let Some(c) = HTTP.get() {
        return Ok(c);
    }
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(8)
        .tcp_nodelay(true)
        .build()
        .context("building reqwest client")?;
    Ok(HTTP.get_or_init(|| client))
}

/// JSON over HTTP: every verb is a POST to `<base>/<verb>`.
pub struct HttpTransport {
    base: String,
    timeout_ms: u64,
    max_retries: u8,
}

impl HttpTransport {
    pub fn new(base: &str, timeout_ms: u64, max_retries: u8) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            timeout_ms,
            max_retries,
        }
    }

    pub fn url(&self, verb: Verb) -> String {
        format!("{}/{}", self.base, verb.as_str())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, verb: Verb, request: &Request) -> Result<Response> {
        let url = self.url(verb);
        let mut attempt = 0u8;
        loop {
            let res = http_client()?
                .post(&url)
                .json(request)
                .timeout(Duration::from_millis(self.timeout_ms))
                .send()
                .await;
            match res {
                Ok(r) if r.status().is_success() => {
                    let resp: Response = r
                        .json()
                        .await
                        .with_context(|| format!("decoding {verb} response"))?;
                    log::debug!("http {verb}: success={}", resp.success);
                    return Ok(resp);
                }
                Ok(r) => {
                    let status = r.status().as_u16();
                    if retryable(verb, status) && attempt < self.max_retries {
                        attempt += 1;
                        let back_ms = backoff_delay_ms(attempt);
                        log::warn!("http {verb}: {status} retry={attempt} backoff={back_ms}ms");
                        tokio::time::sleep(Duration::from_millis(back_ms)).await;
                        continue;
                    }
                    return Err(anyhow!("http {} on {verb}", r.status()));
                }
                Err(e) => {
                    // Never replay a mutation whose outcome is unknown.
                    if attempt < self.max_retries && !verb.is_mutating() && e.is_connect() {
                        attempt += 1;
                        let back_ms = backoff_delay_ms(attempt);
                        log::warn!("http {verb}: err retry={attempt} backoff={back_ms}ms : {e}");
                        tokio::time::sleep(Duration::from_millis(back_ms)).await;
                        continue;
                    }
                    return Err(anyhow!(e).context(format!("sending {verb}")));
                }
            }
        }
    }
}

/// A 429 was refused before the backend did anything. A 5xx may have
/// been applied, so only verbs without side effects go again.
fn retryable(verb: Verb, status: u16) -> bool {
    match status {
        429 => true,
        500 | 502 | 503 | 504 => verb.is_idempotent(),
        _ => false,
    }
}

fn backoff_delay_ms(attempt: u8) -> u64 {
    let base = 300u64.saturating_mul(1u64 << (attempt.clamp(1, 5) - 1)); // 300,600,1200,2400,4800
    let jitter: u64 = thread_rng().gen_range(0..=250);
    base + jitter
}
