//! Proxy checks against judge endpoints

use crate::error::{EngineError, EngineResult};
use crate::proxy::judge::Judge;
use crate::proxy::models::{AnonymityLevel, CheckOutcome, Protocol, Proxy, WorkItem};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; open-proxy-engine)";

/// Headers a judge must echo for a response to count as valid
const REQUIRED_HEADERS: &[&str] = &["USER-AGENT"];

/// Headers that reveal a proxy sat between us and the judge
const PROXY_HEADERS: &[&str] = &[
    "VIA",
    "X-FORWARDED-FOR",
    "X-FORWARDED",
    "FORWARDED",
    "FORWARDED-FOR",
    "PROXY-CONNECTION",
    "X-PROXY-ID",
    "X-REAL-IP",
    "CLIENT-IP",
    "X-CLIENT-IP",
    "X-BLUECOAT-VIA",
];

/// `NAME = value` (azenv style) or `"Name": value` (JSON echo) lines
static HEADER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*"?([A-Za-z][A-Za-z0-9_\-]*)"?\s*[:=]"#).expect("Invalid header line regex")
});

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub proxy_url: String,
    pub protocol: Protocol,
    pub judge_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

/// One GET through a proxy
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> anyhow::Result<ProbeResponse>;
}

/// `Prober` backed by a per-proxy reqwest client
#[derive(Debug, Clone, Default)]
pub struct ReqwestProber;

impl ReqwestProber {
    fn create_client(request: &ProbeRequest) -> anyhow::Result<Client> {
        let proxy = match request.protocol {
            Protocol::Http => ReqwestProxy::http(&request.proxy_url)?,
            Protocol::Https => ReqwestProxy::https(&request.proxy_url)?,
            Protocol::Socks4 | Protocol::Socks5 => ReqwestProxy::all(&request.proxy_url)?,
        };
        let client = Client::builder()
            .proxy(proxy)
            .timeout(request.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(client)
    }
}

#[async_trait]
impl Prober for ReqwestProber {
    async fn probe(&self, request: &ProbeRequest) -> anyhow::Result<ProbeResponse> {
        let client = Self::create_client(request)?;
        let response = client.get(&request.judge_url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ProbeResponse { status, body })
    }
}

/// Header names echoed in a judge body, normalised to `UPPER-DASH` form
fn echoed_headers(body: &str) -> HashSet<String> {
    HEADER_LINE
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| {
            let name = m.as_str().to_uppercase().replace('_', "-");
            match name.strip_prefix("HTTP-") {
                Some(rest) => rest.to_string(),
                None => name,
            }
        })
        .collect()
}

pub struct Checker {
    prober: Arc<dyn Prober>,
    local_ip: Option<String>,
}

impl Checker {
    pub fn new(prober: Arc<dyn Prober>, local_ip: Option<String>) -> Self {
        Self {
            prober,
            local_ip: local_ip.filter(|ip| !ip.trim().is_empty()),
        }
    }

    /// Whether a response body proves the request went through
    pub fn validate(&self, judge: &Judge, body: &str) -> bool {
        match &judge.regex {
            Some(regex) => regex.is_match(body),
            None => {
                let headers = echoed_headers(body);
                REQUIRED_HEADERS.iter().all(|h| headers.contains(*h))
            }
        }
    }

    pub fn classify(&self, body: &str) -> AnonymityLevel {
        if let Some(ip) = &self.local_ip {
            if body.contains(ip.as_str()) {
                return AnonymityLevel::Transparent;
            }
        }
        let headers = echoed_headers(body);
        if PROXY_HEADERS.iter().any(|h| headers.contains(*h)) {
            AnonymityLevel::Anonymous
        } else {
            AnonymityLevel::Elite
        }
    }

    /// Check `item` over `protocol` against `judge`, trying up to
    /// `retries + 1` times. Only cancellation is returned as an error;
    /// every other failure is part of the outcome.
    pub async fn run_check(
        &self,
        ctx: &CancellationToken,
        item: &WorkItem,
        protocol: Protocol,
        judge: &Judge,
        timeout: Duration,
        retries: u32,
    ) -> EngineResult<CheckOutcome> {
        let request = ProbeRequest {
            proxy_url: item.proxy_url(protocol),
            protocol,
            judge_url: judge.url.clone(),
            timeout,
        };
        let max_attempts = retries.saturating_add(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(EngineError::Cancelled),
                r = tokio::time::timeout(timeout, self.prober.probe(&request)) => r,
            };
            let error = match result {
                Ok(Ok(response)) if (200..300).contains(&response.status) => {
                    if self.validate(judge, &response.body) {
                        let latency = start.elapsed().as_millis() as u64;
                        return Ok(CheckOutcome::working(
                            protocol,
                            judge.url.clone(),
                            attempt,
                            latency,
                            self.classify(&response.body),
                        ));
                    }
                    "judge response failed validation".to_string()
                }
                Ok(Ok(response)) => format!("HTTP status: {}", response.status),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "Connection timeout".to_string(),
            };
            trace!(proxy = %item, %protocol, attempt, error = %error, "check attempt failed");
            last_error = error;
        }

        Ok(CheckOutcome::failed(
            protocol,
            judge.url.clone(),
            max_attempts,
            last_error,
        ))
    }

    /// Check parsed proxies against one judge, `concurrency` at a time.
    /// Used for one-off checks that bypass scheduling.
    pub async fn check_many(
        &self,
        ctx: &CancellationToken,
        proxies: Vec<Proxy>,
        judge: &Judge,
        timeout: Duration,
        retries: u32,
        concurrency: usize,
    ) -> Vec<(Proxy, CheckOutcome)> {
        stream::iter(proxies)
            .map(|proxy| async move {
                let item = WorkItem::from_proxy(0, &proxy);
                let outcome = match self
                    .run_check(ctx, &item, proxy.protocol, judge, timeout, retries)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => CheckOutcome::failed(proxy.protocol, judge.url.clone(), 0, e.to_string()),
                };
                (proxy, outcome)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) const AZENV_BODY: &str = "REMOTE_ADDR = 203.0.113.9\nHTTP_USER_AGENT = test\nHTTP_ACCEPT = */*\n";

    /// Replays scripted responses and records each request
    #[derive(Default)]
    pub(crate) struct ScriptedProber {
        pub(crate) script: Mutex<VecDeque<anyhow::Result<ProbeResponse>>>,
        pub(crate) fallback: Option<String>,
        pub(crate) calls: Mutex<Vec<ProbeRequest>>,
    }

    impl ScriptedProber {
        pub(crate) fn always(body: &str) -> Self {
            Self {
                fallback: Some(body.to_string()),
                ..Self::default()
            }
        }

        pub(crate) fn push(&self, response: anyhow::Result<ProbeResponse>) {
            self.script.lock().unwrap().push_back(response);
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, request: &ProbeRequest) -> anyhow::Result<ProbeResponse> {
            self.calls.lock().unwrap().push(request.clone());
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return next;
            }
            match &self.fallback {
                Some(body) => Ok(ProbeResponse {
                    status: 200,
                    body: body.clone(),
                }),
                None => Err(anyhow::anyhow!("connection refused")),
            }
        }
    }

    fn item() -> WorkItem {
        WorkItem::new(1, "198.51.100.7".to_string(), 3128, None)
    }

    #[test]
    fn test_echoed_headers_normalised() {
        let headers = echoed_headers(AZENV_BODY);
        assert!(headers.contains("USER-AGENT"));
        assert!(headers.contains("REMOTE-ADDR"));

        let json = "{\n  \"headers\": {\n    \"User-Agent\": \"x\",\n    \"Via\": \"1.1 squid\"\n  }\n}";
        let headers = echoed_headers(json);
        assert!(headers.contains("USER-AGENT"));
        assert!(headers.contains("VIA"));
    }

    #[test]
    fn test_anonymity_classification() {
        let checker = Checker::new(Arc::new(ScriptedProber::default()), Some("192.0.2.1".to_string()));
        assert_eq!(
            checker.classify("REMOTE_ADDR = 192.0.2.1\nHTTP_USER_AGENT = x"),
            AnonymityLevel::Transparent
        );
        assert_eq!(
            checker.classify("HTTP_USER_AGENT = x\nHTTP_X_FORWARDED_FOR = unknown"),
            AnonymityLevel::Anonymous
        );
        assert_eq!(checker.classify(AZENV_BODY), AnonymityLevel::Elite);
    }

    #[test]
    fn test_validation_prefers_judge_regex() {
        let checker = Checker::new(Arc::new(ScriptedProber::default()), None);
        let plain = Judge::new("http://judge.example/azenv.php", None).unwrap();
        let strict = Judge::new("http://judge.example/azenv.php", Some("REMOTE_ADDR = 203")).unwrap();
        assert!(checker.validate(&plain, AZENV_BODY));
        assert!(!checker.validate(&plain, "<html>blocked</html>"));
        assert!(checker.validate(&strict, AZENV_BODY));
        assert!(!checker.validate(&strict, "HTTP_USER_AGENT = x"));
    }

    #[tokio::test]
    async fn test_run_check_retries_until_success() {
        let prober = Arc::new(ScriptedProber::always(AZENV_BODY));
        prober.push(Err(anyhow::anyhow!("reset by peer")));
        prober.push(Ok(ProbeResponse {
            status: 502,
            body: String::new(),
        }));
        let checker = Checker::new(prober.clone(), None);
        let judge = Judge::new("http://judge.example/", None).unwrap();

        let outcome = checker
            .run_check(
                &CancellationToken::new(),
                &item(),
                Protocol::Socks5,
                &judge,
                Duration::from_secs(1),
                2,
            )
            .await
            .unwrap();
        assert!(outcome.alive);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.anonymity, Some(AnonymityLevel::Elite));
        let calls = prober.calls.lock().unwrap();
        assert_eq!(calls[0].proxy_url, "socks5://198.51.100.7:3128");
    }

    #[tokio::test]
    async fn test_run_check_reports_last_error() {
        let prober = Arc::new(ScriptedProber::default());
        let checker = Checker::new(prober.clone(), None);
        let judge = Judge::new("http://judge.example/", None).unwrap();
        let outcome = checker
            .run_check(
                &CancellationToken::new(),
                &item(),
                Protocol::Http,
                &judge,
                Duration::from_secs(1),
                1,
            )
            .await
            .unwrap();
        assert!(!outcome.alive);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.error.as_deref(), Some("connection refused"));
        assert_eq!(prober.call_count(), 2);
    }

    #[tokio::test]
    async fn test_run_check_cancelled() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let checker = Checker::new(Arc::new(ScriptedProber::always(AZENV_BODY)), None);
        let judge = Judge::new("http://judge.example/", None).unwrap();
        let err = checker
            .run_check(&ctx, &item(), Protocol::Http, &judge, Duration::from_secs(1), 0)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_check_many_keeps_every_proxy() {
        let checker = Checker::new(Arc::new(ScriptedProber::always(AZENV_BODY)), None);
        let judge = Judge::new("http://judge.example/", None).unwrap();
        let proxies = vec![
            Proxy::new("192.0.2.10".to_string(), 80, Protocol::Http),
            Proxy::new("192.0.2.11".to_string(), 1080, Protocol::Socks5),
        ];
        let results = checker
            .check_many(&CancellationToken::new(), proxies, &judge, Duration::from_secs(1), 0, 4)
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, o)| o.alive));
    }
}
