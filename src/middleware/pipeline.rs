//! Framework-neutral request-filtering pipeline.
//!
//! Owns the rule lists (safelists, blocklists, fail2bans, allow2bans,
//! throttles, trackers) and runs them in the fixed seven-step order; Axum
//! and Actix-web adapters (`crate::middleware::layer`,
//! `crate::middleware::actix`) wrap a `MiddlewareConfig` and translate its
//! `RenderedResponse` into their native response type.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::breaker::CircuitBreaker;
use crate::decision::RateLimitInfo;
use crate::error::Result;
use crate::instrument::{null_sink, InstrumentSink, Payload};
use crate::key::{HasIpAddr, Key};
use crate::rule::{QuotaSource, RateAlgorithm, Rule, RuleOutcome};
use crate::storage::Storage;

/// A minimal, framework-neutral HTTP response.
///
/// Default renderers produce one of these; adapters convert it into
/// `axum::http::Response` or `actix_web::HttpResponse`.
#[derive(Debug, Clone)]
pub struct RenderedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RenderedResponse {
    fn json(status: u16, body: String) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body,
        }
    }
}

type Responder<R> = Arc<dyn Fn(&R, &RuleOutcome) -> RenderedResponse + Send + Sync>;

/// The pipeline's admission decision for one request.
#[derive(Debug)]
pub enum Verdict {
    /// Delegate to the downstream handler.
    Allow,
    /// A blocklist or fail2ban matched; render the blocklisted response.
    Block(RenderedResponse),
    /// A throttle rejected the request; render the throttled response.
    Throttle(RenderedResponse),
}

/// Owned, cloneable middleware configuration.
///
/// Built through a small DSL; rule ordering within a category is not
/// observable and must not be relied on.
pub struct MiddlewareConfig<R> {
    enabled: bool,
    safelists: Vec<Rule<R>>,
    blocklists: Vec<Rule<R>>,
    allow2bans: Vec<Rule<R>>,
    throttles: Vec<Rule<R>>,
    trackers: Vec<Rule<R>>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    throttled_responder: Option<Responder<R>>,
    blocklisted_responder: Option<Responder<R>>,
    instrument: InstrumentSink,
}

impl<R> Default for MiddlewareConfig<R> {
    fn default() -> Self {
        Self {
            enabled: true,
            safelists: Vec::new(),
            blocklists: Vec::new(),
            allow2bans: Vec::new(),
            throttles: Vec::new(),
            trackers: Vec::new(),
            breakers: HashMap::new(),
            throttled_responder: None,
            blocklisted_responder: None,
            instrument: null_sink(),
        }
    }
}

impl<R: 'static> MiddlewareConfig<R> {
    /// Create an empty, enabled configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Globally disable the pipeline; every request delegates unchanged.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn safelist(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&R) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.safelists.push(Rule::safelist(name, predicate));
        self
    }

    pub fn blocklist(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&R) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.blocklists.push(Rule::blocklist(name, predicate));
        self
    }

    pub fn throttle(
        mut self,
        name: impl Into<String>,
        key: impl Key<R>,
        quota: impl Into<QuotaSource<R>>,
        algorithm: RateAlgorithm,
    ) -> Self {
        self.throttles.push(Rule::throttle(name, key, quota, algorithm));
        self
    }

    pub fn track(
        mut self,
        name: impl Into<String>,
        key: impl Key<R>,
        quota: impl Into<QuotaSource<R>>,
        algorithm: RateAlgorithm,
    ) -> Self {
        self.trackers.push(Rule::track(name, key, quota, algorithm));
        self
    }

    /// Register a fail2ban rule. Its breaker is kept under `name` so a
    /// later `.allow2ban(..., name, ...)` can pair with it.
    pub fn fail2ban(
        mut self,
        name: impl Into<String>,
        key: impl Key<R>,
        max_retry: u32,
        find_time: Duration,
        ban_time: Duration,
    ) -> Self {
        let name = name.into();
        let rule = Rule::fail2ban(name.clone(), key, max_retry, find_time, ban_time);
        if let Rule::Fail2Ban { breaker, .. } = &rule {
            self.breakers.insert(name, breaker.clone());
        }
        self.blocklists.push(rule);
        self
    }

    /// Register an allow2ban rule paired with a fail2ban rule already added
    /// under `fail2ban_name`.
    ///
    /// # Panics
    ///
    /// Panics if no fail2ban rule with that name was registered first; this
    /// is a configuration-time error, not something that can vary per
    /// request.
    pub fn allow2ban(
        mut self,
        name: impl Into<String>,
        key: impl Key<R>,
        fail2ban_name: &str,
        max_count: u64,
        find_time: Duration,
    ) -> Self {
        let name = name.into();
        let breaker = self
            .breakers
            .get(fail2ban_name)
            .unwrap_or_else(|| {
                panic!("allow2ban `{name}` paired with unknown fail2ban rule `{fail2ban_name}`")
            })
            .clone();
        self.allow2bans
            .push(Rule::allow2ban(name, key, breaker, max_count, find_time));
        self
    }

    /// Override the 429 response rendered when a throttle matches.
    pub fn throttled_responder(
        mut self,
        f: impl Fn(&R, &RuleOutcome) -> RenderedResponse + Send + Sync + 'static,
    ) -> Self {
        self.throttled_responder = Some(Arc::new(f));
        self
    }

    /// Override the 403 response rendered when a blocklist/fail2ban matches.
    pub fn blocklisted_responder(
        mut self,
        f: impl Fn(&R, &RuleOutcome) -> RenderedResponse + Send + Sync + 'static,
    ) -> Self {
        self.blocklisted_responder = Some(Arc::new(f));
        self
    }

    /// Set the sink that receives a structured event at every terminal
    /// verdict (safelisted/blocklisted/throttled). Defaults to a no-op.
    pub fn instrument(mut self, sink: impl crate::instrument::Instrument + 'static) -> Self {
        self.instrument = Arc::new(sink);
        self
    }

    /// Push a host-observed failure/success into the named fail2ban rule's
    /// breaker (e.g. after the downstream handler returns a 404).
    pub fn record_fail2ban_outcome(&self, name: &str, did_fail: bool) {
        if let Some(rule) = self.blocklists.iter().find(|r| r.name() == name) {
            rule.record_outcome(did_fail);
        }
    }

    /// Run the seven-step evaluation order against `request`.
    ///
    /// `entered` is the re-entry guard (step 1): callers mark the request
    /// as entered through whatever request-scoped storage their framework
    /// provides and pass the current value in; re-entrant calls delegate
    /// unchanged without touching storage at all.
    pub async fn evaluate<S: Storage>(&self, request: &R, storage: &S, entered: bool) -> Result<Verdict> {
        if entered || !self.enabled {
            return Ok(Verdict::Allow);
        }

        for rule in &self.safelists {
            if matches!(rule.evaluate(request, storage).await?, RuleOutcome::Safelisted { .. }) {
                self.instrument
                    .instrument("pipeline.safelisted", Payload::new().with("rule", rule.name()));
                return Ok(Verdict::Allow);
            }
        }

        for rule in &self.blocklists {
            let outcome = rule.evaluate(request, storage).await?;
            if let RuleOutcome::Blocklisted { fail2ban, .. } = &outcome {
                let mut payload = Payload::new().with("rule", rule.name());
                if let Some(fail2ban) = fail2ban {
                    payload = payload
                        .with("discriminator", &fail2ban.discriminator)
                        .with("maxretry", fail2ban.maxretry)
                        .with("findtime_ms", fail2ban.findtime.as_millis())
                        .with("bantime_ms", fail2ban.bantime.as_millis())
                        .with("failures", fail2ban.failures)
                        .with("time_until_unban_ms", fail2ban.time_until_unban.as_millis());
                }
                self.instrument.instrument("pipeline.blocklisted", payload);
                return Ok(Verdict::Block(self.render_blocklisted(request, &outcome)));
            }
        }

        for rule in &self.allow2bans {
            rule.evaluate(request, storage).await?;
        }

        for rule in &self.throttles {
            let outcome = rule.evaluate(request, storage).await?;
            if let RuleOutcome::Throttled {
                discriminator,
                limit,
                remaining,
                retry_after,
                ..
            } = &outcome
            {
                self.instrument.instrument(
                    "pipeline.throttled",
                    Payload::new()
                        .with("rule", rule.name())
                        .with("discriminator", discriminator)
                        .with("limit", limit)
                        .with("remaining", remaining)
                        .with("retry_after_ms", retry_after.as_millis()),
                );
                return Ok(Verdict::Throttle(self.render_throttled(request, &outcome)));
            }
        }

        for rule in &self.trackers {
            rule.evaluate(request, storage).await?;
        }

        Ok(Verdict::Allow)
    }

    fn render_blocklisted(&self, request: &R, outcome: &RuleOutcome) -> RenderedResponse {
        if let Some(responder) = &self.blocklisted_responder {
            return responder(request, outcome);
        }
        RenderedResponse::json(403, r#"{"error":"Forbidden"}"#.to_string())
    }

    fn render_throttled(&self, request: &R, outcome: &RuleOutcome) -> RenderedResponse {
        if let Some(responder) = &self.throttled_responder {
            return responder(request, outcome);
        }
        let RuleOutcome::Throttled {
            limit,
            remaining,
            retry_after,
            ..
        } = outcome
        else {
            return RenderedResponse::json(429, r#"{"error":"Too Many Requests"}"#.to_string());
        };

        let now = Instant::now();
        let info = RateLimitInfo::new(*limit, *remaining, now + *retry_after, now).with_retry_after(*retry_after);

        let mut response = RenderedResponse::json(
            429,
            format!(
                r#"{{"error":"Too Many Requests","retry_after":{},"remaining":{},"limit":{}}}"#,
                retry_after.as_secs(),
                remaining,
                limit
            ),
        );
        for (name, value) in info.to_headers() {
            response.headers.push((name.to_string(), value));
        }
        response
    }
}

impl<R: 'static + HasIpAddr> MiddlewareConfig<R> {
    /// Safelist a fixed set of client IPs.
    pub fn safelist_ip(mut self, name: impl Into<String>, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let ips: std::collections::HashSet<IpAddr> = ips.into_iter().collect();
        self.safelists
            .push(Rule::safelist(name, move |r: &R| r.client_ip().is_some_and(|ip| ips.contains(&ip))));
        self
    }

    /// Blocklist a fixed set of client IPs.
    pub fn blocklist_ip(mut self, name: impl Into<String>, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let ips: std::collections::HashSet<IpAddr> = ips.into_iter().collect();
        self.blocklists
            .push(Rule::blocklist(name, move |r: &R| r.client_ip().is_some_and(|ip| ips.contains(&ip))));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StaticKey;
    use crate::quota::Quota;
    use crate::storage::MemoryStorage;
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Clone, Copy)]
    struct Req {
        ip: IpAddr,
    }

    impl HasIpAddr for Req {
        fn client_ip(&self) -> Option<IpAddr> {
            Some(self.ip)
        }
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[tokio::test]
    async fn test_safelist_short_circuits_before_blocklist() {
        let storage = MemoryStorage::new();
        let config: MiddlewareConfig<Req> = MiddlewareConfig::new()
            .safelist_ip("trusted", [ip(1, 2, 3, 4)])
            .blocklist_ip("banned", [ip(1, 2, 3, 4)]);

        let verdict = config.evaluate(&Req { ip: ip(1, 2, 3, 4) }, &storage, false).await.unwrap();
        assert!(matches!(verdict, Verdict::Allow));
    }

    #[tokio::test]
    async fn test_blocklist_ip_returns_403() {
        let storage = MemoryStorage::new();
        let config: MiddlewareConfig<Req> = MiddlewareConfig::new().blocklist_ip("banned", [ip(1, 2, 3, 4)]);

        let verdict = config.evaluate(&Req { ip: ip(1, 2, 3, 4) }, &storage, false).await.unwrap();
        match verdict {
            Verdict::Block(resp) => assert_eq!(resp.status, 403),
            other => panic!("expected Block, got {other:?}"),
        }

        let verdict = config.evaluate(&Req { ip: ip(5, 6, 7, 8) }, &storage, false).await.unwrap();
        assert!(matches!(verdict, Verdict::Allow));
    }

    #[tokio::test]
    async fn test_throttle_returns_429_with_retry_after() {
        let storage = MemoryStorage::new();
        let config: MiddlewareConfig<Req> = MiddlewareConfig::new().throttle(
            "api",
            StaticKey::new("user:1"),
            Quota::per_minute(1),
            RateAlgorithm::FixedWindow,
        );
        let req = Req { ip: ip(9, 9, 9, 9) };

        let first = config.evaluate(&req, &storage, false).await.unwrap();
        assert!(matches!(first, Verdict::Allow));

        let second = config.evaluate(&req, &storage, false).await.unwrap();
        match second {
            Verdict::Throttle(resp) => {
                assert_eq!(resp.status, 429);
                assert!(resp.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("retry-after")));
                assert!(resp.headers.iter().any(|(k, _)| k == "X-RateLimit-Limit"));
                assert!(resp.headers.iter().any(|(k, _)| k == "X-RateLimit-Remaining"));
            }
            other => panic!("expected Throttle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_pipeline_always_allows() {
        let storage = MemoryStorage::new();
        let config: MiddlewareConfig<Req> = MiddlewareConfig::new()
            .disabled()
            .blocklist_ip("banned", [ip(1, 2, 3, 4)]);

        let verdict = config.evaluate(&Req { ip: ip(1, 2, 3, 4) }, &storage, false).await.unwrap();
        assert!(matches!(verdict, Verdict::Allow));
    }

    #[tokio::test]
    async fn test_re_entry_guard_skips_evaluation() {
        let storage = MemoryStorage::new();
        let config: MiddlewareConfig<Req> = MiddlewareConfig::new().blocklist_ip("banned", [ip(1, 2, 3, 4)]);

        let verdict = config.evaluate(&Req { ip: ip(1, 2, 3, 4) }, &storage, true).await.unwrap();
        assert!(matches!(verdict, Verdict::Allow));
    }

    #[tokio::test]
    async fn test_fail2ban_then_allow2ban_resets() {
        let storage = MemoryStorage::new();
        let config: MiddlewareConfig<Req> = MiddlewareConfig::new()
            .fail2ban(
                "abuse",
                StaticKey::new("1.2.3.4"),
                3,
                Duration::from_secs(60),
                Duration::from_secs(300),
            )
            .allow2ban("heal", StaticKey::new("1.2.3.4"), "abuse", 1, Duration::from_secs(60));
        let req = Req { ip: ip(1, 2, 3, 4) };

        config.record_fail2ban_outcome("abuse", true);
        config.record_fail2ban_outcome("abuse", true);
        config.record_fail2ban_outcome("abuse", true);

        let verdict = config.evaluate(&req, &storage, false).await.unwrap();
        assert!(matches!(verdict, Verdict::Block(_)));
    }

    #[tokio::test]
    async fn test_custom_throttled_responder() {
        let storage = MemoryStorage::new();
        let config: MiddlewareConfig<Req> = MiddlewareConfig::new()
            .throttle(
                "api",
                StaticKey::new("user:1"),
                Quota::per_minute(1),
                RateAlgorithm::FixedWindow,
            )
            .throttled_responder(|_req, _outcome| RenderedResponse {
                status: 503,
                headers: Vec::new(),
                body: "slow down".to_string(),
            });
        let req = Req { ip: ip(9, 9, 9, 9) };

        config.evaluate(&req, &storage, false).await.unwrap();
        let verdict = config.evaluate(&req, &storage, false).await.unwrap();
        match verdict {
            Verdict::Throttle(resp) => assert_eq!(resp.status, 503),
            other => panic!("expected Throttle, got {other:?}"),
        }
    }
}
