//! Per-request conditional-cache decision.

use std::sync::Arc;
use std::time::Instant;

use axum::http::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method};
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, field, instrument, warn};
use uuid::Uuid;

use super::aggregate::{VersionBufferPool, fetch_fingerprint};
use super::error::TrackerError;
use super::etag::{BuildEpoch, build_etag, etag_matches};
use super::hasher::{HasherKind, VersionHasher};
use super::options::{
    CacheOptions, ImmutableCacheOptions, OptionsBuilder, OptionsCache, OptionsSlot, RequestFilter,
    TrackSpec,
};

pub const METRIC_NOT_MODIFIED: &str = "tracker_not_modified_total";
pub const METRIC_ETAG_ISSUED: &str = "tracker_etag_issued_total";
pub const METRIC_PASS_THROUGH: &str = "tracker_pass_through_total";
pub const METRIC_ERROR: &str = "tracker_error_total";
pub const METRIC_FETCH_MS: &str = "tracker_fetch_ms";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Outcome of [`Coordinator::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The client copy is current; answer 304 without running the handler.
    NotModified { etag: String },
    PassThrough,
}

/// Why a request skipped the conditional-cache pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Method,
    EtagPresent,
    ResponseDirective,
    RequestDirective,
    Filtered,
    Unconditional,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Method => "method",
            SkipReason::EtagPresent => "etag_present",
            SkipReason::ResponseDirective => "response_directive",
            SkipReason::RequestDirective => "request_directive",
            SkipReason::Filtered => "filtered",
            SkipReason::Unconditional => "unconditional",
        }
    }
}

/// A route's declarative tracking configuration.
///
/// Clones share the options slot, which is resolved from the coordinator's
/// cache once and read directly afterwards.
#[derive(Debug, Clone)]
pub struct TrackedEndpoint {
    spec: Arc<TrackSpec>,
    slot: Arc<OnceCell<Arc<OptionsSlot>>>,
}

impl TrackedEndpoint {
    pub fn new(spec: TrackSpec) -> Self {
        Self {
            spec: Arc::new(spec),
            slot: Arc::default(),
        }
    }

    /// Options published for this endpoint, read through its own slot.
    pub fn published(&self) -> Option<Arc<ImmutableCacheOptions>> {
        let slot = self.slot.get()?;
        OptionsSlot::latest(slot).get().cloned()
    }

    pub fn id(&self) -> &str {
        &self.spec.endpoint
    }

    pub fn spec(&self) -> &TrackSpec {
        &self.spec
    }
}

/// Deployment-wide coordinator knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub epoch: BuildEpoch,
    pub hasher: HasherKind,
    pub pool_capacity: usize,
    /// Issue ETag/Cache-Control on requests without `If-None-Match`.
    pub emit_headers_without_condition: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            epoch: BuildEpoch::current(),
            hasher: HasherKind::default(),
            pool_capacity: 64,
            emit_headers_without_condition: true,
        }
    }
}

pub struct Coordinator {
    defaults: Arc<CacheOptions>,
    builder: OptionsBuilder,
    cache: Arc<OptionsCache>,
    hasher: Arc<dyn VersionHasher>,
    pool: VersionBufferPool,
    epoch: BuildEpoch,
    emit_headers_without_condition: bool,
}

impl Coordinator {
    pub fn new(
        defaults: CacheOptions,
        builder: OptionsBuilder,
        cache: Arc<OptionsCache>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            defaults: Arc::new(defaults),
            builder,
            cache,
            hasher: config.hasher.build(),
            pool: VersionBufferPool::new(config.pool_capacity),
            epoch: config.epoch,
            emit_headers_without_condition: config.emit_headers_without_condition,
        }
    }

    pub fn options_cache(&self) -> &Arc<OptionsCache> {
        &self.cache
    }

    pub fn epoch(&self) -> &BuildEpoch {
        &self.epoch
    }

    pub fn defaults(&self) -> &CacheOptions {
        &self.defaults
    }

    /// Build and publish an endpoint's options ahead of its first request so
    /// configuration errors surface at startup.
    pub fn prepare(&self, endpoint: &TrackedEndpoint) -> Result<(), TrackerError> {
        self.options_for(endpoint).map(|_| ())
    }

    /// Decide whether `request` can be answered with 304.
    ///
    /// `response_headers` holds headers already chosen by earlier stages; the
    /// coordinator adds `ETag` and `Cache-Control` to it whenever it computes
    /// a tag.
    #[instrument(
        skip_all,
        fields(endpoint = %endpoint.id(), request_id = field::Empty)
    )]
    pub async fn evaluate(
        &self,
        endpoint: &TrackedEndpoint,
        request: &Parts,
        response_headers: &mut HeaderMap,
        token: &CancellationToken,
    ) -> Result<Decision, TrackerError> {
        Span::current().record("request_id", field::display(correlation_id(request)));

        if let Some(reason) = self.skip_reason(endpoint, request, response_headers) {
            debug!(reason = reason.as_str(), "conditional cache skipped");
            counter!(METRIC_PASS_THROUGH, "reason" => reason.as_str()).increment(1);
            return Ok(Decision::PassThrough);
        }

        let result = self
            .decide(endpoint, request, response_headers, token)
            .await;

        match &result {
            Ok(Decision::NotModified { etag }) => {
                debug!(etag = %etag, "client copy is current");
                counter!(METRIC_NOT_MODIFIED).increment(1);
            }
            Ok(Decision::PassThrough) => {
                counter!(METRIC_ETAG_ISSUED).increment(1);
            }
            Err(err) => {
                warn!(kind = err.kind().as_str(), error = %err, "conditional cache failed");
                counter!(METRIC_ERROR, "kind" => err.kind().as_str()).increment(1);
            }
        }

        result
    }

    /// Gate checks, in order. Only raw configuration is consulted.
    fn skip_reason(
        &self,
        endpoint: &TrackedEndpoint,
        request: &Parts,
        response_headers: &HeaderMap,
    ) -> Option<SkipReason> {
        if request.method != Method::GET {
            return Some(SkipReason::Method);
        }

        if response_headers.contains_key(ETAG) {
            return Some(SkipReason::EtagPresent);
        }

        if has_directive(
            response_headers,
            &self.defaults.invalid_response_directives,
        ) {
            return Some(SkipReason::ResponseDirective);
        }

        if has_directive(&request.headers, &self.defaults.invalid_request_directives) {
            return Some(SkipReason::RequestDirective);
        }

        if let Some(filter) = self.filter(endpoint)
            && !filter(request)
        {
            return Some(SkipReason::Filtered);
        }

        if !self.emit_headers_without_condition && !request.headers.contains_key(IF_NONE_MATCH) {
            return Some(SkipReason::Unconditional);
        }

        None
    }

    fn filter<'a>(&'a self, endpoint: &'a TrackedEndpoint) -> Option<&'a RequestFilter> {
        endpoint
            .spec()
            .filter
            .as_ref()
            .or(self.defaults.filter.as_ref())
    }

    async fn decide(
        &self,
        endpoint: &TrackedEndpoint,
        request: &Parts,
        response_headers: &mut HeaderMap,
        token: &CancellationToken,
    ) -> Result<Decision, TrackerError> {
        let options = self.options_for(endpoint)?;
        let source = options.provider.source_for(request)?;

        let started = Instant::now();
        let fingerprint = fetch_fingerprint(
            source.as_ref(),
            &options.tables,
            self.hasher.as_ref(),
            &self.pool,
            token,
        )
        .await?;
        histogram!(METRIC_FETCH_MS, "source" => source.id().to_string())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let epoch = self.epoch.as_str();
        let suffix = options.suffix_for(request);
        let current = request
            .headers
            .get_all(IF_NONE_MATCH)
            .iter()
            .any(|value| if_none_match_hits(value, epoch, fingerprint, &suffix));

        let etag = build_etag(epoch, fingerprint, &suffix);
        response_headers.insert(ETAG, HeaderValue::from_str(&etag)?);
        response_headers.insert(CACHE_CONTROL, options.cache_control.clone());

        if current {
            return Ok(Decision::NotModified { etag });
        }

        debug!(etag = %etag, fingerprint, "issued fresh etag");
        Ok(Decision::PassThrough)
    }

    fn options_for(
        &self,
        endpoint: &TrackedEndpoint,
    ) -> Result<Arc<ImmutableCacheOptions>, TrackerError> {
        let slot = endpoint
            .slot
            .get_or_init(|| self.cache.slot(endpoint.id()));
        self.cache.get_or_build_in(slot, || {
            self.builder.build(&self.defaults, endpoint.spec())
        })
    }
}

/// Trimmed, non-empty `x-request-id` from `headers`.
pub fn inbound_request_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Inbound `x-request-id`, or a fresh v4 uuid.
pub fn correlation_id(request: &Parts) -> String {
    inbound_request_id(&request.headers)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// True if any `Cache-Control` value in `headers` names one of `directives`.
fn has_directive(headers: &HeaderMap, directives: &[String]) -> bool {
    if directives.is_empty() {
        return false;
    }
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.split('=').next().unwrap_or_default().trim())
        .any(|name| {
            directives
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(name))
        })
}

/// Match one `If-None-Match` header value (a comma-separated list of tags,
/// each optionally quoted and weak) against the current tag.
fn if_none_match_hits(value: &HeaderValue, epoch: &str, fingerprint: u64, suffix: &str) -> bool {
    let Ok(value) = value.to_str() else {
        return false;
    };
    value.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        let candidate = candidate
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(candidate);
        etag_matches(candidate, epoch, fingerprint, suffix)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::Request;

    use super::*;
    use crate::tracker::options::StaticTableNames;
    use crate::tracker::registry::ProviderRegistry;
    use crate::tracker::resolver::ProviderResolver;
    use crate::tracker::source::VersionSource;
    use crate::tracker::testing::FakeSource;

    const EPOCH: &str = "638123456789000000";

    struct Harness {
        source: Arc<FakeSource>,
        coordinator: Coordinator,
    }

    fn harness_with(source: FakeSource, defaults: CacheOptions, emit: bool) -> Harness {
        let source = Arc::new(source);
        let registry = ProviderRegistry::new(vec![Arc::clone(&source) as Arc<dyn VersionSource>])
            .expect("registry");
        let builder = OptionsBuilder::new(
            ProviderResolver::new(Arc::new(registry)),
            Arc::new(StaticTableNames::default()),
        );
        let config = CoordinatorConfig {
            epoch: BuildEpoch::new(EPOCH).expect("epoch"),
            emit_headers_without_condition: emit,
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::new(defaults, builder, Arc::new(OptionsCache::new()), config);
        Harness {
            source,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(
            FakeSource::new("pg")
                .with_version("posts", 42)
                .with_version("comments", 200),
            CacheOptions::default(),
            true,
        )
    }

    fn posts() -> TrackedEndpoint {
        TrackedEndpoint::new(TrackSpec::new("posts").tables(["posts"]))
    }

    fn get(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(Method::GET).uri("/api/posts");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).expect("request").into_parts().0
    }

    async fn evaluate(
        harness: &Harness,
        endpoint: &TrackedEndpoint,
        request: &Parts,
        headers: &mut HeaderMap,
    ) -> Result<Decision, TrackerError> {
        harness
            .coordinator
            .evaluate(endpoint, request, headers, &CancellationToken::new())
            .await
    }

    fn assert_untouched(harness: &Harness) {
        assert_eq!(harness.source.total_calls(), 0);
        assert_eq!(harness.coordinator.options_cache().builds(), 0);
    }

    #[tokio::test]
    async fn non_get_requests_pass_through_untouched() {
        let harness = harness();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/posts")
            .body(())
            .expect("request")
            .into_parts()
            .0;
        let mut headers = HeaderMap::new();

        let decision = evaluate(&harness, &posts(), &request, &mut headers)
            .await
            .expect("decision");

        assert_eq!(decision, Decision::PassThrough);
        assert!(headers.is_empty());
        assert_untouched(&harness);
    }

    #[tokio::test]
    async fn existing_etag_is_never_overwritten() {
        let harness = harness();
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"upstream\""));

        let decision = evaluate(&harness, &posts(), &get(&[]), &mut headers)
            .await
            .expect("decision");

        assert_eq!(decision, Decision::PassThrough);
        assert_eq!(headers.get(ETAG).expect("etag"), "\"upstream\"");
        assert_untouched(&harness);
    }

    #[tokio::test]
    async fn immutable_or_no_store_response_passes_through() {
        for value in ["public, IMMUTABLE", "no-store", "max-age=0, no-store"] {
            let harness = harness();
            let mut headers = HeaderMap::new();
            headers.insert(CACHE_CONTROL, HeaderValue::from_static(value));

            let decision = evaluate(&harness, &posts(), &get(&[]), &mut headers)
                .await
                .expect("decision");

            assert_eq!(decision, Decision::PassThrough, "{value}");
            assert!(!headers.contains_key(ETAG));
            assert_untouched(&harness);
        }
    }

    #[tokio::test]
    async fn invalid_request_directive_passes_through() {
        let harness = harness_with(
            FakeSource::new("pg").with_version("posts", 42),
            CacheOptions {
                invalid_request_directives: vec!["no-store".into()],
                ..CacheOptions::default()
            },
            true,
        );
        let mut headers = HeaderMap::new();

        let decision = evaluate(
            &harness,
            &posts(),
            &get(&[("cache-control", "no-store")]),
            &mut headers,
        )
        .await
        .expect("decision");

        assert_eq!(decision, Decision::PassThrough);
        assert_untouched(&harness);
    }

    #[tokio::test]
    async fn failing_filter_passes_through() {
        let harness = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let endpoint = TrackedEndpoint::new(TrackSpec::new("posts").tables(["posts"]).filter(
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                false
            },
        ));
        let mut headers = HeaderMap::new();

        let decision = evaluate(&harness, &endpoint, &get(&[]), &mut headers)
            .await
            .expect("decision");

        assert_eq!(decision, Decision::PassThrough);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_untouched(&harness);
    }

    #[tokio::test]
    async fn fresh_request_gets_etag_and_cache_control() {
        let harness = harness();
        let mut headers = HeaderMap::new();

        let decision = evaluate(&harness, &posts(), &get(&[]), &mut headers)
            .await
            .expect("decision");

        assert_eq!(decision, Decision::PassThrough);
        assert_eq!(headers.get(ETAG).expect("etag"), "638123456789000000-42");
        assert_eq!(headers.get(CACHE_CONTROL).expect("cache-control"), "no-cache");
        assert_eq!(harness.source.single_calls(), 1);
    }

    #[tokio::test]
    async fn matching_if_none_match_is_not_modified() {
        let harness = harness();
        let mut headers = HeaderMap::new();

        let decision = evaluate(
            &harness,
            &posts(),
            &get(&[("if-none-match", "638123456789000000-42")]),
            &mut headers,
        )
        .await
        .expect("decision");

        assert_eq!(
            decision,
            Decision::NotModified {
                etag: "638123456789000000-42".into()
            }
        );
        assert_eq!(headers.get(ETAG).expect("etag"), "638123456789000000-42");
    }

    #[tokio::test]
    async fn if_none_match_list_quotes_and_weak_tags() {
        let harness = harness();
        let request = get(&[(
            "if-none-match",
            "\"stale\", W/\"638123456789000000-42\"",
        )]);
        let mut headers = HeaderMap::new();

        let decision = evaluate(&harness, &posts(), &request, &mut headers)
            .await
            .expect("decision");

        assert!(matches!(decision, Decision::NotModified { .. }));
    }

    #[tokio::test]
    async fn stale_if_none_match_issues_new_tag() {
        let harness = harness();
        let mut headers = HeaderMap::new();

        let decision = evaluate(
            &harness,
            &posts(),
            &get(&[("if-none-match", "638123456789000000-41")]),
            &mut headers,
        )
        .await
        .expect("decision");

        assert_eq!(decision, Decision::PassThrough);
        assert_eq!(headers.get(ETAG).expect("etag"), "638123456789000000-42");
    }

    #[tokio::test]
    async fn suffix_diversifies_the_tag() {
        let harness = harness();
        let endpoint = TrackedEndpoint::new(
            TrackSpec::new("posts")
                .tables(["posts"])
                .suffix(|parts| {
                    parts
                        .headers
                        .get("x-tenant")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
        );
        let mut headers = HeaderMap::new();

        evaluate(&harness, &endpoint, &get(&[("x-tenant", "v2")]), &mut headers)
            .await
            .expect("decision");

        assert_eq!(headers.get(ETAG).expect("etag"), "638123456789000000-42-v2");
    }

    #[tokio::test]
    async fn two_tables_use_the_hashed_fingerprint() {
        let harness = harness_with(
            FakeSource::new("pg")
                .with_version("posts", 100)
                .with_version("comments", 200),
            CacheOptions::default(),
            true,
        );
        let endpoint = TrackedEndpoint::new(TrackSpec::new("feed").tables(["posts", "comments"]));
        let mut headers = HeaderMap::new();

        evaluate(&harness, &endpoint, &get(&[]), &mut headers)
            .await
            .expect("decision");

        assert_eq!(
            headers.get(ETAG).expect("etag"),
            "638123456789000000-16317240904892736713"
        );
        assert_eq!(harness.source.multi_calls(), 1);
    }

    #[tokio::test]
    async fn options_are_built_once_across_requests() {
        let harness = harness();
        let endpoint = posts();
        for _ in 0..3 {
            let mut headers = HeaderMap::new();
            evaluate(&harness, &endpoint, &get(&[]), &mut headers)
                .await
                .expect("decision");
        }
        assert_eq!(harness.coordinator.options_cache().builds(), 1);
        assert_eq!(harness.source.single_calls(), 3);
    }

    #[tokio::test]
    async fn prepared_endpoint_reads_its_own_slot() {
        let harness = harness();
        let endpoint = posts();
        assert!(endpoint.published().is_none());

        harness.coordinator.prepare(&endpoint).expect("prepare");
        let published = endpoint.published().expect("published");
        assert_eq!(published.tables, vec!["posts"]);

        // Clones carried into per-request state share the slot.
        let clone = endpoint.clone();
        let mut headers = HeaderMap::new();
        evaluate(&harness, &clone, &get(&[]), &mut headers)
            .await
            .expect("decision");
        assert!(Arc::ptr_eq(&published, &clone.published().expect("published")));
        assert_eq!(harness.coordinator.options_cache().builds(), 1);

        assert!(harness.coordinator.options_cache().invalidate("posts"));
        assert!(endpoint.published().is_none());
        evaluate(&harness, &endpoint, &get(&[]), &mut HeaderMap::new())
            .await
            .expect("decision");
        assert_eq!(harness.coordinator.options_cache().builds(), 2);
    }

    #[tokio::test]
    async fn unconditional_requests_skip_when_emission_disabled() {
        let harness = harness_with(
            FakeSource::new("pg").with_version("posts", 42),
            CacheOptions::default(),
            false,
        );
        let mut headers = HeaderMap::new();

        let decision = evaluate(&harness, &posts(), &get(&[]), &mut headers)
            .await
            .expect("decision");
        assert_eq!(decision, Decision::PassThrough);
        assert!(headers.is_empty());
        assert_untouched(&harness);

        let decision = evaluate(
            &harness,
            &posts(),
            &get(&[("if-none-match", "638123456789000000-42")]),
            &mut headers,
        )
        .await
        .expect("decision");
        assert!(matches!(decision, Decision::NotModified { .. }));
    }

    #[tokio::test]
    async fn backend_failure_is_surfaced() {
        let harness = harness();
        let endpoint = TrackedEndpoint::new(TrackSpec::new("ghost").tables(["ghost"]));
        let mut headers = HeaderMap::new();

        let err = evaluate(&harness, &endpoint, &get(&[]), &mut headers)
            .await
            .unwrap_err();

        assert!(matches!(err, TrackerError::Source { .. }));
        assert!(!headers.contains_key(ETAG));
    }

    #[tokio::test]
    async fn unknown_provider_is_configuration_error() {
        let harness = harness();
        let endpoint = TrackedEndpoint::new(TrackSpec::new("posts").provider("redis"));
        let mut headers = HeaderMap::new();

        let err = evaluate(&harness, &endpoint, &get(&[]), &mut headers)
            .await
            .unwrap_err();

        assert!(matches!(err, TrackerError::ProviderNotFound { .. }));
        assert_eq!(harness.source.total_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_its_own_outcome() {
        let harness = harness_with(
            FakeSource::new("pg").with_version("posts", 42).stalled(),
            CacheOptions::default(),
            true,
        );
        let token = CancellationToken::new();
        token.cancel();
        let mut headers = HeaderMap::new();

        let err = harness
            .coordinator
            .evaluate(
                &posts(),
                &get(&[("if-none-match", "638123456789000000-42")]),
                &mut headers,
                &token,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TrackerError::Cancelled));
        assert!(!headers.contains_key(ETAG));
    }

    #[test]
    fn correlation_id_prefers_inbound_header() {
        assert_eq!(correlation_id(&get(&[("x-request-id", "abc")])), "abc");
        assert_eq!(correlation_id(&get(&[])).len(), 36);
        assert_eq!(correlation_id(&get(&[("x-request-id", "  ")])).len(), 36);
        assert_eq!(
            inbound_request_id(&get(&[("x-request-id", " req-7 ")]).headers),
            Some("req-7")
        );
    }
}
