use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backoff::BackoffExecutor;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::rate_limit::RateLimiter;
use crate::timezone::fallback_timezone;
use crate::venue::{OpeningPeriod, Provenance, RawVenueDetails};

const STATUS_OK: &str = "OK";
const STATUS_ZERO_RESULTS: &str = "ZERO_RESULTS";
const MAX_SEARCH_RADIUS_M: u32 = 50_000;
const FALLBACK_SUFFIXES: &[&str] = &["bar", "restaurant", "cafe"];
const DETAIL_FIELDS: &str = "place_id,name,formatted_address,vicinity,geometry,\
international_phone_number,formatted_phone_number,website,rating,user_ratings_total,\
price_level,types,business_status,opening_hours,photos,reviews";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlacePayload {
    pub place_id: Option<String>,
    pub name: Option<String>,
    pub formatted_address: Option<String>,
    pub vicinity: Option<String>,
    pub geometry: Option<PlaceGeometry>,
    pub international_phone_number: Option<String>,
    pub formatted_phone_number: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub user_ratings_total: Option<u32>,
    pub price_level: Option<u8>,
    pub types: Option<Vec<String>>,
    pub business_status: Option<String>,
    pub opening_hours: Option<OpeningHoursPayload>,
    pub photos: Option<Vec<PlacePhoto>>,
    pub reviews: Option<Vec<PlaceReview>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceGeometry {
    pub location: Option<PlaceLocation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceLocation {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpeningHoursPayload {
    pub periods: Option<Vec<OpeningPeriod>>,
    pub weekday_text: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacePhoto {
    pub photo_reference: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub html_attributions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceReview {
    pub author_name: Option<String>,
    pub rating: Option<f64>,
    pub text: Option<String>,
    pub time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationBias {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSearchRequest {
    pub query: String,
    pub location_bias: Option<LocationBias>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearbySearchRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: u32,
    pub category: String,
}

/// Raw access to the places directory. Implementations map transport and
/// API-status failures to errors; an empty result set is not an error.
#[async_trait]
pub trait PlacesApi: Send + Sync {
    async fn text_search(&self, request: &TextSearchRequest) -> AppResult<Vec<PlacePayload>>;
    async fn nearby_search(&self, request: &NearbySearchRequest) -> AppResult<Vec<PlacePayload>>;
    async fn place_details(&self, external_id: &str) -> AppResult<Option<PlacePayload>>;
    async fn timezone(&self, latitude: f64, longitude: f64, timestamp: i64) -> AppResult<String>;
}

pub struct HttpPlacesApi {
    http: reqwest::Client,
    api_key: SecretString,
    places_base: String,
    timezone_base: String,
}

impl HttpPlacesApi {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config
            .places_api_key
            .clone()
            .ok_or_else(|| AppError::Config("PLACES_API_KEY is not configured".into()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(concat!("venue-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_key,
            places_base: config.places_api_base.trim_end_matches('/').to_string(),
            timezone_base: config.timezone_api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        params: &[(&str, String)],
    ) -> AppResult<T> {
        let response = self
            .http
            .get(url)
            .query(params)
            .query(&[("key", self.api_key.expose_secret())])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlacePayload>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<PlacePayload>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimezoneResponse {
    status: String,
    time_zone_id: Option<String>,
    error_message: Option<String>,
}

fn check_status(status: &str, message: Option<String>) -> AppResult<()> {
    match status {
        STATUS_OK | STATUS_ZERO_RESULTS => Ok(()),
        other => Err(AppError::Api {
            status: other.to_string(),
            message: message.unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl PlacesApi for HttpPlacesApi {
    async fn text_search(&self, request: &TextSearchRequest) -> AppResult<Vec<PlacePayload>> {
        let mut params = vec![("query", request.query.clone())];
        if let Some(bias) = request.location_bias {
            params.push(("location", format!("{},{}", bias.latitude, bias.longitude)));
            params.push(("radius", bias.radius_m.to_string()));
        }
        let parsed: SearchResponse = self
            .get_json(format!("{}/textsearch/json", self.places_base), &params)
            .await?;
        check_status(&parsed.status, parsed.error_message)?;
        Ok(parsed.results)
    }

    async fn nearby_search(&self, request: &NearbySearchRequest) -> AppResult<Vec<PlacePayload>> {
        let params = [
            (
                "location",
                format!("{},{}", request.latitude, request.longitude),
            ),
            ("radius", request.radius_m.to_string()),
            ("type", request.category.clone()),
        ];
        let parsed: SearchResponse = self
            .get_json(format!("{}/nearbysearch/json", self.places_base), &params)
            .await?;
        check_status(&parsed.status, parsed.error_message)?;
        Ok(parsed.results)
    }

    async fn place_details(&self, external_id: &str) -> AppResult<Option<PlacePayload>> {
        let params = [
            ("place_id", external_id.to_string()),
            ("fields", DETAIL_FIELDS.to_string()),
        ];
        let parsed: DetailsResponse = self
            .get_json(format!("{}/details/json", self.places_base), &params)
            .await?;
        check_status(&parsed.status, parsed.error_message)?;
        Ok(parsed.result)
    }

    async fn timezone(&self, latitude: f64, longitude: f64, timestamp: i64) -> AppResult<String> {
        let params = [
            ("location", format!("{latitude},{longitude}")),
            ("timestamp", timestamp.to_string()),
        ];
        let parsed: TimezoneResponse = self
            .get_json(format!("{}/json", self.timezone_base), &params)
            .await?;
        if parsed.status != STATUS_OK {
            return Err(AppError::Api {
                status: parsed.status,
                message: parsed.error_message.unwrap_or_default(),
            });
        }
        parsed
            .time_zone_id
            .filter(|zone| !zone.trim().is_empty())
            .ok_or_else(|| AppError::Api {
                status: STATUS_OK.into(),
                message: "timezone response missing timeZoneId".into(),
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub attempted: Vec<String>,
    pub matched_query: Option<String>,
    pub results: Vec<RawVenueDetails>,
}

/// Rate-limited, retrying client for the places directory.
pub struct PlacesDirectoryClient {
    api: Arc<dyn PlacesApi>,
    limiter: RateLimiter,
    backoff: BackoffExecutor,
    detail_delay: Duration,
}

impl PlacesDirectoryClient {
    pub fn new(
        api: Arc<dyn PlacesApi>,
        limiter: RateLimiter,
        backoff: BackoffExecutor,
        detail_delay: Duration,
    ) -> Self {
        Self {
            api,
            limiter,
            backoff,
            detail_delay,
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let api = HttpPlacesApi::new(config)?;
        let limiter = RateLimiter::new(config.rate_limit_max_requests, config.rate_window())?;
        Ok(Self::new(
            Arc::new(api),
            limiter,
            BackoffExecutor::new(config.backoff_policy()),
            config.detail_delay(),
        ))
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Runs one API call under the rate limiter and the retry policy. Every
    /// attempt, including retries, consumes a slot in the window.
    async fn dispatch<T, F, Fut>(&self, operation: &'static str, call: F) -> AppResult<T>
    where
        F: Fn(Arc<dyn PlacesApi>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.backoff
            .execute_with(
                || {
                    let limiter = self.limiter.clone();
                    let request = call(Arc::clone(&self.api));
                    async move {
                        limiter.admit().await?;
                        request.await
                    }
                },
                |attempt, err| {
                    warn!(operation, attempt, error = %err, "places request failed; retrying");
                },
            )
            .await
    }

    /// Single text search with the query cleaned but no relaxation.
    pub async fn text_search(
        &self,
        query: &str,
        location_bias: Option<LocationBias>,
    ) -> AppResult<Vec<RawVenueDetails>> {
        let cleaned = clean_query(query);
        if cleaned.is_empty() {
            return Err(AppError::InvalidInput("search query is empty".into()));
        }
        if let Some(bias) = &location_bias {
            validate_coordinates(bias.latitude, bias.longitude)?;
            validate_radius(bias.radius_m)?;
        }
        let request = TextSearchRequest {
            query: cleaned,
            location_bias,
        };
        let payloads = self
            .dispatch("text_search", |api| {
                let request = request.clone();
                async move { api.text_search(&request).await }
            })
            .await?;
        Ok(normalize_all(payloads))
    }

    /// Searches, relaxing the query until something matches.
    pub async fn search_with_fallback(
        &self,
        query: &str,
        location_bias: Option<LocationBias>,
    ) -> AppResult<SearchOutcome> {
        let candidates = fallback_queries(query);
        if candidates.is_empty() {
            return Err(AppError::InvalidInput("search query is empty".into()));
        }

        let mut attempted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let results = self.text_search(&candidate, location_bias).await?;
            attempted.push(candidate.clone());
            if !results.is_empty() {
                if attempted.len() > 1 {
                    info!(query, matched = %candidate, "search matched after relaxing query");
                }
                return Ok(SearchOutcome {
                    attempted,
                    matched_query: Some(candidate),
                    results,
                });
            }
            debug!(query = %candidate, "search returned zero results");
        }

        warn!(query, "no results after exhausting fallback queries");
        Ok(SearchOutcome {
            attempted,
            matched_query: None,
            results: Vec::new(),
        })
    }

    pub async fn nearby_search(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: u32,
        category: &str,
    ) -> AppResult<Vec<RawVenueDetails>> {
        validate_coordinates(latitude, longitude)?;
        validate_radius(radius_m)?;
        let category = category.trim();
        if category.is_empty() {
            return Err(AppError::InvalidInput("nearby search category is empty".into()));
        }
        let request = NearbySearchRequest {
            latitude,
            longitude,
            radius_m,
            category: category.to_string(),
        };
        let payloads = self
            .dispatch("nearby_search", |api| {
                let request = request.clone();
                async move { api.nearby_search(&request).await }
            })
            .await?;
        Ok(normalize_all(payloads))
    }

    pub async fn place_details(&self, external_id: &str) -> AppResult<Option<RawVenueDetails>> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(AppError::InvalidInput("place identifier is empty".into()));
        }
        let payload = self
            .dispatch("place_details", |api| {
                let external_id = external_id.to_string();
                async move { api.place_details(&external_id).await }
            })
            .await?;
        Ok(payload.and_then(|place| RawVenueDetails::from_place(place, Provenance::PlacesApi)))
    }

    /// Fetches full details for up to `max_places` search hits, one at a
    /// time. A hit whose detail call fails is kept in its basic form.
    pub async fn hydrate(
        &self,
        basic: Vec<RawVenueDetails>,
        max_places: usize,
    ) -> Vec<RawVenueDetails> {
        let mut hydrated = Vec::with_capacity(basic.len().min(max_places));
        for (idx, entry) in basic.into_iter().take(max_places).enumerate() {
            if idx > 0 && !self.detail_delay.is_zero() {
                sleep(self.detail_delay).await;
            }
            match self.place_details(entry.external_id()).await {
                Ok(Some(mut details)) => {
                    if details.fields.coordinates().is_none() {
                        details.fields.latitude = entry.fields.latitude;
                        details.fields.longitude = entry.fields.longitude;
                    }
                    hydrated.push(details);
                }
                Ok(None) => {
                    warn!(
                        external_id = entry.external_id(),
                        "detail lookup returned nothing; keeping search result"
                    );
                    hydrated.push(entry);
                }
                Err(err) => {
                    warn!(
                        ?err,
                        external_id = entry.external_id(),
                        "detail lookup failed; keeping search result"
                    );
                    hydrated.push(entry);
                }
            }
        }
        hydrated
    }

    /// Always yields a zone: API failures fall back to the static table.
    pub async fn resolve_timezone(&self, latitude: f64, longitude: f64) -> String {
        let timestamp = Utc::now().timestamp();
        let result = self
            .dispatch("timezone", |api| async move {
                api.timezone(latitude, longitude, timestamp).await
            })
            .await;
        match result {
            Ok(zone) => zone,
            Err(err) => {
                let zone = fallback_timezone(latitude, longitude);
                warn!(?err, latitude, longitude, zone, "timezone lookup failed; using fallback table");
                zone.to_string()
            }
        }
    }
}

fn normalize_all(payloads: Vec<PlacePayload>) -> Vec<RawVenueDetails> {
    let total = payloads.len();
    let normalized: Vec<_> = payloads
        .into_iter()
        .filter_map(|place| RawVenueDetails::from_place(place, Provenance::PlacesApi))
        .collect();
    if normalized.len() < total {
        warn!(
            dropped = total - normalized.len(),
            "dropped search results without a place identifier"
        );
    }
    normalized
}

/// Drops parenthetical text and collapses whitespace.
pub fn clean_query(query: &str) -> String {
    let mut depth = 0_usize;
    let mut kept = String::with_capacity(query.len());
    for ch in query.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => kept.push(ch),
            _ => {}
        }
    }
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The relaxed queries tried in order: the cleaned query, the query with
/// each venue-type suffix, then its first word alone.
pub fn fallback_queries(query: &str) -> Vec<String> {
    let cleaned = clean_query(query);
    if cleaned.is_empty() {
        return Vec::new();
    }

    let mut candidates = vec![cleaned.clone()];
    candidates.extend(
        FALLBACK_SUFFIXES
            .iter()
            .map(|suffix| format!("{cleaned} {suffix}")),
    );
    if let Some(first) = cleaned.split_whitespace().next() {
        candidates.push(first.to_string());
    }

    let mut unique: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(&candidate) {
            unique.push(candidate);
        }
    }
    unique
}

fn validate_coordinates(latitude: f64, longitude: f64) -> AppResult<()> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(AppError::InvalidInput(format!(
            "coordinates out of range: {latitude},{longitude}"
        )));
    }
    Ok(())
}

fn validate_radius(radius_m: u32) -> AppResult<()> {
    if radius_m == 0 || radius_m > MAX_SEARCH_RADIUS_M {
        return Err(AppError::InvalidInput(format!(
            "search radius must be between 1 and {MAX_SEARCH_RADIUS_M} meters"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::testing::{place, ScriptedPlacesApi};
    use super::*;
    use crate::backoff::BackoffPolicy;

    fn client(api: Arc<ScriptedPlacesApi>, max_retries: u32) -> PlacesDirectoryClient {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries,
            ..BackoffPolicy::default()
        };
        PlacesDirectoryClient::new(
            api,
            RateLimiter::new(100, Duration::from_secs(1)).unwrap(),
            BackoffExecutor::with_rng(policy, StdRng::seed_from_u64(9)),
            Duration::from_millis(25),
        )
    }

    #[test]
    fn cleans_parentheticals_and_whitespace() {
        assert_eq!(clean_query("Foo (closed)"), "Foo");
        assert_eq!(clean_query("  The   Dead (old (location)) Rabbit "), "The Dead Rabbit");
        assert_eq!(clean_query("(only notes)"), "");
    }

    #[test]
    fn builds_fallback_queries_in_order() {
        assert_eq!(
            fallback_queries("Death & Co (East Village)"),
            vec![
                "Death & Co",
                "Death & Co bar",
                "Death & Co restaurant",
                "Death & Co cafe",
                "Death",
            ]
        );
        assert_eq!(
            fallback_queries("Foo (closed)"),
            vec!["Foo", "Foo bar", "Foo restaurant", "Foo cafe"]
        );
        assert!(fallback_queries("   ").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relaxes_query_until_results_appear() {
        let api = Arc::new(
            ScriptedPlacesApi::default().with_text("Foo cafe", vec![place("foo-1", "Foo Cafe")]),
        );
        let client = client(api.clone(), 2);

        let outcome = client.search_with_fallback("Foo (closed)", None).await.unwrap();

        assert_eq!(
            api.queries(),
            vec!["Foo", "Foo bar", "Foo restaurant", "Foo cafe"]
        );
        assert_eq!(outcome.matched_query.as_deref(), Some("Foo cafe"));
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].external_id(), "foo-1");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_non_empty_result() {
        let api = Arc::new(
            ScriptedPlacesApi::default().with_text("Velvet", vec![place("v-1", "Velvet")]),
        );
        let client = client(api.clone(), 2);

        let outcome = client.search_with_fallback("Velvet", None).await.unwrap();

        assert_eq!(api.queries(), vec!["Velvet"]);
        assert_eq!(outcome.attempted, vec!["Velvet"]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_results_do_not_trigger_retries() {
        let api = Arc::new(ScriptedPlacesApi::default());
        let client = client(api.clone(), 3);

        let outcome = client.search_with_fallback("Nowhere Lounge", None).await.unwrap();

        assert!(outcome.results.is_empty());
        assert!(outcome.matched_query.is_none());
        // One call per fallback candidate, none repeated.
        assert_eq!(api.queries().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_search_failures() {
        let api = Arc::new(
            ScriptedPlacesApi::default().with_text("Velvet", vec![place("v-1", "Velvet")]),
        );
        *api.text_failures_remaining.lock() = 2;
        let client = client(api.clone(), 3);

        let results = client.text_search("Velvet", None).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(api.queries().len(), 3);
        assert_eq!(client.rate_limiter().current_count().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_error_after_exhausting_retries() {
        let api = Arc::new(ScriptedPlacesApi::default());
        *api.text_failures_remaining.lock() = 10;
        let client = client(api.clone(), 2);

        let err = client.text_search("Velvet", None).await.unwrap_err();

        assert!(matches!(err, AppError::Api { ref status, .. } if status == "UNKNOWN_ERROR"));
        assert_eq!(api.queries().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_malformed_requests_before_calling_api() {
        let api = Arc::new(ScriptedPlacesApi::default());
        let client = client(api.clone(), 3);

        assert!(matches!(
            client.text_search("  (nothing) ", None).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            client.nearby_search(95.0, 0.0, 500, "bar").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            client.nearby_search(10.0, 0.0, 0, "bar").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(api.queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hydration_degrades_to_basic_record_on_failure() {
        let mut detailed = place("a", "Alpha Detailed");
        detailed.website = Some("https://alpha.example".into());
        let api = Arc::new(ScriptedPlacesApi::default().with_details(detailed));
        api.failing_details.lock().push("b".into());
        let client = client(api.clone(), 0);

        let basic = normalize_all(vec![place("a", "Alpha"), place("b", "Beta"), place("c", "Gamma")]);
        let started = tokio::time::Instant::now();
        let hydrated = client.hydrate(basic, 2).await;

        assert_eq!(hydrated.len(), 2);
        assert_eq!(hydrated[0].fields.name, "Alpha Detailed");
        assert_eq!(
            hydrated[0].fields.website.as_deref(),
            Some("https://alpha.example")
        );
        assert_eq!(hydrated[1].fields.name, "Beta");
        assert_eq!(*api.detail_calls.lock(), vec!["a", "b"]);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test(start_paused = true)]
    async fn timezone_falls_back_to_static_table() {
        let api = Arc::new(ScriptedPlacesApi::default());
        let client = client(api.clone(), 1);

        let zone = client.resolve_timezone(51.5074, -0.1278).await;
        assert_eq!(zone, "Europe/London");
        assert_eq!(*api.timezone_calls.lock(), 2);

        *api.timezone_zone.lock() = Some("Europe/Dublin".into());
        assert_eq!(client.resolve_timezone(53.35, -6.26).await, "Europe/Dublin");
    }
}
