use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::{BatchInput, BatchOrchestrator, BatchReport};
use crate::errors::{AppError, AppResult};
use crate::places::{LocationBias, PlacesDirectoryClient};
use crate::store::VenueStore;
use crate::upsert::UpsertStatus;
use crate::venue::{RawVenueDetails, VenueFields};

pub const DEFAULT_BIAS_RADIUS_M: u32 = 5_000;

/// One line of ingestion input: a free-form search, optionally biased
/// towards a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueQuery {
    pub query: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub radius_m: Option<u32>,
}

impl VenueQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            latitude: None,
            longitude: None,
            radius_m: None,
        }
    }

    pub fn location_bias(&self) -> AppResult<Option<LocationBias>> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Ok(Some(LocationBias {
                latitude,
                longitude,
                radius_m: self.radius_m.unwrap_or(DEFAULT_BIAS_RADIUS_M),
            })),
            (None, None) => Ok(None),
            _ => Err(AppError::InvalidInput(format!(
                "query {:?} needs both latitude and longitude",
                self.query
            ))),
        }
    }
}

fn validated(queries: Vec<VenueQuery>) -> AppResult<Vec<VenueQuery>> {
    queries
        .into_iter()
        .enumerate()
        .map(|(idx, mut query)| {
            query.query = query.query.trim().to_string();
            if query.query.is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "query #{} is blank",
                    idx + 1
                )));
            }
            Ok(query)
        })
        .collect()
}

/// Header row required; `query` column mandatory, the rest optional.
pub fn parse_queries_csv<R: Read>(reader: R) -> AppResult<Vec<VenueQuery>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let queries = reader
        .deserialize::<VenueQuery>()
        .collect::<Result<Vec<_>, _>>()?;
    validated(queries)
}

pub fn parse_queries_json(bytes: &[u8]) -> AppResult<Vec<VenueQuery>> {
    validated(serde_json::from_slice(bytes)?)
}

/// Picks the parser from the file extension; anything but `.json` is CSV.
pub fn load_queries(path: &Path) -> AppResult<Vec<VenueQuery>> {
    let bytes = fs::read(path)?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        parse_queries_json(&bytes)
    } else {
        parse_queries_csv(bytes.as_slice())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryFailure {
    pub query: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Discovery {
    pub venues: Vec<VenueFields>,
    pub unmatched_queries: Vec<String>,
    pub failed_queries: Vec<QueryFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    #[serde(flatten)]
    pub batch: BatchReport,
    pub unmatched_queries: Vec<String>,
    pub failed_queries: Vec<QueryFailure>,
}

/// Search, hydrate, then write through the orchestrator.
pub struct IngestionPipeline {
    client: PlacesDirectoryClient,
    orchestrator: BatchOrchestrator,
    max_hydrated: usize,
}

impl IngestionPipeline {
    pub fn new(
        client: PlacesDirectoryClient,
        orchestrator: BatchOrchestrator,
        max_hydrated: usize,
    ) -> Self {
        Self {
            client,
            orchestrator,
            max_hydrated,
        }
    }

    /// A failed search is reported against its query and does not stop the
    /// remaining queries. Venues found by several queries are kept once.
    pub async fn discover(&self, queries: &[VenueQuery]) -> Discovery {
        let mut discovery = Discovery::default();
        let mut seen = HashSet::new();

        for query in queries {
            let found = match self.search(query).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(?err, query = %query.query, "search failed");
                    discovery.failed_queries.push(QueryFailure {
                        query: query.query.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            if found.is_empty() {
                discovery.unmatched_queries.push(query.query.clone());
                continue;
            }
            for fields in found {
                if seen.insert(fields.external_id.clone()) {
                    discovery.venues.push(fields);
                }
            }
        }

        info!(
            queries = queries.len(),
            venues = discovery.venues.len(),
            unmatched = discovery.unmatched_queries.len(),
            failed = discovery.failed_queries.len(),
            "discovery finished"
        );
        discovery
    }

    async fn search(&self, query: &VenueQuery) -> AppResult<Vec<VenueFields>> {
        let bias = query.location_bias()?;
        let outcome = self.client.search_with_fallback(&query.query, bias).await?;
        let hydrated = self.client.hydrate(outcome.results, self.max_hydrated).await;
        Ok(self.finish(hydrated).await)
    }

    /// Drops the non-persisted extras and fills missing timezones.
    async fn finish(&self, details: Vec<RawVenueDetails>) -> Vec<VenueFields> {
        let mut venues = Vec::with_capacity(details.len());
        for detail in details {
            let mut fields = detail.fields;
            self.fill_timezone(&mut fields).await;
            venues.push(fields);
        }
        venues
    }

    /// A zone already on file is kept: a fresh lookup may only be the
    /// coordinate-table guess when the timezone API is down.
    async fn fill_timezone(&self, fields: &mut VenueFields) {
        if fields.timezone.is_some() {
            return;
        }
        match self.store().get_by_external_id(&fields.external_id) {
            Ok(Some(existing)) if existing.fields.timezone.is_some() => {
                fields.timezone = existing.fields.timezone;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(?err, external_id = %fields.external_id, "could not read stored timezone");
            }
        }
        if let Some((latitude, longitude)) = fields.coordinates() {
            fields.timezone = Some(self.client.resolve_timezone(latitude, longitude).await);
        }
    }

    pub async fn run(&self, queries: &[VenueQuery]) -> AppResult<IngestionReport> {
        let discovery = self.discover(queries).await;
        let batch = self.orchestrator.run(&discovery.venues).await?;
        Ok(IngestionReport {
            batch,
            unmatched_queries: discovery.unmatched_queries,
            failed_queries: discovery.failed_queries,
        })
    }

    pub async fn run_nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: u32,
        category: &str,
    ) -> AppResult<BatchReport> {
        let basic = self
            .client
            .nearby_search(latitude, longitude, radius_m, category)
            .await?;
        let hydrated = self.client.hydrate(basic, self.max_hydrated).await;
        let venues = self.finish(hydrated).await;
        self.orchestrator.run(&venues).await
    }

    /// Re-fetches venues not refreshed within `older_than` and writes them
    /// back with the orchestrator's resolution. Identifiers the directory no
    /// longer knows are reported as errors.
    pub async fn refresh_stale(
        &self,
        older_than: chrono::Duration,
        limit: usize,
    ) -> AppResult<BatchReport> {
        let store = self.store();
        let cutoff = Utc::now().checked_sub_signed(older_than).ok_or_else(|| {
            AppError::InvalidInput(format!("refresh window {older_than} is out of range"))
        })?;
        let stale = store.list_stale(cutoff, limit)?;
        info!(count = stale.len(), %cutoff, "refreshing stale venues");

        let mut inputs = Vec::with_capacity(stale.len());
        for record in stale {
            let external_id = record.fields.external_id;
            match self.client.place_details(&external_id).await {
                Ok(Some(details)) => {
                    let mut fields = details.fields;
                    self.fill_timezone(&mut fields).await;
                    inputs.push(BatchInput::Venue(fields));
                }
                Ok(None) => inputs.push(BatchInput::Unresolved {
                    external_id,
                    reason: "place no longer listed in the directory".into(),
                }),
                Err(err) => inputs.push(BatchInput::Unresolved {
                    external_id,
                    reason: err.to_string(),
                }),
            }
        }

        let report = self.orchestrator.run_inputs(inputs).await?;
        self.mark_refreshed(store.as_ref(), &report);
        Ok(report)
    }

    /// Writes already bump the refresh time; this covers fetched venues
    /// whose content came back identical. Skipped venues, whether by
    /// resolution or by the operator, stay stale.
    fn mark_refreshed(&self, store: &dyn VenueStore, report: &BatchReport) {
        let unchanged = report
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == UpsertStatus::Updated)
            .flat_map(|outcome| &outcome.changeset.unchanged);
        for external_id in unchanged {
            if let Err(err) = store.mark_refreshed(external_id) {
                warn!(?err, external_id = %external_id, "could not mark venue refreshed");
            }
        }
    }

    fn store(&self) -> &Arc<dyn VenueStore> {
        self.orchestrator.engine().store()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    use super::*;
    use crate::backoff::{BackoffExecutor, BackoffPolicy};
    use crate::confirm::testing::ScriptedConfirm;
    use crate::confirm::ConfirmDecision;
    use crate::places::testing::{place, ScriptedPlacesApi};
    use crate::places::{PlaceGeometry, PlaceLocation};
    use crate::rate_limit::RateLimiter;
    use crate::store::testing::memory_store;
    use crate::upsert::{ConflictResolution, UpsertEngine, UpsertStatus};

    fn pipeline(
        api: Arc<ScriptedPlacesApi>,
        resolution: ConflictResolution,
    ) -> (IngestionPipeline, Arc<dyn VenueStore>) {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_retries: 1,
            ..BackoffPolicy::default()
        };
        let client = PlacesDirectoryClient::new(
            api,
            RateLimiter::new(100, Duration::from_secs(1)).unwrap(),
            BackoffExecutor::with_rng(policy, StdRng::seed_from_u64(3)),
            Duration::ZERO,
        );
        let store: Arc<dyn VenueStore> = Arc::new(memory_store());
        let engine = UpsertEngine::new(Arc::clone(&store), resolution);
        let orchestrator = BatchOrchestrator::new(engine, Duration::ZERO);
        (IngestionPipeline::new(client, orchestrator, 5), store)
    }

    #[test]
    fn parses_csv_with_optional_bias() {
        let csv = "query,latitude,longitude,radius_m\n\
                   Death & Co,40.72,-73.98,1500\n\
                   \"Foo (closed)\",,,\n";
        let queries = parse_queries_csv(csv.as_bytes()).unwrap();

        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].radius_m, Some(1500));
        assert_eq!(
            queries[0].location_bias().unwrap(),
            Some(LocationBias {
                latitude: 40.72,
                longitude: -73.98,
                radius_m: 1500,
            })
        );
        assert_eq!(queries[1], VenueQuery::new("Foo (closed)"));
        assert_eq!(queries[1].location_bias().unwrap(), None);
    }

    #[test]
    fn rejects_blank_queries_and_half_coordinates() {
        assert!(parse_queries_csv("query\n   \n".as_bytes()).is_err());
        assert!(parse_queries_json(br#"[{"query": " "}]"#).is_err());

        let half = VenueQuery {
            latitude: Some(1.0),
            ..VenueQuery::new("Bar")
        };
        assert!(half.location_bias().is_err());
    }

    #[test]
    fn loads_json_and_csv_by_extension() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("queries.json");
        fs::write(
            &json_path,
            r#"[{"query": "Attaboy", "latitude": 40.7, "longitude": -73.9}]"#,
        )
        .unwrap();
        let csv_path = dir.path().join("queries.csv");
        fs::write(&csv_path, "query\nAttaboy\n").unwrap();

        let from_json = load_queries(&json_path).unwrap();
        assert_eq!(from_json[0].query, "Attaboy");
        assert_eq!(from_json[0].radius_m, None);
        assert_eq!(
            from_json[0].location_bias().unwrap().unwrap().radius_m,
            DEFAULT_BIAS_RADIUS_M
        );
        assert_eq!(load_queries(&csv_path).unwrap(), vec![VenueQuery::new("Attaboy")]);
    }

    #[tokio::test]
    async fn discovers_hydrates_and_deduplicates() {
        let mut detailed = place("A", "Bar X");
        detailed.website = Some("https://bar-x.example".into());
        let api = Arc::new(
            ScriptedPlacesApi::default()
                .with_text("Bar X", vec![place("A", "Bar X")])
                .with_text("Bar", vec![place("A", "Bar X"), place("B", "Bar Y")])
                .with_details(detailed),
        );
        *api.timezone_zone.lock() = Some("America/New_York".into());
        let (pipeline, _store) = pipeline(Arc::clone(&api), ConflictResolution::Merge);

        let discovery = pipeline
            .discover(&[VenueQuery::new("Bar X"), VenueQuery::new("Bar")])
            .await;

        let ids: Vec<_> = discovery
            .venues
            .iter()
            .map(|v| v.external_id.as_str())
            .collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(
            discovery.venues[0].website.as_deref(),
            Some("https://bar-x.example")
        );
        assert!(discovery
            .venues
            .iter()
            .all(|v| v.timezone.as_deref() == Some("America/New_York")));
        assert!(discovery.unmatched_queries.is_empty());
    }

    #[tokio::test]
    async fn failed_and_unmatched_queries_are_reported() {
        let api = Arc::new(ScriptedPlacesApi::default());
        *api.text_failures_remaining.lock() = 2;
        let (pipeline, _store) = pipeline(Arc::clone(&api), ConflictResolution::Merge);

        let discovery = pipeline
            .discover(&[VenueQuery::new("Broken"), VenueQuery::new("Nowhere")])
            .await;

        assert!(discovery.venues.is_empty());
        assert_eq!(discovery.failed_queries.len(), 1);
        assert_eq!(discovery.failed_queries[0].query, "Broken");
        assert_eq!(discovery.unmatched_queries, vec!["Nowhere"]);
    }

    #[tokio::test]
    async fn run_writes_discovered_venues() {
        let api = Arc::new(ScriptedPlacesApi::default().with_text("Bar X", vec![place("A", "Bar X")]));
        let (pipeline, store) = pipeline(Arc::clone(&api), ConflictResolution::Merge);

        let report = pipeline.run(&[VenueQuery::new("Bar X")]).await.unwrap();

        assert_eq!(report.batch.summary.inserted, 1);
        assert_eq!(report.batch.summary.total, 1);
        let stored = store.get_by_external_id("A").unwrap().unwrap();
        assert_eq!(stored.fields.timezone.as_deref(), Some("America/New_York"));
    }

    #[tokio::test]
    async fn run_nearby_writes_results() {
        let api = Arc::new(ScriptedPlacesApi::default());
        *api.nearby_results.lock() = vec![place("N1", "Corner Bar"), place("N2", "Side Bar")];
        let (pipeline, store) = pipeline(Arc::clone(&api), ConflictResolution::Merge);

        let report = pipeline
            .run_nearby(40.7128, -74.006, 1_000, "bar")
            .await
            .unwrap();

        assert_eq!(report.summary.inserted, 2);
        assert_eq!(store.count().unwrap(), 2);
        assert!(pipeline.run_nearby(40.7, -74.0, 0, "bar").await.is_err());
    }

    #[tokio::test]
    async fn refresh_updates_stale_and_reports_missing() {
        let mut refreshed = place("A", "Bar X");
        refreshed.rating = Some(4.8);
        let api = Arc::new(ScriptedPlacesApi::default().with_details(refreshed));
        let (pipeline, store) = pipeline(Arc::clone(&api), ConflictResolution::Merge);
        store.insert(&VenueFields::new("A", "Bar X")).unwrap();
        store.insert(&VenueFields::new("gone", "Closed Bar")).unwrap();

        let report = pipeline
            .refresh_stale(chrono::Duration::seconds(-60), 10)
            .await
            .unwrap();

        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.updated, 1);
        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.changeset.errors, vec!["gone"]);
        let outcome = report
            .outcomes
            .iter()
            .find(|o| o.external_id == "A")
            .unwrap();
        assert_eq!(outcome.status, UpsertStatus::Updated);
        let stored = store.get_by_external_id("A").unwrap().unwrap();
        assert_eq!(stored.fields.rating, Some(4.8));
        assert_eq!(*api.detail_calls.lock(), vec!["A", "gone"]);

        assert!(matches!(
            pipeline.refresh_stale(chrono::Duration::MAX, 10).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn refresh_keeps_stored_timezone_when_lookup_fails() {
        let mut stored = VenueFields::new("BA", "Floreria Atlantico");
        stored.latitude = Some(-34.59);
        stored.longitude = Some(-58.38);
        stored.timezone = Some("America/Argentina/Buenos_Aires".into());
        let mut refreshed = place("BA", "Floreria Atlantico");
        refreshed.geometry = Some(PlaceGeometry {
            location: Some(PlaceLocation {
                lat: Some(-34.59),
                lng: Some(-58.38),
            }),
        });
        refreshed.rating = Some(4.7);
        let api = Arc::new(ScriptedPlacesApi::default().with_details(refreshed));
        let (pipeline, store) = pipeline(Arc::clone(&api), ConflictResolution::Merge);
        store.insert(&stored).unwrap();

        let report = pipeline
            .refresh_stale(chrono::Duration::seconds(-60), 10)
            .await
            .unwrap();

        assert_eq!(report.changeset.updated, vec!["BA"]);
        let after = store.get_by_external_id("BA").unwrap().unwrap();
        assert_eq!(after.fields.rating, Some(4.7));
        assert_eq!(
            after.fields.timezone.as_deref(),
            Some("America/Argentina/Buenos_Aires")
        );
        assert_eq!(*api.timezone_calls.lock(), 0);
    }

    #[tokio::test]
    async fn refresh_marks_only_fetched_unchanged_venues() {
        let api = Arc::new(
            ScriptedPlacesApi::default()
                .with_details(place("A", "Bar X"))
                .with_details(place("B", "Bar Y")),
        );
        *api.nearby_results.lock() = vec![place("A", "Bar X"), place("B", "Bar Y")];
        let (pipeline, store) = pipeline(Arc::clone(&api), ConflictResolution::Merge);
        pipeline.run_nearby(40.7128, -74.006, 500, "bar").await.unwrap();
        let before_a = store.get_by_external_id("A").unwrap().unwrap();
        let before_b = store.get_by_external_id("B").unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let confirm = Arc::new(ScriptedConfirm::answering([
            ConfirmDecision::Proceed,
            ConfirmDecision::Skip,
        ]));
        let IngestionPipeline {
            client,
            orchestrator,
            max_hydrated,
        } = pipeline;
        let pipeline =
            IngestionPipeline::new(client, orchestrator.with_confirmation(confirm), max_hydrated);
        let report = pipeline
            .refresh_stale(chrono::Duration::seconds(-60), 10)
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].status, UpsertStatus::Updated);
        assert_eq!(report.outcomes[1].status, UpsertStatus::Skipped);
        let after_a = store.get_by_external_id("A").unwrap().unwrap();
        let after_b = store.get_by_external_id("B").unwrap().unwrap();
        assert!(after_a.last_refreshed_at > before_a.last_refreshed_at);
        assert_eq!(after_a.updated_at, before_a.updated_at);
        assert_eq!(after_b.last_refreshed_at, before_b.last_refreshed_at);
    }
}
