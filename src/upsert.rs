use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::store::{VenueStore, VenueUpdate};
use crate::venue::{VenueFields, VenueRecord};

/// How an incoming venue interacts with a stored venue of the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Leave the stored venue untouched.
    Skip,
    /// Overwrite every field with the incoming value, absent values included.
    Update,
    /// Take incoming values where present, keep stored values otherwise.
    #[default]
    Merge,
    /// Overwrite like `Update` and also drop the stored verification, since
    /// the content it vouched for is gone.
    Replace,
}

impl ConflictResolution {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ConflictResolution::Skip => "skip",
            ConflictResolution::Update => "update",
            ConflictResolution::Merge => "merge",
            ConflictResolution::Replace => "replace",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_tag())
    }
}

impl FromStr for ConflictResolution {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(ConflictResolution::Skip),
            "update" => Ok(ConflictResolution::Update),
            "merge" => Ok(ConflictResolution::Merge),
            "replace" => Ok(ConflictResolution::Replace),
            other => Err(AppError::InvalidInput(format!(
                "unknown conflict resolution: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStatus {
    Inserted,
    Updated,
    Skipped,
    Error,
}

/// Identifiers touched by one or more upserts. Reporting only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub errors: Vec<String>,
}

impl Changeset {
    pub fn absorb(&mut self, other: &Changeset) {
        self.added.extend(other.added.iter().cloned());
        self.updated.extend(other.updated.iter().cloned());
        self.unchanged.extend(other.unchanged.iter().cloned());
        self.errors.extend(other.errors.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.unchanged.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub external_id: String,
    pub status: UpsertStatus,
    pub record: Option<VenueRecord>,
    pub error: Option<String>,
    pub changeset: Changeset,
}

impl UpsertOutcome {
    fn inserted(record: VenueRecord) -> Self {
        let external_id = record.fields.external_id.clone();
        Self {
            changeset: Changeset {
                added: vec![external_id.clone()],
                ..Changeset::default()
            },
            external_id,
            status: UpsertStatus::Inserted,
            record: Some(record),
            error: None,
        }
    }

    fn updated(record: VenueRecord, changed: bool) -> Self {
        let external_id = record.fields.external_id.clone();
        let changeset = if changed {
            Changeset {
                updated: vec![external_id.clone()],
                ..Changeset::default()
            }
        } else {
            Changeset {
                unchanged: vec![external_id.clone()],
                ..Changeset::default()
            }
        };
        Self {
            external_id,
            status: UpsertStatus::Updated,
            record: Some(record),
            error: None,
            changeset,
        }
    }

    pub fn skipped(external_id: &str, record: Option<VenueRecord>) -> Self {
        Self {
            external_id: external_id.to_string(),
            status: UpsertStatus::Skipped,
            record,
            error: None,
            changeset: Changeset {
                unchanged: vec![external_id.to_string()],
                ..Changeset::default()
            },
        }
    }

    pub fn failed(external_id: &str, error: impl fmt::Display) -> Self {
        Self {
            external_id: external_id.to_string(),
            status: UpsertStatus::Error,
            record: None,
            error: Some(error.to_string()),
            changeset: Changeset {
                errors: vec![external_id.to_string()],
                ..Changeset::default()
            },
        }
    }
}

/// What an upsert would do, decided before any write happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "resolution")]
pub enum ProposedAction {
    Insert,
    Overwrite(ConflictResolution),
    Skip,
}

impl fmt::Display for ProposedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProposedAction::Insert => "insert",
            ProposedAction::Overwrite(resolution) => resolution.as_tag(),
            ProposedAction::Skip => "skip",
        };
        f.pad(label)
    }
}

/// Merge policy: incoming values win where present.
pub fn merge_fields(existing: &VenueFields, incoming: &VenueFields) -> VenueFields {
    fn pick<T: Clone>(incoming: &Option<T>, existing: &Option<T>) -> Option<T> {
        incoming.clone().or_else(|| existing.clone())
    }

    VenueFields {
        external_id: existing.external_id.clone(),
        name: if incoming.name.trim().is_empty() {
            existing.name.clone()
        } else {
            incoming.name.clone()
        },
        address: pick(&incoming.address, &existing.address),
        secondary_address: pick(&incoming.secondary_address, &existing.secondary_address),
        latitude: pick(&incoming.latitude, &existing.latitude),
        longitude: pick(&incoming.longitude, &existing.longitude),
        phone: pick(&incoming.phone, &existing.phone),
        website: pick(&incoming.website, &existing.website),
        rating: pick(&incoming.rating, &existing.rating),
        rating_count: pick(&incoming.rating_count, &existing.rating_count),
        price_tier: pick(&incoming.price_tier, &existing.price_tier),
        categories: if incoming.categories.is_empty() {
            existing.categories.clone()
        } else {
            incoming.categories.clone()
        },
        operating_status: pick(&incoming.operating_status, &existing.operating_status),
        opening_hours: pick(&incoming.opening_hours, &existing.opening_hours),
        timezone: pick(&incoming.timezone, &existing.timezone),
        provenance: incoming.provenance,
    }
}

/// Decides insert, update or skip per identifier and applies it.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn VenueStore>,
    resolution: ConflictResolution,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn VenueStore>, resolution: ConflictResolution) -> Self {
        Self { store, resolution }
    }

    pub fn resolution(&self) -> ConflictResolution {
        self.resolution
    }

    pub fn store(&self) -> &Arc<dyn VenueStore> {
        &self.store
    }

    pub fn plan(&self, incoming: &VenueFields) -> AppResult<ProposedAction> {
        if !self.store.exists_by_external_id(&incoming.external_id)? {
            return Ok(ProposedAction::Insert);
        }
        Ok(match self.resolution {
            ConflictResolution::Skip => ProposedAction::Skip,
            other => ProposedAction::Overwrite(other),
        })
    }

    /// Applies the configured resolution. Lookup failures are returned as
    /// errors; write failures become an `Error` outcome so one bad record
    /// cannot take down a batch.
    pub fn upsert(&self, incoming: &VenueFields) -> AppResult<UpsertOutcome> {
        let external_id = incoming.external_id.trim();
        if external_id.is_empty() {
            return Ok(UpsertOutcome::failed(
                external_id,
                AppError::InvalidInput("venue is missing an external identifier".into()),
            ));
        }

        let Some(existing) = self.store.get_by_external_id(external_id)? else {
            return Ok(match self.store.insert(incoming) {
                Ok(record) => {
                    info!(external_id, "venue inserted");
                    UpsertOutcome::inserted(record)
                }
                Err(err) => {
                    warn!(?err, external_id, "venue insert failed");
                    UpsertOutcome::failed(external_id, err)
                }
            });
        };

        let (fields, clear_verification) = match self.resolution {
            ConflictResolution::Skip => {
                info!(external_id, "venue exists; skipping");
                return Ok(UpsertOutcome::skipped(external_id, Some(existing)));
            }
            ConflictResolution::Merge => (merge_fields(&existing.fields, incoming), false),
            ConflictResolution::Update => (self.pinned(incoming, &existing), false),
            ConflictResolution::Replace => (self.pinned(incoming, &existing), true),
        };

        let verification_changes = clear_verification && existing.verified;
        if fields == existing.fields && !verification_changes {
            info!(external_id, resolution = %self.resolution, "venue unchanged");
            return Ok(UpsertOutcome::updated(existing, false));
        }

        let update = VenueUpdate {
            fields,
            clear_verification,
        };
        Ok(match self.store.update(external_id, &update) {
            Ok(record) => {
                info!(external_id, resolution = %self.resolution, "venue updated");
                UpsertOutcome::updated(record, true)
            }
            Err(err) => {
                warn!(?err, external_id, "venue update failed");
                UpsertOutcome::failed(external_id, err)
            }
        })
    }

    /// Incoming fields with the stored identifier kept, so an overwrite can
    /// never re-key a record.
    fn pinned(&self, incoming: &VenueFields, existing: &VenueRecord) -> VenueFields {
        VenueFields {
            external_id: existing.fields.external_id.clone(),
            ..incoming.clone()
        }
    }
}
