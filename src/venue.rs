use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::places::{PlacePayload, PlacePhoto, PlaceReview};

const MAX_PRICE_TIER: u8 = 4;
const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingStatus {
    Operational,
    ClosedTemporarily,
    ClosedPermanently,
}

impl OperatingStatus {
    pub fn as_tag(&self) -> &'static str {
        match self {
            OperatingStatus::Operational => "operational",
            OperatingStatus::ClosedTemporarily => "closed_temporarily",
            OperatingStatus::ClosedPermanently => "closed_permanently",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OPERATIONAL" => Some(OperatingStatus::Operational),
            "CLOSED_TEMPORARILY" => Some(OperatingStatus::ClosedTemporarily),
            "CLOSED_PERMANENTLY" => Some(OperatingStatus::ClosedPermanently),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    PlacesApi,
    Import,
    Manual,
}

impl Provenance {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Provenance::PlacesApi => "places_api",
            Provenance::Import => "import",
            Provenance::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "places_api" => Some(Provenance::PlacesApi),
            "import" => Some(Provenance::Import),
            "manual" => Some(Provenance::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningPoint {
    pub day: u8,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningPeriod {
    pub open: OpeningPoint,
    pub close: Option<OpeningPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpeningHours {
    pub periods: Option<Vec<OpeningPeriod>>,
    pub weekday_text: Option<Vec<String>>,
}

impl OpeningHours {
    pub fn is_empty(&self) -> bool {
        self.periods.as_ref().map_or(true, Vec::is_empty)
            && self.weekday_text.as_ref().map_or(true, Vec::is_empty)
    }
}

/// The venue attributes the pipeline merges and persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueFields {
    pub external_id: String,
    pub name: String,
    pub address: Option<String>,
    pub secondary_address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub rating_count: Option<u32>,
    pub price_tier: Option<u8>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    pub operating_status: Option<OperatingStatus>,
    pub opening_hours: Option<OpeningHours>,
    pub timezone: Option<String>,
    pub provenance: Provenance,
}

impl VenueFields {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            address: None,
            secondary_address: None,
            latitude: None,
            longitude: None,
            phone: None,
            website: None,
            rating: None,
            rating_count: None,
            price_tier: None,
            categories: BTreeSet::new(),
            operating_status: None,
            opening_hours: None,
            timezone: None,
            provenance: Provenance::Manual,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// One normalized API response. Photos and reviews ride along for callers
/// but are never written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVenueDetails {
    #[serde(flatten)]
    pub fields: VenueFields,
    #[serde(default)]
    pub photos: Vec<PlacePhoto>,
    #[serde(default)]
    pub reviews: Vec<PlaceReview>,
}

impl RawVenueDetails {
    /// Maps an API payload onto the venue shape. Payloads without an
    /// identifier cannot be keyed and are rejected.
    pub fn from_place(place: PlacePayload, provenance: Provenance) -> Option<Self> {
        let external_id = non_blank(place.place_id)?;
        let name = non_blank(place.name).unwrap_or_else(|| external_id.clone());
        let location = place.geometry.and_then(|geometry| geometry.location);

        let rating = place.rating.filter(|value| {
            let valid = (0.0..=MAX_RATING).contains(value);
            if !valid {
                warn!(external_id = %external_id, rating = value, "dropping out-of-range rating");
            }
            valid
        });
        let price_tier = place.price_level.filter(|tier| *tier <= MAX_PRICE_TIER);

        let opening_hours = place
            .opening_hours
            .map(|hours| OpeningHours {
                periods: hours.periods.filter(|periods| !periods.is_empty()),
                weekday_text: hours.weekday_text.filter(|lines| !lines.is_empty()),
            })
            .filter(|hours| !hours.is_empty());

        let address = non_blank(place.formatted_address);
        let vicinity = non_blank(place.vicinity);
        let (address, secondary_address) = match address {
            Some(primary) => {
                let secondary = vicinity.filter(|text| *text != primary);
                (Some(primary), secondary)
            }
            None => (vicinity, None),
        };

        Some(Self {
            fields: VenueFields {
                external_id,
                name,
                address,
                secondary_address,
                latitude: location.as_ref().and_then(|loc| loc.lat),
                longitude: location.as_ref().and_then(|loc| loc.lng),
                phone: non_blank(place.international_phone_number)
                    .or_else(|| non_blank(place.formatted_phone_number)),
                website: non_blank(place.website),
                rating,
                rating_count: place.user_ratings_total,
                price_tier,
                categories: place
                    .types
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tag| non_blank(Some(tag)))
                    .map(|tag| tag.to_ascii_lowercase())
                    .collect(),
                operating_status: place.business_status.as_deref().and_then(OperatingStatus::parse),
                opening_hours,
                timezone: None,
                provenance,
            },
            photos: place.photos.unwrap_or_default(),
            reviews: place.reviews.unwrap_or_default(),
        })
    }

    pub fn external_id(&self) -> &str {
        &self.fields.external_id
    }
}

/// A persisted venue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub id: i64,
    #[serde(flatten)]
    pub fields: VenueFields,
    pub verified: bool,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
}

/// Percentage of the fixed checklist the venue has populated.
pub fn completeness_score(fields: &VenueFields) -> u8 {
    let checks = [
        !fields.name.trim().is_empty(),
        fields.address.is_some(),
        fields.coordinates().is_some(),
        fields.phone.is_some(),
        fields.website.is_some(),
        fields.rating.is_some(),
        fields.price_tier.is_some(),
        !fields.categories.is_empty(),
        fields.operating_status.is_some(),
        fields.opening_hours.is_some(),
        fields.timezone.is_some(),
    ];
    let filled = checks.iter().filter(|check| **check).count();
    ((filled * 100) as f64 / checks.len() as f64).round() as u8
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}
