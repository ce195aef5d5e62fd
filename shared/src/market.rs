//! The open market around drones: rental offers published by owners,
//! rental demands published by renters, and cargo deliveries. All three
//! share one generic service.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::catalog::{check_coordinate, paged};
use crate::model::{
    CargoId, DemandId, Drone, DroneId, MatchId, OfferId, PageData, PageRequest, User, UserId,
};
use crate::money::Money;
use crate::pipeline::{ApiClient, ApiError, ApiRequest};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RentalOffer {
    pub id: OfferId,
    pub drone_id: DroneId,
    pub owner_id: UserId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub available_from: String,
    #[serde(default)]
    pub available_to: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub service_radius: f64,
    #[serde(default)]
    pub price_type: String,
    #[serde(default)]
    pub price: Money,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub views: i32,
    #[serde(default)]
    pub drone: Option<Drone>,
    #[serde(default)]
    pub owner: Option<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RentalDemand {
    pub id: DemandId,
    pub renter_id: UserId,
    #[serde(default)]
    pub demand_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_features: Option<serde_json::Value>,
    #[serde(default)]
    pub required_load: f64,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub budget_min: Money,
    #[serde(default)]
    pub budget_max: Money,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub urgency: String,
    #[serde(default)]
    pub renter: Option<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CargoDemand {
    pub id: CargoId,
    pub publisher_id: UserId,
    #[serde(default)]
    pub cargo_type: String,
    #[serde(default)]
    pub cargo_weight: f64,
    #[serde(default)]
    pub cargo_size: Option<serde_json::Value>,
    #[serde(default)]
    pub cargo_description: String,
    #[serde(default)]
    pub pickup_latitude: f64,
    #[serde(default)]
    pub pickup_longitude: f64,
    #[serde(default)]
    pub pickup_address: String,
    #[serde(default)]
    pub delivery_latitude: f64,
    #[serde(default)]
    pub delivery_longitude: f64,
    #[serde(default)]
    pub delivery_address: String,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub pickup_time: String,
    #[serde(default)]
    pub delivery_deadline: Option<String>,
    #[serde(default)]
    pub offered_price: Money,
    #[serde(default)]
    pub special_requirements: String,
    #[serde(default)]
    pub images: Option<serde_json::Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub publisher: Option<User>,
}

/// Score breakdown behind a recommendation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchReason {
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub dist_score: f64,
    #[serde(default)]
    pub price_score: f64,
    #[serde(default)]
    pub load_score: f64,
    #[serde(default)]
    pub rating_score: f64,
}

/// A supply recommended for a demand by the server's matcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub id: MatchId,
    pub demand_id: i64,
    #[serde(default)]
    pub demand_type: String,
    #[serde(default)]
    pub supply_id: i64,
    #[serde(default)]
    pub supply_type: String,
    #[serde(default)]
    pub match_score: i32,
    #[serde(default)]
    pub match_reason: Option<MatchReason>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
}

// --- Drafts ---

/// Body for publishing or editing a rental offer. Times are RFC 3339.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OfferDraft {
    pub drone_id: DroneId,
    pub title: String,
    pub description: String,
    pub service_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_to: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub service_radius: f64,
    pub price_type: String,
    pub price: Money,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DemandDraft {
    pub demand_type: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_features: Vec<String>,
    pub required_load: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub city: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub budget_min: Money,
    pub budget_max: Money,
    pub urgency: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CargoDraft {
    pub cargo_type: String,
    pub cargo_weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cargo_size: Option<serde_json::Value>,
    pub cargo_description: String,
    pub pickup_latitude: f64,
    pub pickup_longitude: f64,
    pub pickup_address: String,
    pub delivery_latitude: f64,
    pub delivery_longitude: f64,
    pub delivery_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_deadline: Option<String>,
    pub offered_price: Money,
    pub special_requirements: String,
}

fn require(condition: bool, message: &str) -> Result<(), ApiError> {
    if condition {
        Ok(())
    } else {
        Err(ApiError::Request(message.into()))
    }
}

// --- Listing kinds ---

/// One kind of market listing and the rules for publishing it.
pub trait Listing: DeserializeOwned + Send + Sync + 'static {
    /// Path relative to the API root, without a trailing slash.
    const PATH: &'static str;
    /// Query parameter that filters the public list by category.
    const CATEGORY_FILTER: &'static str;

    type Id: fmt::Display + Copy + Send + Sync;
    type Draft: Serialize + Send + Sync;

    fn validate(draft: &Self::Draft) -> Result<(), ApiError>;
}

/// Listings the server computes supply matches for.
pub trait Matched: Listing {}

impl Listing for RentalOffer {
    const PATH: &'static str = "/rental/offer";
    const CATEGORY_FILTER: &'static str = "service_type";

    type Id = OfferId;
    type Draft = OfferDraft;

    fn validate(draft: &OfferDraft) -> Result<(), ApiError> {
        require(!draft.title.trim().is_empty(), "offer title is required")?;
        require(
            draft.price.minor() > 0,
            "offer price must be greater than zero",
        )?;
        require(
            draft.service_radius.is_finite() && draft.service_radius >= 0.0,
            "service radius cannot be negative",
        )?;
        check_coordinate(draft.latitude, draft.longitude)
    }
}

impl Listing for RentalDemand {
    const PATH: &'static str = "/rental/demand";
    const CATEGORY_FILTER: &'static str = "demand_type";

    type Id = DemandId;
    type Draft = DemandDraft;

    fn validate(draft: &DemandDraft) -> Result<(), ApiError> {
        require(!draft.title.trim().is_empty(), "demand title is required")?;
        require(
            draft.budget_min.minor() >= 0 && draft.budget_min <= draft.budget_max,
            "budget range is inverted",
        )?;
        require(
            draft.required_load.is_finite() && draft.required_load >= 0.0,
            "required load cannot be negative",
        )?;
        check_coordinate(draft.latitude, draft.longitude)
    }
}

impl Matched for RentalDemand {}

impl Listing for CargoDemand {
    const PATH: &'static str = "/cargo";
    const CATEGORY_FILTER: &'static str = "cargo_type";

    type Id = CargoId;
    type Draft = CargoDraft;

    fn validate(draft: &CargoDraft) -> Result<(), ApiError> {
        require(
            draft.cargo_weight.is_finite() && draft.cargo_weight > 0.0,
            "cargo weight must be greater than zero",
        )?;
        require(
            !draft.pickup_address.trim().is_empty() && !draft.delivery_address.trim().is_empty(),
            "pickup and delivery addresses are required",
        )?;
        require(
            draft.offered_price.minor() >= 0,
            "offered price cannot be negative",
        )?;
        check_coordinate(draft.pickup_latitude, draft.pickup_longitude)?;
        check_coordinate(draft.delivery_latitude, draft.delivery_longitude)
    }
}

impl Matched for CargoDemand {}

// --- Service ---

/// Public list filters. The server shows only `active` listings unless a
/// status is given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingQuery {
    pub category: Option<String>,
    pub status: Option<String>,
    pub page: PageRequest,
}

pub struct ListingService<L> {
    api: Arc<ApiClient>,
    kind: PhantomData<fn() -> L>,
}

pub type OfferService = ListingService<RentalOffer>;
pub type DemandService = ListingService<RentalDemand>;
pub type CargoService = ListingService<CargoDemand>;

impl<L> Clone for ListingService<L> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            kind: PhantomData,
        }
    }
}

impl<L: Listing> fmt::Debug for ListingService<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListingService")
            .field("path", &L::PATH)
            .finish_non_exhaustive()
    }
}

impl<L: Listing> ListingService<L> {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            kind: PhantomData,
        }
    }

    #[instrument(skip(self), fields(path = L::PATH))]
    pub async fn list(&self, query: &ListingQuery) -> Result<PageData<L>, ApiError> {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let request = ApiRequest::get(L::PATH)
            .query_opt(L::CATEGORY_FILTER, non_empty(&query.category))
            .query_opt("status", non_empty(&query.status));
        self.api.send(paged(request, query.page)).await
    }

    pub async fn get(&self, id: L::Id) -> Result<L, ApiError> {
        self.api
            .send(ApiRequest::get(format!("{}/{id}", L::PATH)))
            .await
    }

    /// Listings published by the signed-in user.
    pub async fn mine(&self, page: PageRequest) -> Result<PageData<L>, ApiError> {
        self.api
            .send(paged(ApiRequest::get(format!("{}/my", L::PATH)), page))
            .await
    }

    #[instrument(skip(self, draft), fields(path = L::PATH))]
    pub async fn create(&self, draft: &L::Draft) -> Result<L, ApiError> {
        L::validate(draft)?;
        let created = self
            .api
            .send(ApiRequest::post(L::PATH).json(draft)?)
            .await?;
        info!(path = L::PATH, "Listing published");
        Ok(created)
    }

    #[instrument(skip(self, id, draft), fields(path = L::PATH, id = %id))]
    pub async fn update(&self, id: L::Id, draft: &L::Draft) -> Result<(), ApiError> {
        L::validate(draft)?;
        self.api
            .send_unit(ApiRequest::put(format!("{}/{id}", L::PATH)).json(draft)?)
            .await
    }

    #[instrument(skip(self, id), fields(path = L::PATH, id = %id))]
    pub async fn delete(&self, id: L::Id) -> Result<(), ApiError> {
        self.api
            .send_unit(ApiRequest::delete(format!("{}/{id}", L::PATH)))
            .await?;
        info!(path = L::PATH, id = %id, "Listing withdrawn");
        Ok(())
    }
}

impl<L: Matched> ListingService<L> {
    /// Supplies the server matched to this listing, best first.
    pub async fn matches(&self, id: L::Id) -> Result<Vec<MatchRecord>, ApiError> {
        let mut matches: Vec<MatchRecord> = self
            .api
            .send_optional(ApiRequest::get(format!("{}/{id}/matches", L::PATH)))
            .await?
            .unwrap_or_default();
        matches.sort_by(|a, b| b.match_score.cmp(&a.match_score));
        Ok(matches)
    }
}
