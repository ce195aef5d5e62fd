//! Place search backed by the server's map provider, and the user's saved
//! addresses.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::catalog::{check_coordinate, paged};
use crate::model::{AddressId, PageData, PageRequest, UserId};
use crate::pipeline::{ApiClient, ApiError, ApiRequest};

pub const DEFAULT_POI_RADIUS_M: u32 = 1_000;
pub const MAX_POI_RADIUS_M: u32 = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Poi {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub district: String,
    pub longitude: f64,
    pub latitude: f64,
    #[serde(default, rename = "type")]
    pub category: String,
    /// Metres from the search centre, as the provider formats it. Empty for
    /// keyword searches.
    #[serde(default)]
    pub distance: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReverseGeocode {
    #[serde(default)]
    pub formatted_address: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub township: String,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub id: AddressId,
    pub user_id: UserId,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub district: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct NewAddress {
    pub label: String,
    pub name: String,
    pub address: String,
    pub province: String,
    pub city: String,
    pub district: String,
    pub latitude: f64,
    pub longitude: f64,
    pub is_default: bool,
}

impl NewAddress {
    /// A saved address built from a place the user picked.
    pub fn from_poi(poi: &Poi) -> Self {
        Self {
            name: poi.name.clone(),
            address: poi.address.clone(),
            province: poi.province.clone(),
            city: poi.city.clone(),
            district: poi.district.clone(),
            latitude: poi.latitude,
            longitude: poi.longitude,
            ..Self::default()
        }
    }
}

/// Unset fields are left unchanged on the server.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AddressUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct LocationService {
    api: Arc<ApiClient>,
}

impl LocationService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    #[instrument(skip(self))]
    pub async fn search(
        &self,
        keyword: &str,
        city: Option<&str>,
        page: PageRequest,
    ) -> Result<PageData<Poi>, ApiError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(ApiError::Request("search keyword is required".into()));
        }
        let request = ApiRequest::get("/location/search")
            .query("keyword", keyword)
            .query_opt("city", city.filter(|c| !c.is_empty()));
        self.api.send(paged(request, page)).await
    }

    pub async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<ReverseGeocode, ApiError> {
        check_coordinate(latitude, longitude)?;
        self.api
            .send(
                ApiRequest::get("/location/regeocode")
                    .query("lng", longitude)
                    .query("lat", latitude),
            )
            .await
    }

    /// Places around a point. The radius is in metres and defaults to
    /// [`DEFAULT_POI_RADIUS_M`].
    #[instrument(skip(self))]
    pub async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: Option<u32>,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> Result<PageData<Poi>, ApiError> {
        check_coordinate(latitude, longitude)?;
        let radius = radius_m
            .filter(|r| *r > 0)
            .map_or(DEFAULT_POI_RADIUS_M, |r| r.min(MAX_POI_RADIUS_M));
        let request = ApiRequest::get("/location/nearby")
            .query("lng", longitude)
            .query("lat", latitude)
            .query("radius", radius)
            .query_opt("keyword", keyword.map(str::trim).filter(|k| !k.is_empty()));
        self.api.send(paged(request, page)).await
    }
}

#[derive(Clone, Debug)]
pub struct AddressService {
    api: Arc<ApiClient>,
}

impl AddressService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    /// Saved addresses, default first.
    pub async fn list(&self) -> Result<Vec<Address>, ApiError> {
        Ok(self
            .api
            .send_optional(ApiRequest::get("/address"))
            .await?
            .unwrap_or_default())
    }

    #[instrument(skip(self, address))]
    pub async fn create(&self, address: &NewAddress) -> Result<Address, ApiError> {
        if address.address.trim().is_empty() {
            return Err(ApiError::Request("address is required".into()));
        }
        check_coordinate(address.latitude, address.longitude)?;
        let saved: Address = self
            .api
            .send(ApiRequest::post("/address").json(address)?)
            .await?;
        info!(address_id = %saved.id, "Address saved");
        Ok(saved)
    }

    #[instrument(skip(self, update))]
    pub async fn update(&self, id: AddressId, update: &AddressUpdate) -> Result<(), ApiError> {
        if update.address.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(ApiError::Request("address cannot be blank".into()));
        }
        if let (Some(latitude), Some(longitude)) = (update.latitude, update.longitude) {
            check_coordinate(latitude, longitude)?;
        } else if update.latitude.is_some() != update.longitude.is_some() {
            return Err(ApiError::Request(
                "latitude and longitude change together".into(),
            ));
        }
        self.api
            .send_unit(ApiRequest::put(format!("/address/{id}")).json(update)?)
            .await
    }

    pub async fn delete(&self, id: AddressId) -> Result<(), ApiError> {
        self.api
            .send_unit(ApiRequest::delete(format!("/address/{id}")))
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_default(&self, id: AddressId) -> Result<(), ApiError> {
        self.api
            .send_unit(ApiRequest::put(format!("/address/{id}/default")))
            .await
    }
}
