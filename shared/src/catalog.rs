//! Read-mostly resources around orders: drones, user profiles and direct
//! messages.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::model::{Availability, Drone, DroneId, MessageId, PageData, PageRequest, User, UserId};
use crate::pipeline::{path_segment, ApiClient, ApiError, ApiRequest};
use crate::MAX_PAGE_SIZE;

pub const DEFAULT_NEARBY_RADIUS_KM: f64 = 50.0;
pub const DEFAULT_MESSAGE_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Location,
    Order,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub extra_data: Option<serde_json::Value>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_time: String,
    #[serde(default)]
    pub last_type: String,
    pub peer_id: UserId,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewMessage {
    pub receiver_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn text(receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            content: content.into(),
            message_type: MessageType::Text,
            extra_data: None,
        }
    }
}

/// Profile fields a user may edit; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DroneQuery {
    pub city: Option<String>,
    pub availability: Option<Availability>,
    pub page: PageRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Approved,
    Rejected,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct VerificationState {
    status: VerificationStatus,
}

#[derive(Deserialize)]
struct UploadedFile {
    url: String,
}

#[derive(Deserialize)]
struct UnreadCount {
    #[serde(default)]
    count: u64,
}

fn availability_str(availability: Availability) -> Option<&'static str> {
    match availability {
        Availability::Available => Some("available"),
        Availability::Rented => Some("rented"),
        Availability::Maintenance => Some("maintenance"),
        Availability::Offline => Some("offline"),
        Availability::Unknown => None,
    }
}

pub(crate) fn paged(request: ApiRequest, page: PageRequest) -> ApiRequest {
    request
        .query("page", page.page.max(1))
        .query("page_size", page.page_size.clamp(1, MAX_PAGE_SIZE))
}

pub(crate) fn check_coordinate(latitude: f64, longitude: f64) -> Result<(), ApiError> {
    if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
        Ok(())
    } else {
        Err(ApiError::Request(format!(
            "coordinate ({latitude}, {longitude}) is out of range"
        )))
    }
}

#[derive(Clone, Debug)]
pub struct DroneService {
    api: Arc<ApiClient>,
}

impl DroneService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    #[instrument(skip(self))]
    pub async fn list(&self, query: &DroneQuery) -> Result<PageData<Drone>, ApiError> {
        let request = ApiRequest::get("/drone")
            .query_opt("city", query.city.as_deref().filter(|c| !c.is_empty()))
            .query_opt(
                "availability_status",
                query.availability.and_then(availability_str),
            );
        self.api.send(paged(request, query.page)).await
    }

    pub async fn get(&self, id: DroneId) -> Result<Drone, ApiError> {
        self.api.send(ApiRequest::get(format!("/drone/{id}"))).await
    }

    /// Drones owned by the signed-in user.
    pub async fn mine(&self, page: PageRequest) -> Result<PageData<Drone>, ApiError> {
        self.api.send(paged(ApiRequest::get("/drone/my"), page)).await
    }

    #[instrument(skip(self))]
    pub async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_km: Option<f64>,
        page: PageRequest,
    ) -> Result<PageData<Drone>, ApiError> {
        check_coordinate(latitude, longitude)?;
        let radius = radius_km
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(DEFAULT_NEARBY_RADIUS_KM);
        let request = ApiRequest::get("/drone/nearby")
            .query("lat", latitude)
            .query("lng", longitude)
            .query("radius", radius);
        self.api.send(paged(request, page)).await
    }

    #[instrument(skip(self))]
    pub async fn set_availability(
        &self,
        id: DroneId,
        availability: Availability,
    ) -> Result<(), ApiError> {
        let status = availability_str(availability)
            .ok_or_else(|| ApiError::Request("unknown availability status".into()))?;
        self.api
            .send_unit(
                ApiRequest::put(format!("/drone/{id}/availability"))
                    .json(&serde_json::json!({ "status": status }))?,
            )
            .await?;
        info!(drone_id = %id, status, "Drone availability updated");
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct UserService {
    api: Arc<ApiClient>,
}

impl UserService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    /// Fetches the profile and refreshes the session's copy of the user.
    pub async fn profile(&self) -> Result<User, ApiError> {
        let user: User = self.api.send(ApiRequest::get("/user/profile")).await?;
        self.api.session().update_user(user.clone()).await;
        Ok(user)
    }

    #[instrument(skip(self, update))]
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, ApiError> {
        self.api
            .send_unit(ApiRequest::put("/user/profile").json(update)?)
            .await?;
        self.profile().await
    }

    /// Uploads a new avatar image and points the session's user at it.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload_avatar(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String, ApiError> {
        if bytes.is_empty() {
            return Err(ApiError::Request("avatar image is empty".into()));
        }
        if !content_type.starts_with("image/") {
            return Err(ApiError::Request(format!(
                "{content_type} is not an image type"
            )));
        }
        let request =
            ApiRequest::post("/user/avatar").multipart_file("file", file_name, content_type, bytes)?;
        let uploaded: UploadedFile = self.api.send(request).await?;

        let session = self.api.session();
        if let Some(mut user) = session.current_user() {
            user.avatar_url.clone_from(&uploaded.url);
            session.update_user(user).await;
        }
        info!("Avatar uploaded");
        Ok(uploaded.url)
    }

    /// Submits an 18-character resident identity number for review.
    #[instrument(skip_all)]
    pub async fn submit_id_verification(&self, id_card_no: &str) -> Result<(), ApiError> {
        let id_card_no = id_card_no.trim().to_ascii_uppercase();
        if !is_identity_number(&id_card_no) {
            return Err(ApiError::Request("identity number is malformed".into()));
        }
        let already = self
            .api
            .session()
            .current_user()
            .is_some_and(|u| u.id_verified == "approved");
        if already {
            return Err(ApiError::Request("identity is already verified".into()));
        }
        self.api
            .send_unit(
                ApiRequest::post("/user/id-verify")
                    .json(&serde_json::json!({ "id_card_no": id_card_no }))?,
            )
            .await?;
        info!("Identity verification submitted");
        Ok(())
    }

    pub async fn id_verification_status(&self) -> Result<VerificationStatus, ApiError> {
        let status: VerificationState = self
            .api
            .send(ApiRequest::get("/user/id-verify/status"))
            .await?;
        Ok(status.status)
    }

    /// Another user's profile with private fields withheld by the server.
    pub async fn public_profile(&self, id: UserId) -> Result<User, ApiError> {
        self.api.send(ApiRequest::get(format!("/user/{id}"))).await
    }
}

fn is_identity_number(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 18
        && bytes[..17].iter().all(u8::is_ascii_digit)
        && (bytes[17].is_ascii_digit() || bytes[17] == b'X')
}

#[derive(Clone, Debug)]
pub struct MessageService {
    api: Arc<ApiClient>,
}

impl MessageService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        Ok(self
            .api
            .send_optional(ApiRequest::get("/message/conversations"))
            .await?
            .unwrap_or_default())
    }

    pub async fn history(
        &self,
        conversation_id: &str,
        page: PageRequest,
    ) -> Result<PageData<Message>, ApiError> {
        let request = ApiRequest::get(format!("/message/{}", path_segment(conversation_id)?));
        self.api.send(paged(request, page)).await
    }

    #[instrument(skip(self, message), fields(receiver_id = %message.receiver_id))]
    pub async fn send(&self, message: &NewMessage) -> Result<Message, ApiError> {
        if message.content.trim().is_empty() && message.extra_data.is_none() {
            return Err(ApiError::Request("message is empty".into()));
        }
        self.api
            .send(ApiRequest::post("/message").json(message)?)
            .await
    }

    pub async fn mark_read(&self, conversation_id: &str) -> Result<(), ApiError> {
        self.api
            .send_unit(ApiRequest::put(format!(
                "/message/{}/read",
                path_segment(conversation_id)?
            )))
            .await
    }

    pub async fn unread_count(&self) -> Result<u64, ApiError> {
        let unread: UnreadCount = self.api.send(ApiRequest::get("/message/unread-count")).await?;
        Ok(unread.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_decodes_unknown_type() {
        let message: Message = serde_json::from_value(serde_json::json!({
            "id": 1,
            "conversation_id": "1_2",
            "sender_id": 1,
            "receiver_id": 2,
            "message_type": "sticker",
            "content": "hi"
        }))
        .unwrap();
        assert_eq!(message.message_type, MessageType::Other);
    }

    #[test]
    fn test_identity_number_shape() {
        assert!(is_identity_number("11010519491231002X"));
        assert!(is_identity_number("110105194912310021"));
        assert!(!is_identity_number("11010519491231002"));
        assert!(!is_identity_number("1101051949123100XX"));
    }

    #[test]
    fn test_profile_update_skips_unset_fields() {
        let update = ProfileUpdate {
            nickname: Some("pilot".into()),
            avatar_url: None,
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"nickname": "pilot"})
        );
    }
}
