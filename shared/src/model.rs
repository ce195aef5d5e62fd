use serde::{Deserialize, Serialize};
use std::fmt;

use crate::money::Money;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(OrderId);
typed_id!(DroneId);
typed_id!(PaymentId);
typed_id!(ReviewId);
typed_id!(MessageId);
typed_id!(OfferId);
typed_id!(DemandId);
typed_id!(CargoId);
typed_id!(MatchId);
typed_id!(AddressId);

// --- Response envelope ---

/// `{ code, message, data, timestamp }`; `code == 0` means success even
/// though the HTTP layer may have said so already.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub timestamp: i64,
}

impl<T> ApiEnvelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageData<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

impl<T> PageData<T> {
    pub fn has_more(&self) -> bool {
        let seen = i64::from(self.page.max(1)) * i64::from(self.page_size);
        seen < self.total
    }
}

/// Pagination parameters shared by every list endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: crate::DEFAULT_PAGE_SIZE,
        }
    }
}

// --- Users and credentials ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    DroneOwner,
    Renter,
    CargoOwner,
    Admin,
    #[serde(other)]
    Other,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar_url: String,
    pub user_type: UserType,
    #[serde(default)]
    pub id_verified: String,
    #[serde(default)]
    pub credit_score: i32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
}

// Phone numbers stay out of logs.
impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("nickname", &self.nickname)
            .field("user_type", &self.user_type)
            .field("phone_present", &!self.phone.is_empty())
            .field("status", &self.status)
            .finish()
    }
}

/// Wire form of the credential pair. Converted into
/// [`crate::session::Credentials`] as soon as it is received.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Body of a successful login or registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub user: User,
    pub token: TokenPair,
}

// --- Drones ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Available,
    Rented,
    Maintenance,
    Offline,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Drone {
    pub id: DroneId,
    pub owner_id: UserId,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub max_load: f64,
    #[serde(default)]
    pub max_flight_time: i32,
    #[serde(default)]
    pub max_distance: f64,
    #[serde(default)]
    pub features: Option<serde_json::Value>,
    #[serde(default)]
    pub images: Option<serde_json::Value>,
    #[serde(default)]
    pub certification_status: String,
    #[serde(default)]
    pub daily_price: Money,
    #[serde(default)]
    pub hourly_price: Money,
    #[serde(default)]
    pub deposit: Money,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub availability_status: Availability,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub order_count: i32,
    #[serde(default)]
    pub description: String,
}

impl Drone {
    pub fn display_name(&self) -> String {
        match (self.brand.trim(), self.model.trim()) {
            ("", "") => format!("Drone #{}", self.id),
            (brand, "") => brand.to_string(),
            ("", model) => model.to_string(),
            (brand, model) => format!("{brand} {model}"),
        }
    }
}

// --- Orders ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Created,
    Accepted,
    Paid,
    InProgress,
    Completed,
    Cancelled,
    Rejected,
    Refunded,
    /// A status this client does not know; nothing is offered for it.
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        Self::Created,
        Self::Accepted,
        Self::Paid,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
        Self::Rejected,
        Self::Refunded,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Accepted => "accepted",
            Self::Paid => "paid",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Refunded => "refunded",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Rejected | Self::Refunded
        )
    }

    /// Position along `created -> accepted -> paid -> in_progress -> terminal`.
    #[must_use]
    pub const fn stage(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Accepted => 1,
            Self::Paid => 2,
            Self::InProgress => 3,
            Self::Completed | Self::Cancelled | Self::Rejected | Self::Refunded => 4,
            Self::Unknown => u8::MAX,
        }
    }

    #[must_use]
    pub fn valid_transitions(self) -> &'static [OrderStatus] {
        match self {
            Self::Created => &[Self::Accepted, Self::Rejected, Self::Cancelled],
            Self::Accepted => &[Self::Paid, Self::Cancelled],
            Self::Paid => &[Self::InProgress, Self::Cancelled, Self::Refunded],
            Self::InProgress => &[Self::Completed],
            Self::Completed
            | Self::Cancelled
            | Self::Rejected
            | Self::Refunded
            | Self::Unknown => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    #[serde(default)]
    pub order_no: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub related_id: i64,
    #[serde(default)]
    pub drone_id: Option<DroneId>,
    pub owner_id: UserId,
    pub renter_id: UserId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub service_latitude: Option<f64>,
    #[serde(default)]
    pub service_longitude: Option<f64>,
    #[serde(default)]
    pub service_address: String,
    pub total_amount: Money,
    #[serde(default)]
    pub platform_commission_rate: f64,
    #[serde(default)]
    pub platform_commission: Money,
    #[serde(default)]
    pub owner_amount: Money,
    #[serde(default)]
    pub deposit_amount: Money,
    pub status: OrderStatus,
    #[serde(default)]
    pub cancel_reason: String,
    #[serde(default)]
    pub cancel_by: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub drone: Option<Drone>,
    #[serde(default)]
    pub owner: Option<User>,
    #[serde(default)]
    pub renter: Option<User>,
}

impl Order {
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }

    pub fn is_rented_by(&self, user_id: UserId) -> bool {
        self.renter_id == user_id
    }

    /// What the renter pays: order total plus deposit.
    pub fn amount_due(&self) -> Option<Money> {
        self.total_amount.checked_add(self.deposit_amount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    #[serde(default)]
    pub id: i64,
    pub order_id: OrderId,
    pub status: OrderStatus,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub operator_id: Option<UserId>,
    #[serde(default)]
    pub operator_type: String,
    #[serde(default)]
    pub created_at: String,
}

// --- Payments ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Wechat,
    Alipay,
    /// Development-only method completed through the mock callback.
    Mock,
}

impl PaymentMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wechat => "wechat",
            Self::Alipay => "alipay",
            Self::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    Refunded,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    #[serde(default)]
    pub id: Option<PaymentId>,
    pub payment_no: String,
    pub order_id: OrderId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub payment_type: String,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub amount: Money,
    #[serde(default)]
    pub status: PaymentStatus,
    #[serde(default)]
    pub third_party_no: String,
    #[serde(default)]
    pub paid_at: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

// --- Reviews ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub id: ReviewId,
    pub order_id: OrderId,
    pub reviewer_id: UserId,
    #[serde(default)]
    pub reviewee_id: Option<UserId>,
    #[serde(default)]
    pub review_type: String,
    pub rating: u8,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_deserializes_from_backend_shape() {
        let order: Order = serde_json::from_value(json!({
            "id": 42,
            "order_no": "ORD20240101000042",
            "order_type": "rental",
            "drone_id": 7,
            "owner_id": 1,
            "renter_id": 2,
            "title": "Aerial survey",
            "total_amount": 29900,
            "deposit_amount": 5000,
            "platform_commission": 2990,
            "owner_amount": 26910,
            "status": "in_progress",
            "created_at": "2024-01-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(order.id, OrderId(42));
        assert_eq!(order.status, OrderStatus::InProgress);
        assert_eq!(order.amount_due(), Some(Money::from_minor(34_900)));
        assert!(order.is_owned_by(UserId(1)));
        assert!(order.is_rented_by(UserId(2)));
    }

    #[test]
    fn test_unknown_status_is_preserved_as_unknown() {
        let status: OrderStatus = serde_json::from_value(json!("disputed")).unwrap();
        assert_eq!(status, OrderStatus::Unknown);
        assert!(status.valid_transitions().is_empty());
    }

    #[test]
    fn test_status_graph_only_moves_forward() {
        for from in OrderStatus::ALL {
            for to in from.valid_transitions() {
                assert!(to.stage() > from.stage(), "{from} -> {to}");
            }
            if from.is_terminal() {
                assert!(from.valid_transitions().is_empty());
            }
        }
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: ApiEnvelope<Order> =
            serde_json::from_value(json!({"code": 0, "message": "success", "timestamp": 1}))
                .unwrap();
        assert!(envelope.is_success());
        assert!(envelope.data.is_none());
    }

    #[test]
    fn test_page_has_more() {
        let page: PageData<i64> = PageData {
            list: vec![1, 2],
            total: 5,
            page: 1,
            page_size: 2,
        };
        assert!(page.has_more());
        let last = PageData { page: 3, ..page };
        assert!(!last.has_more());
    }

    #[test]
    fn test_secrets_redacted_in_debug() {
        let pair = TokenPair {
            access_token: "acc-secret".into(),
            refresh_token: "ref-secret".into(),
            expires_in: 7200,
        };
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains("acc-secret"));
        assert!(!rendered.contains("ref-secret"));
    }
}
