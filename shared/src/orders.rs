//! Order lifecycle: which actions a party may take on an order, and the
//! executor that performs them against the backend.
//!
//! ```text
//! created ──accept──▶ accepted ──pay──▶ paid ──start──▶ in_progress ──complete──▶ completed
//!    │ └──reject──▶ rejected   │             │ └──refund──▶ refunded
//!    └──cancel──────────────────┴──cancel─────┴──cancel──▶ cancelled
//! ```
//!
//! [`allowed_actions`] is the single source of truth for gating. Nothing
//! reaches the network unless it offers the action.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::model::{
    DroneId, Order, OrderId, OrderStatus, PageData, PageRequest, Review, TimelineEntry, UserId,
};
use crate::money::Money;
use crate::pipeline::{ApiClient, ApiError, ApiRequest};
use crate::{AppError, ErrorKind, MAX_PAGE_SIZE, MAX_RATING, MAX_REASON_LENGTH, MIN_RATING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Accept,
    Reject,
    Cancel,
    Pay,
    Start,
    Complete,
    Review,
}

impl OrderAction {
    pub const ALL: [OrderAction; 7] = [
        Self::Accept,
        Self::Reject,
        Self::Cancel,
        Self::Pay,
        Self::Start,
        Self::Complete,
        Self::Review,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Pay => "pay",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Review => "review",
        }
    }

    /// Status the order ends up in. `None` for review, which leaves it alone.
    pub const fn target(self) -> Option<OrderStatus> {
        match self {
            Self::Accept => Some(OrderStatus::Accepted),
            Self::Reject => Some(OrderStatus::Rejected),
            Self::Cancel => Some(OrderStatus::Cancelled),
            Self::Pay => Some(OrderStatus::Paid),
            Self::Start => Some(OrderStatus::InProgress),
            Self::Complete => Some(OrderStatus::Completed),
            Self::Review => None,
        }
    }

    /// Actions with a dedicated `PUT /order/{id}/{action}` endpoint.
    pub const fn is_direct_transition(self) -> bool {
        !matches!(self, Self::Pay | Self::Review)
    }

    pub const fn takes_reason(self) -> bool {
        matches!(self, Self::Reject | Self::Cancel)
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller's relationship to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Renter,
    Observer,
}

impl Role {
    /// Owner wins if a user somehow holds both sides of an order.
    pub fn of(order: &Order, user_id: UserId) -> Self {
        if order.is_owned_by(user_id) {
            Role::Owner
        } else if order.is_rented_by(user_id) {
            Role::Renter
        } else {
            Role::Observer
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Renter => "renter",
            Role::Observer => "observer",
        }
    }

    pub const fn is_party(self) -> bool {
        !matches!(self, Role::Observer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions offered to `role` on an order in `status`.
#[must_use]
pub fn allowed_actions(status: OrderStatus, role: Role) -> BTreeSet<OrderAction> {
    use OrderAction::{Accept, Cancel, Complete, Pay, Reject, Review, Start};

    let actions: &[OrderAction] = match (status, role) {
        (_, Role::Observer) => &[],
        (OrderStatus::Created, Role::Owner) => &[Accept, Reject],
        (OrderStatus::Created, Role::Renter) => &[Cancel],
        (OrderStatus::Accepted, Role::Renter) => &[Pay, Cancel],
        (OrderStatus::Paid, Role::Owner) => &[Start, Cancel],
        (OrderStatus::Paid, Role::Renter) => &[Cancel],
        (OrderStatus::InProgress, Role::Owner) => &[Complete],
        (OrderStatus::Completed, _) => &[Review],
        _ => &[],
    };
    actions.iter().copied().collect()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("not signed in")]
    NotSignedIn,

    #[error("a {role} cannot {action} an order that is {status}")]
    NotPermitted {
        action: OrderAction,
        status: OrderStatus,
        role: Role,
    },

    #[error("{action} is handled by its own flow, not as a direct transition")]
    NotATransition { action: OrderAction },

    #[error("order status changed from {expected} to {actual}")]
    StaleState {
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("order is {actual} after {action}; expected {expected}")]
    UnexpectedStatus {
        action: OrderAction,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("you have already reviewed this order")]
    AlreadyReviewed,

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl From<TransitionError> for AppError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Api(inner) => inner.into(),
            TransitionError::NotSignedIn => AppError::new(ErrorKind::Authentication, e.to_string()),
            TransitionError::NotPermitted { .. } => {
                AppError::new(ErrorKind::Authorization, e.to_string())
            }
            TransitionError::StaleState { .. } | TransitionError::UnexpectedStatus { .. } => {
                AppError::new(ErrorKind::Conflict, e.to_string())
            }
            TransitionError::NotATransition { .. } => {
                AppError::new(ErrorKind::InvalidState, e.to_string())
            }
            TransitionError::AlreadyReviewed | TransitionError::Invalid(_) => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
        }
    }
}

/// Filters for `GET /order`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderQuery {
    /// Which side of the order the caller is on; the backend defaults to renter.
    pub role: Option<Role>,
    pub status: Option<OrderStatus>,
    pub page: PageRequest,
}

impl OrderQuery {
    pub fn as_owner() -> Self {
        Self {
            role: Some(Role::Owner),
            ..Self::default()
        }
    }

    pub fn as_renter() -> Self {
        Self {
            role: Some(Role::Renter),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    /// `rental` or `cargo`.
    pub order_type: String,
    #[serde(default)]
    pub related_id: i64,
    pub drone_id: DroneId,
    pub title: String,
    pub service_type: String,
    pub start_time: String,
    pub end_time: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub total_amount: Money,
    #[serde(default)]
    pub auto_accept: bool,
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), TransitionError> {
        if self.title.trim().is_empty() {
            return Err(TransitionError::Invalid("title is required".into()));
        }
        if self.total_amount <= Money::ZERO {
            return Err(TransitionError::Invalid(
                "total amount must be greater than zero".into(),
            ));
        }
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(TransitionError::Invalid("service location is out of range".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReviewInput {
    pub rating: u8,
    pub content: String,
    pub images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReviewBody<'a> {
    order_id: OrderId,
    review_type: &'static str,
    target_type: &'static str,
    target_id: i64,
    rating: u8,
    content: &'a str,
    images: &'a [String],
}

#[derive(Clone, Debug)]
pub struct OrderController {
    api: Arc<ApiClient>,
}

impl OrderController {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    /// Actions the signed-in user may take on `order` right now.
    pub fn available_actions(&self, order: &Order) -> BTreeSet<OrderAction> {
        match self.api.session().current_user_id() {
            Some(user_id) => allowed_actions(order.status, Role::of(order, user_id)),
            None => BTreeSet::new(),
        }
    }

    /// [`available_actions`](Self::available_actions) with `Review` removed
    /// once the caller appears among `reviews`.
    pub fn available_actions_given(
        &self,
        order: &Order,
        reviews: &[Review],
    ) -> BTreeSet<OrderAction> {
        let mut actions = self.available_actions(order);
        if let Some(user_id) = self.api.session().current_user_id() {
            if reviews.iter().any(|r| r.reviewer_id == user_id) {
                actions.remove(&OrderAction::Review);
            }
        }
        actions
    }

    /// Actions to show for `order`. Fetches the order's reviews only when a
    /// review would otherwise be offered.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn offered_actions(&self, order: &Order) -> Result<BTreeSet<OrderAction>, ApiError> {
        let actions = self.available_actions(order);
        if !actions.contains(&OrderAction::Review) {
            return Ok(actions);
        }
        let reviews = self.reviews(order.id).await?;
        Ok(self.available_actions_given(order, &reviews))
    }

    #[instrument(skip(self))]
    pub async fn list(&self, query: &OrderQuery) -> Result<PageData<Order>, ApiError> {
        let page_size = query.page.page_size.clamp(1, MAX_PAGE_SIZE);
        let request = ApiRequest::get("/order")
            .query_opt("role", query.role.filter(|r| r.is_party()).map(Role::as_str))
            .query_opt("status", query.status.map(OrderStatus::as_str))
            .query("page", query.page.page.max(1))
            .query("page_size", page_size);
        self.api.send(request).await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: OrderId) -> Result<Order, ApiError> {
        self.api.send(ApiRequest::get(format!("/order/{id}"))).await
    }

    #[instrument(skip(self))]
    pub async fn timeline(&self, id: OrderId) -> Result<Vec<TimelineEntry>, ApiError> {
        Ok(self
            .api
            .send_optional(ApiRequest::get(format!("/order/{id}/timeline")))
            .await?
            .unwrap_or_default())
    }

    #[instrument(skip(self, order), fields(drone_id = %order.drone_id))]
    pub async fn create(&self, order: &NewOrder) -> Result<Order, TransitionError> {
        order.validate()?;
        let created: Order = self.api.send(ApiRequest::post("/order").json(order)?).await?;
        info!(order_id = %created.id, order_no = %created.order_no, "Order created");
        Ok(created)
    }

    /// Runs a direct transition and returns the re-fetched order.
    ///
    /// `order` is the snapshot the action was offered against; if the backend
    /// rejects the call because that snapshot is out of date the result is
    /// [`TransitionError::StaleState`].
    #[instrument(skip(self, order, reason), fields(order_id = %order.id, status = %order.status))]
    pub async fn perform(
        &self,
        order: &Order,
        action: OrderAction,
        reason: Option<&str>,
    ) -> Result<Order, TransitionError> {
        self.authorize(order, action)?;
        let Some(target) = action.target().filter(|_| action.is_direct_transition()) else {
            return Err(TransitionError::NotATransition { action });
        };

        let mut request = ApiRequest::put(format!("/order/{}/{}", order.id, action.as_str()));
        if action.takes_reason() {
            let reason = reason.map(str::trim).unwrap_or_default();
            if reason.chars().count() > MAX_REASON_LENGTH {
                return Err(TransitionError::Invalid(format!(
                    "reason must be at most {MAX_REASON_LENGTH} characters"
                )));
            }
            request = request.json(&serde_json::json!({ "reason": reason }))?;
        }

        if let Err(e) = self.api.send_unit(request).await {
            return Err(self.classify_failure(order, e).await);
        }

        let updated = self.get(order.id).await?;
        if updated.status != target {
            warn!(expected = %target, actual = %updated.status, "Order did not reach target status");
            return Err(TransitionError::UnexpectedStatus {
                action,
                expected: target,
                actual: updated.status,
            });
        }
        info!(%action, from = %order.status, to = %updated.status, "Order transitioned");
        Ok(updated)
    }

    /// Reviews for an order, oldest first as the backend returns them.
    #[instrument(skip(self))]
    pub async fn reviews(&self, id: OrderId) -> Result<Vec<Review>, ApiError> {
        Ok(self
            .api
            .send_optional(ApiRequest::get(format!("/review/order/{id}")))
            .await?
            .unwrap_or_default())
    }

    /// Leaves the caller's one review on a completed order.
    #[instrument(skip(self, order, input), fields(order_id = %order.id, rating = input.rating))]
    pub async fn review(&self, order: &Order, input: &ReviewInput) -> Result<(), TransitionError> {
        let (user_id, role) = self.authorize(order, OrderAction::Review)?;
        if !(MIN_RATING..=MAX_RATING).contains(&input.rating) {
            return Err(TransitionError::Invalid(format!(
                "rating must be between {MIN_RATING} and {MAX_RATING}"
            )));
        }
        if input.content.trim().is_empty() {
            return Err(TransitionError::Invalid("review content is required".into()));
        }

        let existing = self.reviews(order.id).await?;
        if existing.iter().any(|r| r.reviewer_id == user_id) {
            return Err(TransitionError::AlreadyReviewed);
        }

        let (review_type, target_type, target_id) = match (role, order.drone_id) {
            (Role::Owner, _) => ("owner_to_renter", "user", order.renter_id.get()),
            (_, Some(drone_id)) => ("renter_to_owner", "drone", drone_id.get()),
            (_, None) => ("renter_to_owner", "user", order.owner_id.get()),
        };
        let body = ReviewBody {
            order_id: order.id,
            review_type,
            target_type,
            target_id,
            rating: input.rating,
            content: input.content.trim(),
            images: &input.images,
        };
        self.api
            .send_unit(ApiRequest::post("/review").json(&body)?)
            .await?;
        info!(%review_type, "Review submitted");
        Ok(())
    }

    /// Gates `action` on the caller's role and the order's status before any
    /// network traffic.
    pub(crate) fn authorize(
        &self,
        order: &Order,
        action: OrderAction,
    ) -> Result<(UserId, Role), TransitionError> {
        let user_id = self
            .api
            .session()
            .current_user_id()
            .ok_or(TransitionError::NotSignedIn)?;
        let role = Role::of(order, user_id);
        if !allowed_actions(order.status, role).contains(&action) {
            return Err(TransitionError::NotPermitted {
                action,
                status: order.status,
                role,
            });
        }
        Ok((user_id, role))
    }

    /// A rejected transition whose order has moved on is reported as stale;
    /// anything else is passed through unchanged.
    async fn classify_failure(&self, order: &Order, error: ApiError) -> TransitionError {
        if !error.is_rejection() {
            return TransitionError::Api(error);
        }
        match self.get(order.id).await {
            Ok(current) if current.status != order.status => {
                warn!(
                    expected = %order.status,
                    actual = %current.status,
                    "Transition rejected against stale order state"
                );
                TransitionError::StaleState {
                    expected: order.status,
                    actual: current.status,
                }
            }
            _ => TransitionError::Api(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = OrderStatus> {
        prop::sample::select(OrderStatus::ALL.to_vec())
    }

    fn role_strategy() -> impl Strategy<Value = Role> {
        prop::sample::select(vec![Role::Owner, Role::Renter, Role::Observer])
    }

    #[test]
    fn test_created_order_gating() {
        assert_eq!(
            allowed_actions(OrderStatus::Created, Role::Owner),
            [OrderAction::Accept, OrderAction::Reject].into_iter().collect()
        );
        assert_eq!(
            allowed_actions(OrderStatus::Created, Role::Renter),
            [OrderAction::Cancel].into_iter().collect()
        );
        assert!(allowed_actions(OrderStatus::Created, Role::Observer).is_empty());
    }

    #[test]
    fn test_full_table() {
        let table = [
            (OrderStatus::Accepted, Role::Owner, vec![]),
            (OrderStatus::Accepted, Role::Renter, vec![OrderAction::Cancel, OrderAction::Pay]),
            (OrderStatus::Paid, Role::Owner, vec![OrderAction::Cancel, OrderAction::Start]),
            (OrderStatus::Paid, Role::Renter, vec![OrderAction::Cancel]),
            (OrderStatus::InProgress, Role::Owner, vec![OrderAction::Complete]),
            (OrderStatus::InProgress, Role::Renter, vec![]),
            (OrderStatus::Completed, Role::Owner, vec![OrderAction::Review]),
            (OrderStatus::Completed, Role::Renter, vec![OrderAction::Review]),
            (OrderStatus::Refunded, Role::Renter, vec![]),
            (OrderStatus::Unknown, Role::Owner, vec![]),
        ];
        for (status, role, expected) in table {
            let expected: BTreeSet<_> = expected.into_iter().collect();
            assert_eq!(allowed_actions(status, role), expected, "{status} / {role}");
        }
    }

    #[test]
    fn test_role_of_prefers_owner() {
        let order: Order = serde_json::from_value(serde_json::json!({
            "id": 1, "owner_id": 5, "renter_id": 5,
            "total_amount": 100, "status": "created"
        }))
        .unwrap();
        assert_eq!(Role::of(&order, UserId(5)), Role::Owner);
        assert_eq!(Role::of(&order, UserId(6)), Role::Observer);
    }

    #[test]
    fn test_transition_errors_map_to_kinds() {
        let stale = TransitionError::StaleState {
            expected: OrderStatus::Created,
            actual: OrderStatus::Cancelled,
        };
        let app = AppError::from(stale);
        assert_eq!(app.kind, ErrorKind::Conflict);
        assert_eq!(
            app.user_facing_message(),
            "This order's status changed. Please refresh and try again."
        );

        let denied = TransitionError::NotPermitted {
            action: OrderAction::Accept,
            status: OrderStatus::Created,
            role: Role::Renter,
        };
        assert_eq!(AppError::from(denied).kind, ErrorKind::Authorization);
    }

    proptest! {
        #[test]
        fn terminal_orders_offer_no_transitions(status in status_strategy(), role in role_strategy()) {
            let actions = allowed_actions(status, role);
            if status.is_terminal() || status == OrderStatus::Unknown {
                prop_assert!(actions.iter().all(|a| a.target().is_none()));
            }
        }

        #[test]
        fn offered_transitions_follow_status_graph(status in status_strategy(), role in role_strategy()) {
            for action in allowed_actions(status, role) {
                if let Some(target) = action.target() {
                    prop_assert!(status.can_transition_to(target), "{} -> {}", status, target);
                }
            }
        }

        #[test]
        fn observers_are_never_offered_anything(status in status_strategy()) {
            prop_assert!(allowed_actions(status, Role::Observer).is_empty());
        }
    }
}
