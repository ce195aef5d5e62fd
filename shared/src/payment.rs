//! Payment side-channel of the `pay` action.
//!
//! Paying never transitions the order directly. A payment record is created,
//! driven to completion (mock callback in development, bounded status polling
//! otherwise), and the order is then re-fetched and must read `paid`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{
    Order, OrderId, OrderStatus, PageData, PageRequest, Payment, PaymentMethod, PaymentStatus,
};
use crate::money::Money;
use crate::orders::{OrderAction, OrderController, TransitionError};
use crate::pipeline::{path_segment, ApiClient, ApiError, ApiRequest};
use crate::{AppError, ErrorKind, MAX_PAGE_SIZE};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PaymentError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("payment response did not include a payment number")]
    MissingPaymentNo,

    #[error("payment {payment_no} failed")]
    Failed { payment_no: String },

    #[error("payment {payment_no} not confirmed after {attempts} checks")]
    TimedOut { payment_no: String, attempts: u32 },

    #[error("order is {actual} after payment; expected paid")]
    OrderNotPaid { actual: OrderStatus },

    #[error("order {order_id} cannot be refunded while {status}")]
    NotRefundable {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error("amount due overflows")]
    AmountOverflow,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl From<PaymentError> for AppError {
    fn from(e: PaymentError) -> Self {
        match e {
            PaymentError::Transition(inner) => inner.into(),
            PaymentError::Api(inner) => inner.into(),
            PaymentError::Failed { .. } => {
                AppError::new(ErrorKind::Payment, "Payment failed. Please try again.")
                    .with_internal(e.to_string())
            }
            PaymentError::TimedOut { .. } => AppError::new(
                ErrorKind::Payment,
                "Payment was not confirmed in time. Please try again.",
            )
            .with_internal(e.to_string()),
            PaymentError::OrderNotPaid { .. } => {
                AppError::new(ErrorKind::Conflict, e.to_string())
            }
            PaymentError::NotRefundable { .. } => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
            PaymentError::MissingPaymentNo | PaymentError::AmountOverflow => {
                AppError::new(ErrorKind::Deserialization, e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedPayment {
    payment: Payment,
    #[serde(default)]
    pay_params: Option<serde_json::Value>,
}

/// A created but not yet confirmed payment. For wallet methods the host
/// hands `pay_params` to the native SDK before calling
/// [`PaymentFlow::complete`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPayment {
    pub order_id: OrderId,
    pub method: PaymentMethod,
    pub payment_no: String,
    pub amount_due: Money,
    pub pay_params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaidOrder {
    pub payment_no: String,
    pub order: Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::PAYMENT_POLL_ATTEMPTS,
            interval: crate::PAYMENT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PaymentFlow {
    api: Arc<ApiClient>,
    orders: OrderController,
    policy: PollPolicy,
}

impl PaymentFlow {
    pub fn new(api: Arc<ApiClient>) -> Self {
        let config = api.config();
        let policy = PollPolicy {
            attempts: config.payment_poll_attempts.max(1),
            interval: config.payment_poll_interval(),
        };
        Self {
            orders: OrderController::new(api.clone()),
            api,
            policy,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Creates the payment and drives it to completion.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn pay(&self, order: &Order, method: PaymentMethod) -> Result<PaidOrder, PaymentError> {
        let pending = self.start(order, method).await?;
        self.complete(&pending).await
    }

    /// Creates a payment record for an accepted order.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn start(
        &self,
        order: &Order,
        method: PaymentMethod,
    ) -> Result<PendingPayment, PaymentError> {
        self.orders.authorize(order, OrderAction::Pay)?;
        let amount_due = order.amount_due().ok_or(PaymentError::AmountOverflow)?;

        let request = ApiRequest::post("/payment/create").json(&serde_json::json!({
            "order_id": order.id,
            "method": method.as_str(),
        }))?;
        let created: CreatedPayment = self.api.send(request).await?;
        if created.payment.payment_no.trim().is_empty() {
            return Err(PaymentError::MissingPaymentNo);
        }
        path_segment(&created.payment.payment_no)?;
        info!(
            payment_no = %created.payment.payment_no,
            method = method.as_str(),
            amount_due = %amount_due,
            "Payment created"
        );

        Ok(PendingPayment {
            order_id: order.id,
            method,
            payment_no: created.payment.payment_no,
            amount_due,
            pay_params: created.pay_params,
        })
    }

    /// Confirms a pending payment and returns the order once it reads `paid`.
    #[instrument(skip(self, pending), fields(payment_no = %pending.payment_no))]
    pub async fn complete(&self, pending: &PendingPayment) -> Result<PaidOrder, PaymentError> {
        match pending.method {
            PaymentMethod::Mock => self.mock_callback(&pending.payment_no).await?,
            PaymentMethod::Wechat | PaymentMethod::Alipay => {
                self.poll_until_paid(&pending.payment_no).await?;
            }
        }

        let order = self.orders.get(pending.order_id).await?;
        if order.status != OrderStatus::Paid {
            warn!(actual = %order.status, "Order not paid after payment completed");
            return Err(PaymentError::OrderNotPaid {
                actual: order.status,
            });
        }
        info!(order_id = %order.id, "Order paid");
        Ok(PaidOrder {
            payment_no: pending.payment_no.clone(),
            order,
        })
    }

    pub async fn status(&self, payment_no: &str) -> Result<Payment, ApiError> {
        let path = format!("/payment/{}/status", path_segment(payment_no)?);
        self.api.send(ApiRequest::get(path)).await
    }

    /// Checks status up to `attempts` times, sleeping `interval` between
    /// checks. A `failed` payment stops the loop early.
    #[instrument(skip(self))]
    pub async fn poll_until_paid(&self, payment_no: &str) -> Result<Payment, PaymentError> {
        let PollPolicy { attempts, interval } = self.policy;
        for attempt in 1..=attempts {
            let payment = self.status(payment_no).await?;
            debug!(attempt, status = ?payment.status, "Polled payment status");
            match payment.status {
                PaymentStatus::Paid => return Ok(payment),
                PaymentStatus::Failed => {
                    return Err(PaymentError::Failed {
                        payment_no: payment_no.to_string(),
                    })
                }
                PaymentStatus::Pending | PaymentStatus::Refunded | PaymentStatus::Unknown => {}
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        warn!(attempts, "Payment not confirmed before polling gave up");
        Err(PaymentError::TimedOut {
            payment_no: payment_no.to_string(),
            attempts,
        })
    }

    /// Refunds a paid order. Only the parties to the order may ask.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn refund(&self, order: &Order) -> Result<Order, PaymentError> {
        if order.status != OrderStatus::Paid {
            return Err(PaymentError::NotRefundable {
                order_id: order.id,
                status: order.status,
            });
        }
        let session = self.api.session();
        let user_id = session.current_user_id().ok_or(TransitionError::NotSignedIn)?;
        if !order.is_owned_by(user_id) && !order.is_rented_by(user_id) {
            return Err(PaymentError::NotRefundable {
                order_id: order.id,
                status: order.status,
            });
        }

        self.api
            .send_unit(ApiRequest::post(format!("/payment/{}/refund", order.id)))
            .await?;
        let refreshed = self.orders.get(order.id).await?;
        info!(status = %refreshed.status, "Refund requested");
        Ok(refreshed)
    }

    pub async fn history(&self, page: PageRequest) -> Result<PageData<Payment>, ApiError> {
        self.api
            .send(
                ApiRequest::get("/payment/history")
                    .query("page", page.page.max(1))
                    .query("page_size", page.page_size.clamp(1, MAX_PAGE_SIZE)),
            )
            .await
    }

    async fn mock_callback(&self, payment_no: &str) -> Result<(), PaymentError> {
        let request = ApiRequest::post("/payment/mock/callback")
            .json(&serde_json::json!({ "payment_no": payment_no }))?;
        self.api.send_unit(request).await?;
        debug!("Mock payment callback acknowledged");
        Ok(())
    }
}
