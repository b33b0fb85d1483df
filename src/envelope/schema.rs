//! The event vocabulary shared between services.
//!
//! Event names are the integration contract. They are only ever extended:
//! an existing name is never reused for a different payload shape. Each name
//! has a documented payload struct so consumers can validate what they
//! receive. Unknown extra fields are accepted so producers can add fields
//! without breaking older consumers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const BOOKING_CREATED: &str = "booking.created";
pub const BOOKING_CONFIRMED: &str = "booking.confirmed";
pub const BOOKING_CANCELLED: &str = "booking.cancelled";
pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PAYMENT_REFUNDED: &str = "payment.refunded";
pub const USER_CREATED: &str = "user.created";
pub const REVIEW_CREATED: &str = "review.created";
pub const MESSAGE_SENT: &str = "message.sent";

/// A typed event payload bound to its event name.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    const NAME: &'static str;
    const VERSION: u32 = 1;
}

macro_rules! domain_event {
    ($ty:ty, $name:expr) => {
        impl DomainEvent for $ty {
            const NAME: &'static str = $name;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingCreated {
    pub reservation_id: String,
    pub listing_id: String,
    pub guest_id: String,
    pub check_in: String,
    pub check_out: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfirmed {
    pub reservation_id: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingCancelled {
    pub reservation_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSucceeded {
    pub payment_id: String,
    pub reservation_id: String,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub payment_id: String,
    pub reservation_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefunded {
    pub payment_id: String,
    pub reservation_id: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCreated {
    pub review_id: String,
    pub listing_id: String,
    pub author_id: String,
    pub rating: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
}

domain_event!(BookingCreated, BOOKING_CREATED);
domain_event!(BookingConfirmed, BOOKING_CONFIRMED);
domain_event!(BookingCancelled, BOOKING_CANCELLED);
domain_event!(PaymentSucceeded, PAYMENT_SUCCEEDED);
domain_event!(PaymentFailed, PAYMENT_FAILED);
domain_event!(PaymentRefunded, PAYMENT_REFUNDED);
domain_event!(UserCreated, USER_CREATED);
domain_event!(ReviewCreated, REVIEW_CREATED);
domain_event!(MessageSent, MESSAGE_SENT);

/// Every event name in the vocabulary.
pub const ALL_EVENTS: &[&str] = &[
    BOOKING_CREATED,
    BOOKING_CONFIRMED,
    BOOKING_CANCELLED,
    PAYMENT_SUCCEEDED,
    PAYMENT_FAILED,
    PAYMENT_REFUNDED,
    USER_CREATED,
    REVIEW_CREATED,
    MESSAGE_SENT,
];
