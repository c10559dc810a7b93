//! Stripe webhook handling
//!
//! Verifies signed deliveries, decodes them into a closed set of events and applies them to
//! the Billing Record. Decoding only accepts a [`VerifiedPayload`], which only the signature
//! check can produce, so unverified bytes never reach dispatch.
//!
//! Every handler writes absolute values, so a redelivered event converges to the same record.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::checkout::META_PLAN_ID;
use crate::customer::META_USER_ID;
use crate::error::{BillingError, BillingResult};
use crate::provider::{DynPaymentProvider, ProviderSubscription};
use crate::record::{timestamp_to_datetime, CustomerData, SubscriptionData, SubscriptionStatus};
use crate::store::DynBillingStore;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const EVENT_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const EVENT_PAYMENT_METHOD_ATTACHED: &str = "payment_method.attached";

// ============================================================================
// Signature verification
// ============================================================================

/// Raw webhook bytes whose signature has been checked
#[derive(Debug, Clone)]
pub struct VerifiedPayload {
    bytes: Vec<u8>,
    signed_at: i64,
}

impl VerifiedPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Timestamp from the signature header
    pub fn signed_at(&self) -> i64 {
        self.signed_at
    }
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Parse `t=<unix>,v1=<hex>[,v1=<hex>...]`. Other schemes (v0) are ignored.
fn parse_signature_header(header: &str) -> BillingResult<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim() {
            "t" => timestamp = value.trim().parse::<i64>().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

/// Checks `Stripe-Signature` headers against the endpoint secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> BillingResult<VerifiedPayload> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> BillingResult<VerifiedPayload> {
        let parts = parse_signature_header(header)?;

        let age = (now - parts.timestamp).abs();
        if age > self.tolerance_secs {
            tracing::warn!(
                timestamp = parts.timestamp,
                now = now,
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = self.compute(parts.timestamp, payload)?;
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| bool::from(expected.as_slice().ct_eq(provided.as_slice())))
                .unwrap_or(false)
        });

        if !matched {
            tracing::warn!(
                payload_len = payload.len(),
                candidates = parts.signatures.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(VerifiedPayload {
            bytes: payload.to_vec(),
            signed_at: parts.timestamp,
        })
    }

    fn compute(&self, timestamp: i64, payload: &[u8]) -> BillingResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Produce a header for `payload`, as Stripe would
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let signature = hex::encode(self.compute(timestamp, payload)?);
        Ok(format!("t={timestamp},v1={signature}"))
    }
}

// ============================================================================
// Event decoding
// ============================================================================

/// Either a bare id or an expanded object carrying one
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExpandableRef {
    Id(String),
    Object { id: String },
}

impl ExpandableRef {
    fn into_id(self) -> String {
        match self {
            ExpandableRef::Id(id) => id,
            ExpandableRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    customer: Option<ExpandableRef>,
    mode: Option<String>,
    payment_status: Option<String>,
    subscription: Option<ExpandableRef>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawSubscriptionItem {
    price: Option<RawPrice>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawItemList {
    #[serde(default)]
    data: Vec<RawSubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    id: String,
    customer: Option<ExpandableRef>,
    status: String,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    items: Option<RawItemList>,
}

#[derive(Debug, Deserialize)]
struct RawPaymentMethod {
    id: String,
    customer: Option<ExpandableRef>,
}

/// A completed hosted checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub mode: String,
    pub payment_status: String,
    pub subscription_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// A subscription event payload. `customer_id` may be absent on malformed deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub customer_id: Option<String>,
    pub subscription: ProviderSubscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodAttached {
    pub payment_method_id: String,
    pub customer_id: Option<String>,
}

/// The events this service acts on, plus everything else
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    CheckoutSessionCompleted(CheckoutCompleted),
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    PaymentMethodAttached(PaymentMethodAttached),
    Unknown { event_type: String },
}

/// A decoded delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub kind: ProviderEvent,
}

fn object_as<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| {
        tracing::warn!(event_type = %event_type, error = %e, "Malformed webhook event object");
        BillingError::InvalidWebhookPayload(format!("malformed {event_type} object"))
    })
}

fn snapshot(raw: RawSubscription) -> SubscriptionSnapshot {
    let items = raw.items.unwrap_or_default().data;
    let first = items.first();

    // Newer API versions moved the period end onto the subscription item
    let period_end = raw
        .current_period_end
        .or_else(|| first.and_then(|item| item.current_period_end))
        .and_then(timestamp_to_datetime);

    let customer_id = raw.customer.map(ExpandableRef::into_id);

    SubscriptionSnapshot {
        customer_id: customer_id.clone(),
        subscription: ProviderSubscription {
            id: raw.id,
            customer_id: customer_id.unwrap_or_default(),
            status: raw.status,
            plan_id: first.and_then(|item| item.price.as_ref()).map(|p| p.id.clone()),
            current_period_end: period_end,
            cancel_at_period_end: raw.cancel_at_period_end,
        },
    }
}

impl WebhookEvent {
    /// Decode a verified delivery. Unrecognised types decode to [`ProviderEvent::Unknown`].
    pub fn decode(payload: &VerifiedPayload) -> BillingResult<Self> {
        let raw: RawEvent = serde_json::from_slice(payload.as_bytes()).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook payload");
            BillingError::InvalidWebhookPayload("malformed JSON payload".to_string())
        })?;

        let event_type = raw.event_type;
        let object = raw.data.object;

        let kind = match event_type.as_str() {
            EVENT_CHECKOUT_SESSION_COMPLETED => {
                let session: RawCheckoutSession = object_as(&event_type, object)?;
                ProviderEvent::CheckoutSessionCompleted(CheckoutCompleted {
                    session_id: session.id,
                    customer_id: session.customer.map(ExpandableRef::into_id),
                    mode: session.mode.unwrap_or_default(),
                    payment_status: session.payment_status.unwrap_or_default(),
                    subscription_id: session.subscription.map(ExpandableRef::into_id),
                    metadata: session.metadata.unwrap_or_default(),
                })
            }
            EVENT_SUBSCRIPTION_CREATED => {
                ProviderEvent::SubscriptionCreated(snapshot(object_as(&event_type, object)?))
            }
            EVENT_SUBSCRIPTION_UPDATED => {
                ProviderEvent::SubscriptionUpdated(snapshot(object_as(&event_type, object)?))
            }
            EVENT_SUBSCRIPTION_DELETED => {
                ProviderEvent::SubscriptionDeleted(snapshot(object_as(&event_type, object)?))
            }
            EVENT_PAYMENT_METHOD_ATTACHED => {
                let pm: RawPaymentMethod = object_as(&event_type, object)?;
                ProviderEvent::PaymentMethodAttached(PaymentMethodAttached {
                    payment_method_id: pm.id,
                    customer_id: pm.customer.map(ExpandableRef::into_id),
                })
            }
            _ => ProviderEvent::Unknown {
                event_type: event_type.clone(),
            },
        };

        Ok(Self {
            id: raw.id,
            event_type,
            kind,
        })
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Why a verified event changed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    MissingUserMetadata,
    NotPaid,
    UserNotFound,
    MissingCustomer,
    UnknownCustomer,
    PaymentMethodAlreadySet,
    NothingToApply,
    /// A store or provider call failed; the error was logged
    HandlerFailed,
}

impl NoOpReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoOpReason::MissingUserMetadata => "missing_user_metadata",
            NoOpReason::NotPaid => "not_paid",
            NoOpReason::UserNotFound => "user_not_found",
            NoOpReason::MissingCustomer => "missing_customer",
            NoOpReason::UnknownCustomer => "unknown_customer",
            NoOpReason::PaymentMethodAlreadySet => "payment_method_already_set",
            NoOpReason::NothingToApply => "nothing_to_apply",
            NoOpReason::HandlerFailed => "handler_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    NoOp(NoOpReason),
    Unhandled(String),
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    provider: DynPaymentProvider,
    store: DynBillingStore,
    verifier: SignatureVerifier,
}

impl WebhookHandler {
    pub fn new(
        provider: DynPaymentProvider,
        store: DynBillingStore,
        verifier: SignatureVerifier,
    ) -> Self {
        Self {
            provider,
            store,
            verifier,
        }
    }

    /// Verify the signature, then decode. Nothing is parsed if verification fails.
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        let verified = self.verifier.verify(payload, signature)?;
        let event = WebhookEvent::decode(&verified)?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook signature verified"
        );
        Ok(event)
    }

    /// Verify, decode and apply one delivery
    pub async fn process(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        Ok(self.handle_event(event).await)
    }

    /// Apply a decoded event. Internal failures are logged and reported as a no-op so the
    /// delivery is still acknowledged.
    pub async fn handle_event(&self, event: WebhookEvent) -> WebhookOutcome {
        let event_id = event.id.clone();
        let event_type = event.event_type.clone();

        let outcome = match self.process_event_internal(event.kind).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    error = %e,
                    "Webhook handler failed"
                );
                WebhookOutcome::NoOp(NoOpReason::HandlerFailed)
            }
        };

        match &outcome {
            WebhookOutcome::Applied => {
                tracing::info!(event_id = %event_id, event_type = %event_type, "Webhook applied")
            }
            WebhookOutcome::NoOp(reason) => tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                reason = reason.as_str(),
                "Webhook acknowledged without changes"
            ),
            WebhookOutcome::Unhandled(_) => tracing::debug!(
                event_id = %event_id,
                event_type = %event_type,
                "Ignoring unhandled webhook event type"
            ),
        }

        outcome
    }

    async fn process_event_internal(&self, kind: ProviderEvent) -> BillingResult<WebhookOutcome> {
        match kind {
            ProviderEvent::CheckoutSessionCompleted(session) => {
                self.handle_checkout_completed(session).await
            }
            ProviderEvent::SubscriptionCreated(snapshot)
            | ProviderEvent::SubscriptionUpdated(snapshot) => {
                self.handle_subscription_changed(snapshot).await
            }
            ProviderEvent::SubscriptionDeleted(snapshot) => {
                self.handle_subscription_deleted(snapshot).await
            }
            ProviderEvent::PaymentMethodAttached(pm) => {
                self.handle_payment_method_attached(pm).await
            }
            ProviderEvent::Unknown { event_type } => Ok(WebhookOutcome::Unhandled(event_type)),
        }
    }

    async fn handle_checkout_completed(
        &self,
        session: CheckoutCompleted,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user_id) = session
            .metadata
            .get(META_USER_ID)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        else {
            tracing::warn!(session_id = %session.session_id, "No usable user_id in session metadata");
            return Ok(WebhookOutcome::NoOp(NoOpReason::MissingUserMetadata));
        };

        if session.payment_status != "paid" {
            tracing::info!(
                session_id = %session.session_id,
                user_id = user_id,
                payment_status = %session.payment_status,
                "Checkout completed without payment"
            );
            return Ok(WebhookOutcome::NoOp(NoOpReason::NotPaid));
        }

        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::warn!(user_id = user_id, "Checkout completed for unknown user");
            return Ok(WebhookOutcome::NoOp(NoOpReason::UserNotFound));
        };

        let Some(session_customer_id) = session.customer_id.clone() else {
            tracing::warn!(session_id = %session.session_id, "Checkout session has no customer");
            return Ok(WebhookOutcome::NoOp(NoOpReason::MissingCustomer));
        };

        let mut applied = false;

        // Later subscription events are matched on the stored customer, so it drives the rest
        let customer_id = match &user.record.external_customer_id {
            Some(stored) => stored.clone(),
            None => {
                applied = true;
                self.store
                    .set_customer_data(user_id, &CustomerData::customer_only(&session_customer_id))
                    .await?
            }
        };
        if customer_id != session_customer_id {
            tracing::warn!(
                user_id = user_id,
                session_id = %session.session_id,
                session_customer_id = %session_customer_id,
                customer_id = %customer_id,
                "Checkout session customer differs from the stored customer"
            );
        }

        match (session.mode.as_str(), &session.subscription_id) {
            ("subscription", Some(subscription_id)) => {
                let subscription = self.provider.retrieve_subscription(subscription_id).await?;

                let plan_id = subscription
                    .plan_id
                    .clone()
                    .or_else(|| session.metadata.get(META_PLAN_ID).cloned())
                    .unwrap_or_default();

                let data = SubscriptionData::new(
                    &subscription.id,
                    &plan_id,
                    SubscriptionStatus::from_provider(&subscription.status),
                    subscription.current_period_end,
                );
                self.store.set_subscription_data(user_id, &data).await?;
                applied = true;

                tracing::info!(
                    user_id = user_id,
                    subscription_id = %subscription.id,
                    plan_id = %plan_id,
                    status = %data.status,
                    "Subscription recorded from checkout"
                );
            }
            ("payment", _) => {
                tracing::info!(
                    user_id = user_id,
                    session_id = %session.session_id,
                    "One-time payment completed"
                );
            }
            _ => {}
        }

        if user.record.default_payment_method_id.is_none() {
            if let Some(pm) = self.provider.default_payment_method(&customer_id).await? {
                self.store
                    .set_customer_data(
                        user_id,
                        &CustomerData::with_payment_method(&customer_id, &pm),
                    )
                    .await?;
                applied = true;
            }
        }

        Ok(if applied {
            WebhookOutcome::Applied
        } else {
            WebhookOutcome::NoOp(NoOpReason::NothingToApply)
        })
    }

    /// Resolve the account for a customer reference, or say why not
    async fn user_for_customer(
        &self,
        customer_id: Option<&str>,
    ) -> BillingResult<Result<i64, NoOpReason>> {
        let Some(customer_id) = customer_id.filter(|c| !c.is_empty()) else {
            return Ok(Err(NoOpReason::MissingCustomer));
        };
        match self.store.find_user_by_customer_id(customer_id).await? {
            Some(user) => Ok(Ok(user.id)),
            None => {
                tracing::warn!(customer_id = %customer_id, "No user for Stripe customer");
                Ok(Err(NoOpReason::UnknownCustomer))
            }
        }
    }

    async fn handle_subscription_changed(
        &self,
        snapshot: SubscriptionSnapshot,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = match self.user_for_customer(snapshot.customer_id.as_deref()).await? {
            Ok(id) => id,
            Err(reason) => return Ok(WebhookOutcome::NoOp(reason)),
        };

        let sub = snapshot.subscription;
        let data = SubscriptionData::new(
            &sub.id,
            sub.plan_id.as_deref().unwrap_or_default(),
            SubscriptionStatus::from_provider(&sub.status),
            sub.current_period_end,
        );
        self.store.set_subscription_data(user_id, &data).await?;

        tracing::info!(
            user_id = user_id,
            subscription_id = %sub.id,
            status = %data.status,
            "Subscription synced from webhook"
        );
        Ok(WebhookOutcome::Applied)
    }

    async fn handle_subscription_deleted(
        &self,
        snapshot: SubscriptionSnapshot,
    ) -> BillingResult<WebhookOutcome> {
        let user_id = match self.user_for_customer(snapshot.customer_id.as_deref()).await? {
            Ok(id) => id,
            Err(reason) => return Ok(WebhookOutcome::NoOp(reason)),
        };

        self.store
            .set_subscription_data(user_id, &SubscriptionData::cleared())
            .await?;

        tracing::info!(
            user_id = user_id,
            subscription_id = %snapshot.subscription.id,
            "Subscription cleared after deletion"
        );
        Ok(WebhookOutcome::Applied)
    }

    async fn handle_payment_method_attached(
        &self,
        pm: PaymentMethodAttached,
    ) -> BillingResult<WebhookOutcome> {
        let Some(customer_id) = pm.customer_id.filter(|c| !c.is_empty()) else {
            return Ok(WebhookOutcome::NoOp(NoOpReason::MissingCustomer));
        };
        let Some(user) = self.store.find_user_by_customer_id(&customer_id).await? else {
            tracing::warn!(customer_id = %customer_id, "No user for Stripe customer");
            return Ok(WebhookOutcome::NoOp(NoOpReason::UnknownCustomer));
        };

        if user.record.default_payment_method_id.is_some() {
            return Ok(WebhookOutcome::NoOp(NoOpReason::PaymentMethodAlreadySet));
        }

        self.store
            .set_customer_data(
                user.id,
                &CustomerData::with_payment_method(&customer_id, &pm.payment_method_id),
            )
            .await?;
        Ok(WebhookOutcome::Applied)
    }
}
