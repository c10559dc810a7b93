// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests ordering, replay and failure behaviour across the billing entry points:
//! - Webhook reconciliation (BILL-W01 to BILL-W10)
//! - Checkout (BILL-C01 to BILL-C03)
//! - Subscription cancel/read (BILL-S01 to BILL-S04)
//! - Invariant sweeps (BILL-I01 to BILL-I02)

#[cfg(test)]
mod fixture {
    use std::sync::Arc;

    use serde_json::json;

    use crate::provider::test::MockPaymentProvider;
    use crate::provider::ProviderSubscription;
    use crate::record::{timestamp_to_datetime, CustomerData};
    use crate::store::test::InMemoryBillingStore;
    use crate::store::BillingStore;
    use crate::webhooks::{SignatureVerifier, WebhookEvent, WebhookOutcome};
    use crate::BillingService;

    pub const SECRET: &str = "whsec_edge_cases";
    pub const PERIOD_END: i64 = 1_900_000_000;

    pub struct Fixture {
        pub provider: MockPaymentProvider,
        pub store: InMemoryBillingStore,
        pub billing: BillingService,
    }

    impl Fixture {
        pub async fn new() -> Self {
            let provider = MockPaymentProvider::new();
            let store = InMemoryBillingStore::new();
            let billing = BillingService::with_parts(
                Arc::new(provider.clone()),
                Arc::new(store.clone()),
                SignatureVerifier::new(SECRET, 300),
            );
            store.insert_user(42, "Ada Lovelace", "ada@example.com").await;
            Self {
                provider,
                store,
                billing,
            }
        }

        pub async fn with_customer(self, customer_id: &str) -> Self {
            self.store
                .set_customer_data(42, &CustomerData::customer_only(customer_id))
                .await
                .unwrap();
            self
        }

        pub fn signed(&self, event: &serde_json::Value) -> (Vec<u8>, String) {
            let body = serde_json::to_vec(event).unwrap();
            let now = time::OffsetDateTime::now_utc().unix_timestamp();
            let header = SignatureVerifier::new(SECRET, 300).sign(&body, now).unwrap();
            (body, header)
        }

        pub async fn deliver(&self, event: serde_json::Value) -> WebhookOutcome {
            let (body, header) = self.signed(&event);
            self.billing.webhooks.process(&body, &header).await.unwrap()
        }

        pub fn decode(&self, event: serde_json::Value) -> WebhookEvent {
            let (body, header) = self.signed(&event);
            self.billing.webhooks.verify_event(&body, &header).unwrap()
        }
    }

    pub fn live_subscription(id: &str, status: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            customer_id: "cus_1".to_string(),
            status: status.to_string(),
            plan_id: Some("price_abc".to_string()),
            current_period_end: timestamp_to_datetime(PERIOD_END),
            cancel_at_period_end: false,
        }
    }

    pub fn subscription_event(
        event_id: &str,
        event_type: &str,
        sub_id: &str,
        status: &str,
        price: Option<&str>,
        period_end: i64,
    ) -> serde_json::Value {
        let items = match price {
            Some(price) => json!({"data": [{"price": {"id": price}}]}),
            None => json!({"data": []}),
        };
        json!({
            "id": event_id,
            "type": event_type,
            "data": {"object": {
                "id": sub_id,
                "object": "subscription",
                "customer": "cus_1",
                "status": status,
                "current_period_end": period_end,
                "cancel_at_period_end": false,
                "items": items
            }}
        })
    }

    pub fn checkout_completed(payment_status: &str, metadata: serde_json::Value) -> serde_json::Value {
        json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "object": "checkout.session",
                "customer": "cus_1",
                "mode": "subscription",
                "payment_status": payment_status,
                "subscription": "sub_1",
                "metadata": metadata
            }}
        })
    }
}

#[cfg(test)]
mod webhook_tests {
    use serde_json::json;

    use super::fixture::*;
    use crate::error::BillingError;
    use crate::provider::test::ProviderCall;
    use crate::record::{timestamp_to_datetime, SubscriptionData, SubscriptionStatus};
    use crate::store::BillingStore;
    use crate::webhooks::{NoOpReason, WebhookOutcome};

    // =========================================================================
    // BILL-W01: Paid subscription checkout records the fetched subscription
    // =========================================================================
    #[tokio::test]
    async fn test_paid_checkout_records_subscription() {
        let f = Fixture::new().await;
        f.provider.put_subscription(live_subscription("sub_1", "active")).await;

        let outcome = f
            .deliver(checkout_completed("paid", json!({"user_id": "42"})))
            .await;
        assert_eq!(outcome, WebhookOutcome::Applied);

        let record = f.store.record(42).await.unwrap();
        assert_eq!(record.external_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(record.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(record.subscription_period_end, timestamp_to_datetime(PERIOD_END));
        assert_eq!(record.current_plan_id.as_deref(), Some("price_abc"));
    }

    // =========================================================================
    // BILL-W02: Plan falls back to session metadata when the price is absent
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_plan_falls_back_to_metadata() {
        let f = Fixture::new().await;
        let mut sub = live_subscription("sub_1", "trialing");
        sub.plan_id = None;
        f.provider.put_subscription(sub).await;

        f.deliver(checkout_completed(
            "paid",
            json!({"user_id": "42", "plan_id": "price_from_metadata"}),
        ))
        .await;

        let record = f.store.record(42).await.unwrap();
        assert_eq!(record.current_plan_id.as_deref(), Some("price_from_metadata"));
        assert_eq!(record.subscription_status, SubscriptionStatus::Trialing);
    }

    // =========================================================================
    // BILL-W03: Default payment method is captured once, from the customer
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_captures_default_payment_method() {
        let f = Fixture::new().await;
        f.provider.put_subscription(live_subscription("sub_1", "active")).await;
        f.provider.set_default_payment_method("cus_1", "pm_card").await;

        f.deliver(checkout_completed("paid", json!({"user_id": "42"})))
            .await;
        assert_eq!(
            f.store.record(42).await.unwrap().default_payment_method_id.as_deref(),
            Some("pm_card")
        );

        // Replay does not ask again
        let calls_before = f.provider.call_count().await;
        f.deliver(checkout_completed("paid", json!({"user_id": "42"})))
            .await;
        let calls = f.provider.calls().await;
        assert_eq!(calls.len(), calls_before + 1, "only the subscription is re-fetched");
    }

    // =========================================================================
    // BILL-W10: A stored customer wins over the session's for payment method capture
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_uses_stored_customer_for_payment_method() {
        let f = Fixture::new().await.with_customer("cus_stored").await;
        f.provider.put_subscription(live_subscription("sub_1", "active")).await;
        f.provider.set_default_payment_method("cus_stored", "pm_stored").await;
        f.provider.set_default_payment_method("cus_1", "pm_session").await;

        let outcome = f
            .deliver(checkout_completed("paid", json!({"user_id": "42"})))
            .await;
        assert_eq!(outcome, WebhookOutcome::Applied);

        let record = f.store.record(42).await.unwrap();
        assert_eq!(record.external_customer_id.as_deref(), Some("cus_stored"));
        assert_eq!(record.default_payment_method_id.as_deref(), Some("pm_stored"));

        let lookups: Vec<String> = f
            .provider
            .calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::DefaultPaymentMethod(customer) => Some(customer),
                _ => None,
            })
            .collect();
        assert_eq!(lookups, vec!["cus_stored".to_string()]);
    }

    // =========================================================================
    // BILL-W04: Unpaid, unattributed or unknown-user checkouts never mutate
    // =========================================================================
    #[tokio::test]
    async fn test_non_actionable_checkouts() {
        let f = Fixture::new().await;
        f.provider.put_subscription(live_subscription("sub_1", "active")).await;

        for (status, metadata, reason) in [
            ("unpaid", json!({"user_id": "42"}), NoOpReason::NotPaid),
            ("no_payment_required", json!({"user_id": "42"}), NoOpReason::NotPaid),
            ("paid", json!({}), NoOpReason::MissingUserMetadata),
            ("paid", json!({"user_id": "forty-two"}), NoOpReason::MissingUserMetadata),
            ("paid", json!({"user_id": "7"}), NoOpReason::UserNotFound),
        ] {
            let outcome = f.deliver(checkout_completed(status, metadata)).await;
            assert_eq!(outcome, WebhookOutcome::NoOp(reason));
        }
        assert_eq!(f.store.write_count(), 0);
    }

    // =========================================================================
    // BILL-W05: Any order of updates, then the last replayed, equals the last alone
    // =========================================================================
    #[tokio::test]
    async fn test_update_replays_converge() {
        let events = [
            subscription_event("evt_1", "customer.subscription.created", "sub_1", "incomplete", Some("price_a"), 1_800_000_000),
            subscription_event("evt_2", "customer.subscription.updated", "sub_1", "active", Some("price_a"), 1_850_000_000),
            subscription_event("evt_3", "customer.subscription.updated", "sub_1", "past_due", Some("price_b"), 1_900_000_000),
        ];
        let last = events[2].clone();

        let reference = Fixture::new().await.with_customer("cus_1").await;
        reference.deliver(last.clone()).await;
        let expected = reference.store.record(42).await.unwrap();

        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let f = Fixture::new().await.with_customer("cus_1").await;
            for i in order {
                assert_eq!(f.deliver(events[i].clone()).await, WebhookOutcome::Applied);
            }
            f.deliver(last.clone()).await;
            assert_eq!(f.store.record(42).await.unwrap(), expected, "order {order:?}");
        }
    }

    // =========================================================================
    // BILL-W06: Deletion always clears fully, whatever came before
    // =========================================================================
    #[tokio::test]
    async fn test_deleted_always_clears() {
        for prior in [
            SubscriptionStatus::None,
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            let f = Fixture::new().await.with_customer("cus_1").await;
            let sub_id = if prior == SubscriptionStatus::None { "" } else { "sub_old" };
            f.store
                .set_subscription_data(
                    42,
                    &SubscriptionData::new(sub_id, "price_a", prior, timestamp_to_datetime(PERIOD_END)),
                )
                .await
                .unwrap();

            let outcome = f
                .deliver(subscription_event(
                    "evt_del",
                    "customer.subscription.deleted",
                    "sub_old",
                    "canceled",
                    Some("price_a"),
                    PERIOD_END,
                ))
                .await;
            assert_eq!(outcome, WebhookOutcome::Applied);

            let record = f.store.record(42).await.unwrap();
            assert_eq!(record.subscription_status, SubscriptionStatus::Canceled);
            assert_eq!(record.subscription_id, None);
            assert_eq!(record.current_plan_id, None);
            assert_eq!(record.subscription_period_end, None);
        }
    }

    // =========================================================================
    // BILL-W07: Missing price on update empties the plan
    // =========================================================================
    #[tokio::test]
    async fn test_update_without_price_empties_plan() {
        let f = Fixture::new().await.with_customer("cus_1").await;
        f.deliver(subscription_event("evt_1", "customer.subscription.updated", "sub_1", "active", Some("price_a"), PERIOD_END)).await;
        f.deliver(subscription_event("evt_2", "customer.subscription.updated", "sub_1", "active", None, PERIOD_END)).await;
        assert_eq!(f.store.record(42).await.unwrap().current_plan_id, None);
    }

    // =========================================================================
    // BILL-W08: Bad signature never reaches dispatch
    // =========================================================================
    #[tokio::test]
    async fn test_bad_signature_never_dispatches() {
        let f = Fixture::new().await.with_customer("cus_1").await;
        let event = subscription_event("evt_1", "customer.subscription.deleted", "sub_1", "canceled", None, 0);
        let (body, header) = f.signed(&event);
        let writes_before = f.store.write_count();

        let tampered = header.replace("v1=", "v1=ff");
        let err = f.billing.webhooks.process(&body, &tampered).await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        let err = f.billing.webhooks.process(&body, "").await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        assert_eq!(f.store.write_count(), writes_before);
        assert_eq!(f.provider.call_count().await, 0);
    }

    // =========================================================================
    // BILL-W09: Unknown event types are acknowledged and ignored
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_event_type() {
        let f = Fixture::new().await;
        let event = f.decode(json!({
            "id": "evt_x", "type": "invoice.payment_succeeded", "data": {"object": {}}
        }));
        assert_eq!(
            f.billing.webhooks.handle_event(event).await,
            WebhookOutcome::Unhandled("invoice.payment_succeeded".to_string())
        );
        assert_eq!(f.store.write_count(), 0);
    }
}

#[cfg(test)]
mod checkout_tests {
    use super::fixture::*;
    use crate::checkout::{SubscriptionCheckoutRequest, META_PLAN_ID};
    use crate::customer::META_USER_ID;
    use crate::provider::test::ProviderCall;
    use crate::provider::{CheckoutLineItem, CheckoutMode};

    fn request() -> SubscriptionCheckoutRequest {
        SubscriptionCheckoutRequest {
            plan_id: "price_abc".to_string(),
            success_url: "https://app.example.com/success".to_string(),
            cancel_url: "https://app.example.com/cancel".to_string(),
        }
    }

    // =========================================================================
    // BILL-C01: New payer gets a customer, persisted before the session is returned
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_checkout_for_new_customer() {
        let f = Fixture::new().await;

        let response = f
            .billing
            .checkout
            .create_subscription_checkout(42, request())
            .await
            .unwrap();
        assert!(response.session_id.starts_with("cs_mock_"));
        assert!(response.url.contains(&response.session_id));

        let record = f.store.record(42).await.unwrap();
        assert_eq!(record.external_customer_id.as_deref(), Some("cus_mock_0"));

        let calls = f.provider.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], ProviderCall::CreateCustomer(_)));
        let ProviderCall::CreateCheckoutSession(session) = &calls[1] else {
            panic!("expected checkout session call, got {:?}", calls[1]);
        };
        assert_eq!(session.customer_id, "cus_mock_0");
        assert_eq!(session.mode, CheckoutMode::Subscription);
        assert_eq!(
            session.line_item,
            CheckoutLineItem::Price {
                price_id: "price_abc".into()
            }
        );
        assert_eq!(session.metadata.get(META_USER_ID).map(String::as_str), Some("42"));
        assert_eq!(session.metadata.get(META_PLAN_ID).map(String::as_str), Some("price_abc"));
    }

    // =========================================================================
    // BILL-C02: Existing customer is reused without a create call
    // =========================================================================
    #[tokio::test]
    async fn test_existing_customer_is_reused() {
        let f = Fixture::new().await.with_customer("cus_known").await;
        f.billing
            .checkout
            .create_subscription_checkout(42, request())
            .await
            .unwrap();

        let calls = f.provider.calls().await;
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], ProviderCall::CreateCheckoutSession(r) if r.customer_id == "cus_known"));
    }

    // =========================================================================
    // BILL-C03: Concurrent checkouts never replace a stored customer id
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_checkouts_keep_first_customer() {
        let f = Fixture::new().await;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let checkout = f.billing.checkout.clone();
            handles.push(tokio::spawn(async move {
                checkout.create_subscription_checkout(42, request()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = f.store.record(42).await.unwrap().external_customer_id.unwrap();
        assert!(stored.starts_with("cus_mock_"));

        // Every session is billed to the customer webhooks will resolve
        let sessions: Vec<String> = f
            .provider
            .calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::CreateCheckoutSession(r) => Some(r.customer_id),
                _ => None,
            })
            .collect();
        assert_eq!(sessions.len(), 4);
        assert!(sessions.iter().all(|id| *id == stored), "{sessions:?} vs {stored}");
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::fixture::*;
    use crate::error::BillingError;
    use crate::record::{timestamp_to_datetime, SubscriptionData, SubscriptionStatus};
    use crate::store::BillingStore;

    // =========================================================================
    // BILL-S01: Cancel without a subscription id fails and calls nothing
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_without_subscription() {
        let f = Fixture::new().await.with_customer("cus_1").await;
        // A cleared record still has no id
        f.store
            .set_subscription_data(42, &SubscriptionData::cleared())
            .await
            .unwrap();

        let err = f.billing.subscriptions.cancel_subscription(42).await.unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription));
        assert_eq!(err.to_string(), "No active subscription found");
        assert_eq!(f.provider.call_count().await, 0);
    }

    // =========================================================================
    // BILL-S02: Provider outage during read serves the local projection
    // =========================================================================
    #[tokio::test]
    async fn test_read_falls_back_to_local_state() {
        let f = Fixture::new().await.with_customer("cus_1").await;
        f.store
            .set_subscription_data(
                42,
                &SubscriptionData::new(
                    "sub_1",
                    "price_abc",
                    SubscriptionStatus::Active,
                    timestamp_to_datetime(PERIOD_END),
                ),
            )
            .await
            .unwrap();
        f.provider.fail_all(true);

        let info = f.billing.subscriptions.get_subscription(42).await.unwrap();
        assert!(info.has_subscription);
        assert_eq!(info.status.as_deref(), Some("active"));
        assert_eq!(info.current_period_end, timestamp_to_datetime(PERIOD_END));
        assert_eq!(info.cancel_at_period_end, None);
    }

    // =========================================================================
    // BILL-S03: Past-due fallback is not "has subscription"
    // =========================================================================
    #[tokio::test]
    async fn test_past_due_fallback() {
        let f = Fixture::new().await.with_customer("cus_1").await;
        f.store
            .set_subscription_data(
                42,
                &SubscriptionData::new("sub_1", "price_abc", SubscriptionStatus::PastDue, None),
            )
            .await
            .unwrap();
        f.provider.fail_retrieve_subscription(true);

        let info = f.billing.subscriptions.get_subscription(42).await.unwrap();
        assert!(!info.has_subscription);
        assert_eq!(info.status.as_deref(), Some("past_due"));
    }

    // =========================================================================
    // BILL-S04: Live read folds provider statuses for has_subscription
    // =========================================================================
    #[tokio::test]
    async fn test_live_read_status_folding() {
        let f = Fixture::new().await.with_customer("cus_1").await;
        f.store
            .set_subscription_data(
                42,
                &SubscriptionData::new("sub_1", "price_abc", SubscriptionStatus::Active, None),
            )
            .await
            .unwrap();

        for (status, subscribed) in [
            ("active", true),
            ("trialing", true),
            ("incomplete", false),
            ("unpaid", false),
            ("canceled", false),
        ] {
            f.provider.put_subscription(live_subscription("sub_1", status)).await;
            let info = f.billing.subscriptions.get_subscription(42).await.unwrap();
            assert_eq!(info.has_subscription, subscribed, "status {status}");
            assert_eq!(info.status.as_deref(), Some(status));
        }
    }
}

#[cfg(test)]
mod invariant_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::fixture::*;
    use crate::invariants::{SUBSCRIPTION_HAS_CUSTOMER, SUBSCRIPTION_ID_MATCHES_STATUS};
    use crate::record::{BillingRecord, BillingUser, CustomerProfile, SubscriptionStatus};
    use crate::spawn_invariant_checks;

    // =========================================================================
    // BILL-I01: The sweep reports records that reconciliation left inconsistent
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_reports_violations() {
        let f = Fixture::new().await.with_customer("cus_1").await;
        assert!(f.billing.check_invariants().await.unwrap().healthy);

        f.store
            .insert(BillingUser {
                id: 7,
                profile: CustomerProfile::default(),
                record: BillingRecord {
                    subscription_id: None,
                    subscription_status: SubscriptionStatus::Active,
                    ..Default::default()
                },
            })
            .await;
        f.store
            .insert(BillingUser {
                id: 8,
                profile: CustomerProfile::default(),
                record: BillingRecord {
                    subscription_id: Some("sub_orphan".into()),
                    subscription_status: SubscriptionStatus::Trialing,
                    ..Default::default()
                },
            })
            .await;

        let summary = f.billing.check_invariants().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_run, 3);
        assert_eq!(summary.checks_failed, 2);

        let mut found: Vec<(&str, Vec<i64>)> = summary
            .violations
            .iter()
            .map(|v| (v.invariant.as_str(), v.user_ids.clone()))
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec![
                (SUBSCRIPTION_HAS_CUSTOMER, vec![8]),
                (SUBSCRIPTION_ID_MATCHES_STATUS, vec![7]),
            ]
        );
    }

    // =========================================================================
    // BILL-I02: The background sweep keeps running
    // =========================================================================
    #[tokio::test]
    async fn test_background_sweep_keeps_running() {
        let f = Fixture::new().await;
        let handle = spawn_invariant_checks(Arc::new(f.billing.clone()), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
