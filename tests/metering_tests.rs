//! Metering end to end: admission, refunds, cycle resets and concurrency.
//!
//! Run: cargo test --test metering_tests

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;

use voicemeter::admission::{AdmissionError, FlatRateCostPolicy};
use voicemeter::provider::{
    CloneParams, ProviderError, ScriptedProvider, SpeechParams, TranscriptionParams,
};
use voicemeter::types::{Clock, ManualClock};
use voicemeter::{
    MemoryStore, MeteringService, OperationClass, OperationRequest, QualityTier, TenantId,
    UsageOutcome,
};

const FREE_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";
const PREMIUM_VOICE: &str = "VR6AewLTigWG4xSOukaG";

fn speech(voice: &str, quality: QualityTier) -> OperationRequest {
    OperationRequest::TextToSpeech(SpeechParams {
        text: "Hello there".into(),
        voice_id: voice.into(),
        quality,
        language: "en".into(),
    })
}

fn transcription() -> OperationRequest {
    OperationRequest::SpeechToText(TranscriptionParams {
        audio: Bytes::from_static(b"RIFF....WAVE"),
        filename: "memo.wav".into(),
        language: "en".into(),
    })
}

struct Fixture {
    service: Arc<MeteringService>,
    store: Arc<MemoryStore>,
    clock: ManualClock,
}

fn fixture(provider: ScriptedProvider) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(Utc::now());
    let service = MeteringService::builder(store.clone())
        .clock(Arc::new(clock.clone()))
        .provider(Arc::new(provider))
        .provider_timeout(Duration::from_millis(200))
        .build();
    Fixture {
        service: Arc::new(service),
        store,
        clock,
    }
}

mod admission {
    use super::*;

    #[tokio::test]
    async fn test_free_tenant_drains_allotment_then_gets_insufficient() {
        let f = fixture(ScriptedProvider::new());
        let tenant = TenantId::from("user_1");

        for expected in (0..25).rev() {
            let metered = f
                .service
                .execute(&tenant, speech(FREE_VOICE, QualityTier::Standard))
                .await
                .unwrap();
            assert_eq!(metered.reservation.tokens_remaining(), expected);
        }

        let err = f
            .service
            .execute(&tenant, speech(FREE_VOICE, QualityTier::Standard))
            .await
            .unwrap_err();
        match err {
            AdmissionError::InsufficientTokens {
                operation,
                tokens_needed,
                tokens_remaining,
            } => {
                assert_eq!(operation, OperationClass::Tts);
                assert_eq!(tokens_needed, 1);
                assert_eq!(tokens_remaining, 0);
            }
            other => panic!("expected insufficient tokens, got {other:?}"),
        }

        // Operation classes are metered independently.
        let stt = f.service.execute(&tenant, transcription()).await.unwrap();
        assert_eq!(stt.reservation.tokens_remaining(), 24);
    }

    #[tokio::test]
    async fn test_entitlement_denial_does_not_consume() {
        let f = fixture(ScriptedProvider::new());
        let tenant = TenantId::from("user_1");

        for request in [
            speech(PREMIUM_VOICE, QualityTier::Standard),
            speech(FREE_VOICE, QualityTier::High),
        ] {
            let err = f.service.execute(&tenant, request).await.unwrap_err();
            assert!(matches!(err, AdmissionError::EntitlementDenied(_)));
        }

        let entry = f.service.ledger().get(&tenant, OperationClass::Tts).await.unwrap();
        assert_eq!(entry.tokens_remaining, 25);
        assert_eq!(entry.tokens_used, 0);
    }

    #[tokio::test]
    async fn test_definitive_provider_failure_refunds() {
        let provider =
            ScriptedProvider::new().then_fail(|| ProviderError::failed(Some(500), "boom"));
        let f = fixture(provider);
        let tenant = TenantId::from("user_1");

        let err = f
            .service
            .execute(&tenant, speech(FREE_VOICE, QualityTier::Standard))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::ProviderFailure { refunded: true, .. }));

        let entry = f.service.ledger().get(&tenant, OperationClass::Tts).await.unwrap();
        assert_eq!(entry.tokens_remaining, 25);

        let overview = f
            .service
            .usage_overview(&tenant, Default::default())
            .await
            .unwrap();
        assert_eq!(overview.history.len(), 1);
        assert_eq!(overview.history[0].outcome, UsageOutcome::Refunded);
    }

    #[tokio::test]
    async fn test_provider_timeout_keeps_charge() {
        let f = fixture(ScriptedProvider::new().with_delay(Duration::from_secs(5)));
        let tenant = TenantId::from("user_1");

        let err = f
            .service
            .execute(&tenant, speech(FREE_VOICE, QualityTier::Standard))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::ProviderFailure { refunded: false, .. }));

        let entry = f.service.ledger().get(&tenant, OperationClass::Tts).await.unwrap();
        assert_eq!(entry.tokens_remaining, 24);
    }

    #[tokio::test]
    async fn test_cycle_reset_restores_allotment() {
        let f = fixture(ScriptedProvider::new());
        let tenant = TenantId::from("user_1");

        for _ in 0..3 {
            f.service
                .execute(&tenant, speech(FREE_VOICE, QualityTier::Standard))
                .await
                .unwrap();
        }
        let before = f.service.ledger().get(&tenant, OperationClass::Tts).await.unwrap();
        assert_eq!(before.tokens_remaining, 22);

        f.clock.set(before.reset_date + chrono::Duration::seconds(1));
        let after = f
            .service
            .execute(&tenant, speech(FREE_VOICE, QualityTier::Standard))
            .await
            .unwrap();
        assert_eq!(after.reservation.tokens_remaining(), 24);
        assert!(after.reservation.cycle > before.reset_date);
        assert!(after.reservation.cycle > f.clock.now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(
            MeteringService::builder(store)
                .provider(Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(5))))
                .cost_policy(Arc::new(
                    FlatRateCostPolicy::new().with_rate(OperationClass::Tts, 4),
                ))
                .build(),
        );
        let tenant = TenantId::from("user_burst");

        let tasks = (0..20).map(|_| {
            let service = service.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move {
                service
                    .execute(&tenant, speech(FREE_VOICE, QualityTier::Standard))
                    .await
            })
        });
        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let granted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 6);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, AdmissionError::InsufficientTokens { .. }))
        );

        let entry = service.ledger().get(&tenant, OperationClass::Tts).await.unwrap();
        assert_eq!(entry.tokens_remaining, 1);
        assert_eq!(entry.tokens_used, 24);
    }
}

mod voices {
    use super::*;
    use voicemeter::store::SubscriptionRepository;
    use voicemeter::{BillingCycle, PlanId, Subscription, TrainingStatus};

    fn clone_request() -> OperationRequest {
        OperationRequest::VoiceClone(CloneParams {
            name: "My Voice".into(),
            description: Some("narration".into()),
            sample: Bytes::from_static(b"RIFF"),
            filename: "sample.wav".into(),
        })
    }

    #[tokio::test]
    async fn test_pro_tenant_clones_then_speaks_with_clone() {
        let f = fixture(ScriptedProvider::new());
        let tenant = TenantId::from("user_pro");
        let now = f.clock.now();

        assert!(matches!(
            f.service.execute(&tenant, clone_request()).await,
            Err(AdmissionError::EntitlementDenied(_))
        ));

        let subscription = Subscription::new(
            tenant.clone(),
            PlanId::from("pro"),
            "sub_pro",
            BillingCycle::Monthly,
            now,
            now + chrono::Duration::days(30),
            now,
        );
        f.store.save_subscription(&subscription).await.unwrap();

        let metered = f.service.execute(&tenant, clone_request()).await.unwrap();
        assert_eq!(metered.output_ref, "clone_my_voice");
        assert_eq!(metered.reservation.tokens_remaining(), 249);

        // Unknown voices are gated until the tenant's own clone is ready.
        let clone = f
            .service
            .voice_clone(&tenant, "clone_my_voice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clone.status, TrainingStatus::Ready);

        let spoken = f
            .service
            .execute(&tenant, speech("clone_my_voice", QualityTier::High))
            .await
            .unwrap();
        assert_eq!(spoken.reservation.tokens_remaining(), 249);

        assert!(f.service.delete_voice_clone(&tenant, "clone_my_voice").await.unwrap());
        assert!(f.service.list_voice_clones(&tenant).await.unwrap().is_empty());
    }
}
