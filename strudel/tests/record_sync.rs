use std::{sync::Arc, time::Duration};

use n0_snafu::ResultExt as _;
use rand::SeedableRng;
use strudel::{
    MemRelays, RecordCache, RelayTransport, RequestOptions, SettingsSync,
    base::{Kind, Record, RecordDraft, RelayUrl, SecretKey, Tag},
    settings::{AppSettings, SETTINGS_IDENTIFIER, settings_coordinate},
};
use tracing_test::traced_test;

fn relay(name: &str) -> RelayUrl {
    format!("wss://{name}.example.com").parse().unwrap()
}

fn settings_record(secret: &SecretKey, created_at: u64, content: &str) -> Record {
    RecordDraft {
        kind: Kind::APP_DATA,
        tags: vec![Tag::identifier(SETTINGS_IDENTIFIER)],
        content: content.into(),
        created_at,
    }
    .sign(secret)
}

/// Waits for relay messages to be processed by the query tasks.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
#[traced_test]
async fn shared_request_keeps_newest_record() -> n0_snafu::Result {
    let (a, b) = (relay("a"), relay("b"));
    let relays = MemRelays::with_relays([a.clone(), b.clone()]);
    let cache = RecordCache::new(Arc::new(relays.clone()), None);
    let pk1 = SecretKey::generate(&mut rand::rngs::StdRng::seed_from_u64(1));

    let first = cache.request_record(
        &[a.clone(), b.clone()],
        Kind::APP_DATA,
        pk1.public(),
        SETTINGS_IDENTIFIER,
        RequestOptions::keep_alive(),
    );
    let second = cache.request_record(
        &[a.clone(), b.clone()],
        Kind::APP_DATA,
        pk1.public(),
        SETTINGS_IDENTIFIER,
        RequestOptions::keep_alive(),
    );
    assert_eq!(relays.request_count(&a), 1);
    assert_eq!(relays.request_count(&b), 1);

    let newest = settings_record(&pk1, 1000, "{}");
    relays.publish(&a, newest.clone()).await?;
    tokio::time::timeout(Duration::from_secs(5), first.wait_for(|r| r.is_some())).await.e()?;
    assert_eq!(first.value(), Some(newest.clone()));
    assert_eq!(second.value(), Some(newest.clone()));

    let older = settings_record(&pk1, 999, r#"{"theme":"old"}"#);
    relays.publish(&b, older.clone()).await?;
    settle().await;
    assert_eq!(first.value(), Some(newest.clone()));
    assert_eq!(second.value(), Some(newest.clone()));
    assert!(!cache.handle_record(older));
    assert_eq!(cache.cached(first.coordinate()), Some(newest));
    Ok(())
}

#[tokio::test]
async fn one_shot_request_closes_every_relay() -> n0_snafu::Result {
    let (a, b) = (relay("a"), relay("b"));
    let relays = MemRelays::with_relays([a.clone(), b.clone()]);
    relays.set_silent(&b, true);
    let alice = SecretKey::generate(&mut rand::rngs::StdRng::seed_from_u64(2));
    relays.insert(&a, settings_record(&alice, 10, "{}"));
    let cache = RecordCache::new(Arc::new(relays.clone()), None);

    let request = cache.request_record(
        &[a.clone(), b.clone()],
        Kind::APP_DATA,
        alice.public(),
        SETTINGS_IDENTIFIER,
        RequestOptions::default(),
    );
    tokio::time::timeout(Duration::from_secs(5), request.wait_for(|r| r.is_some())).await.e()?;
    settle().await;
    assert!(cache.in_flight(request.coordinate()).is_empty());
    assert_eq!(relays.open_subscriptions(&a), 0);
    assert_eq!(relays.open_subscriptions(&b), 0);

    // the record stays cached after the last request is gone
    let coordinate = request.coordinate().clone();
    drop(request);
    assert_eq!(cache.interest(&coordinate), 0);
    assert!(cache.cached(&coordinate).is_some());
    Ok(())
}

#[tokio::test]
async fn settings_follow_the_newest_record() -> n0_snafu::Result {
    let a = relay("a");
    let relays = MemRelays::with_relays([a.clone()]);
    let alice = SecretKey::generate(&mut rand::rngs::StdRng::seed_from_u64(3));
    let sync = SettingsSync::new(RecordCache::new(Arc::new(relays.clone()), None));

    let settings = sync.request_app_settings(
        alice.public(),
        &[a.clone()],
        RequestOptions::keep_alive(),
    );
    assert_eq!(settings.value(), AppSettings::default());

    let draft = SettingsSync::build_settings_record(&AppSettings {
        max_page_width: "xl".into(),
        ..Default::default()
    })?;
    relays.publish(&a, draft.sign(&alice)).await?;
    let current = tokio::time::timeout(
        Duration::from_secs(5),
        settings.wait_for(|s| s.max_page_width == "xl"),
    )
    .await.e()?;
    assert_eq!(current.version, AppSettings::LATEST_VERSION);
    assert_eq!(
        settings.record().coordinate(),
        &settings_coordinate(alice.public())
    );
    Ok(())
}
