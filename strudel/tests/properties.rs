use std::{collections::BTreeSet, sync::Arc};

use proptest::prelude::*;
use rand::SeedableRng;
use strudel::{
    Account, AccountManager, MemRelays, MemStorage, RecordCache,
    base::{Kind, Record, RecordDraft, RecordId, SecretKey, Tag},
    settings::{AppSettings, migrate},
};

fn secret(seed: u64) -> SecretKey {
    SecretKey::generate(&mut rand::rngs::StdRng::seed_from_u64(seed))
}

/// Versions of one coordinate, distinguished by timestamp and id.
fn versions() -> impl Strategy<Value = Vec<(u64, u8)>> {
    prop::collection::vec((0u64..4, any::<u8>()), 1..12)
}

fn record(base: &Record, created_at: u64, id: u8) -> Record {
    let mut record = base.clone();
    record.created_at = created_at;
    let mut bytes = [0u8; 32];
    bytes[0] = id;
    record.id = RecordId::from_bytes(bytes);
    record
}

fn base_record() -> Record {
    RecordDraft {
        kind: Kind::APP_DATA,
        tags: vec![Tag::identifier("nostrudel-settings")],
        content: String::new(),
        created_at: 0,
    }
    .sign(&secret(0))
}

proptest! {
    #[test]
    fn cache_converges_regardless_of_order(
        (versions, shuffled) in versions().prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
    ) {
        let base = base_record();
        let coordinate = base.coordinate().unwrap();
        let in_order = RecordCache::new(Arc::new(MemRelays::new()), None);
        let reordered = RecordCache::new(Arc::new(MemRelays::new()), None);
        for (created_at, id) in &versions {
            in_order.handle_record(record(&base, *created_at, *id));
        }
        for (created_at, id) in &shuffled {
            reordered.handle_record(record(&base, *created_at, *id));
        }
        let expected = versions
            .iter()
            .map(|(created_at, id)| record(&base, *created_at, *id))
            .max_by(|a, b| a.cmp_version(b));
        prop_assert_eq!(in_order.cached(&coordinate), expected.clone());
        prop_assert_eq!(reordered.cached(&coordinate), expected);
    }

    #[test]
    fn adding_accounts_keeps_pubkeys_unique(keys in prop::collection::vec(0u64..5, 0..20)) {
        let accounts = AccountManager::load(Arc::new(MemStorage::default())).unwrap();
        for key in &keys {
            accounts.add_account(Account::read_only(secret(*key).public())).unwrap();
        }
        let list = accounts.accounts().value();
        let unique: BTreeSet<_> = list.iter().map(|a| a.pubkey).collect();
        prop_assert_eq!(unique.len(), list.len());
        prop_assert_eq!(list.len(), keys.iter().collect::<BTreeSet<_>>().len());
    }

    #[test]
    fn migrating_current_settings_is_identity(blur in any::<bool>(), words in "[a-z ]{0,12}") {
        let settings = AppSettings {
            blur_images: blur,
            muted_words: words,
            ..Default::default()
        };
        let value = serde_json::to_value(&settings).unwrap();
        prop_assert_eq!(migrate(value).unwrap(), settings);
    }
}

#[test]
fn ties_prefer_the_smaller_id() {
    let base = base_record();
    let coordinate = base.coordinate().unwrap();
    for order in [[0xab, 0xac], [0xac, 0xab]] {
        let cache = RecordCache::new(Arc::new(MemRelays::new()), None);
        for id in order {
            cache.handle_record(record(&base, 7, id));
        }
        assert_eq!(cache.cached(&coordinate).unwrap().id.as_bytes()[0], 0xab);
    }
}

#[test]
fn ghost_session_restores_previous_account() {
    let storage = Arc::new(MemStorage::default());
    let accounts = AccountManager::load(storage).unwrap();
    let alice = Account::read_only(secret(1).public());
    accounts.add_account(alice.clone()).unwrap();
    accounts.switch_account(&alice.pubkey).unwrap();

    accounts.start_ghost(secret(2).public()).unwrap();
    assert!(accounts.is_ghost().value());
    accounts.stop_ghost().unwrap();
    assert!(!accounts.is_ghost().value());
    assert_eq!(accounts.current().value(), Some(alice));

    accounts.logout(false).unwrap();
    accounts.start_ghost(secret(2).public()).unwrap();
    accounts.stop_ghost().unwrap();
    assert_eq!(accounts.current().value(), None);
}
