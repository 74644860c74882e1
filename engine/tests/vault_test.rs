//! Credential vault integration tests
//!
//! Resolution order and default exclusivity are checked against both the
//! in-memory store and SQLite.

use flowbot_engine::crypto::{SecretBox, VaultKey};
use flowbot_engine::db::Database;
use flowbot_engine::secrets::SecretValue;
use flowbot_engine::store::{CredentialStore, MemoryStore};
use flowbot_engine::vault::{CredentialRef, CredentialUpdate, CredentialVault, NewCredential};
use sdk::errors::EngineError;
use sdk::types::{BotId, CredentialId};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn vault_over(store: Arc<dyn CredentialStore>) -> Arc<CredentialVault> {
    let secret_box = Arc::new(SecretBox::new(&VaultKey::generate()));
    Arc::new(CredentialVault::new(store, secret_box))
}

fn crm(bot: BotId, label: &str, is_default: bool) -> NewCredential {
    NewCredential {
        bot_id: bot,
        provider: "crm".to_string(),
        strategy: "bearer".to_string(),
        label: label.to_string(),
        scopes: vec!["contacts:read".to_string()],
        is_default,
        payload: SecretValue::new(json!({ "token": label })),
    }
}

fn crm_ref(id: Option<CredentialId>) -> CredentialRef {
    CredentialRef {
        provider: "crm".to_string(),
        strategy: "bearer".to_string(),
        id,
    }
}

async fn token(vault: &CredentialVault, bot: BotId, id: Option<CredentialId>) -> String {
    let resolved = vault.resolve(bot, &crm_ref(id)).await.unwrap();
    resolved.payload.field_str("token").unwrap().to_string()
}

async fn sqlite_vault(temp_dir: &TempDir) -> (Arc<CredentialVault>, Arc<dyn CredentialStore>, Database) {
    let database = Database::new(&temp_dir.path().join("vault.db")).await.unwrap();
    let store: Arc<dyn CredentialStore> = Arc::new(database.credentials());
    (vault_over(Arc::clone(&store)), store, database)
}

async fn check_resolution_order(vault: &CredentialVault) {
    let bot = BotId::new();

    // Nothing stored
    assert!(matches!(
        vault.resolve(bot, &crm_ref(None)).await,
        Err(EngineError::CredentialResolutionFailed { .. })
    ));

    // Singleton
    let first = vault.create(crm(bot, "first", false)).await.unwrap();
    assert_eq!(token(vault, bot, None).await, "first");

    // Two non-defaults are ambiguous
    let second = vault.create(crm(bot, "second", false)).await.unwrap();
    assert!(matches!(
        vault.resolve(bot, &crm_ref(None)).await,
        Err(EngineError::CredentialResolutionFailed { .. })
    ));

    // Default wins regardless of creation order
    vault.set_default(first.id).await.unwrap();
    assert_eq!(token(vault, bot, None).await, "first");

    // Explicit id beats the default
    assert_eq!(token(vault, bot, Some(second.id)).await, "second");

    // Unknown explicit id never falls back
    assert!(matches!(
        vault.resolve(bot, &crm_ref(Some(CredentialId::new()))).await,
        Err(EngineError::CredentialNotFound(_))
    ));

    // Another strategy of the same provider is a different tuple
    let basic = CredentialRef {
        provider: "crm".to_string(),
        strategy: "basic".to_string(),
        id: None,
    };
    assert!(vault.resolve(bot, &basic).await.is_err());

    // Other bots never see these credentials
    assert!(vault.resolve(BotId::new(), &crm_ref(None)).await.is_err());
}

async fn check_concurrent_set_default(vault: Arc<CredentialVault>, store: Arc<dyn CredentialStore>) {
    let bot = BotId::new();
    let mut ids = Vec::new();
    for n in 0..8 {
        ids.push(vault.create(crm(bot, &format!("c{}", n), false)).await.unwrap().id);
    }

    for _round in 0..3 {
        let tasks: Vec<_> = ids
            .iter()
            .map(|id| {
                let vault = Arc::clone(&vault);
                let id = *id;
                tokio::spawn(async move { vault.set_default(id).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let defaults: Vec<_> = store
            .credentials_for(bot, "crm", "bearer")
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.is_default)
            .collect();
        assert_eq!(defaults.len(), 1, "exactly one default after concurrent updates");

        let resolved = vault.resolve(bot, &crm_ref(None)).await.unwrap();
        assert_eq!(resolved.id, defaults[0].id);
    }
}

#[tokio::test]
async fn test_resolution_order_memory() {
    let vault = vault_over(Arc::new(MemoryStore::new()));
    check_resolution_order(&vault).await;
}

#[tokio::test]
async fn test_resolution_order_sqlite() {
    let temp_dir = TempDir::new().unwrap();
    let (vault, _store, database) = sqlite_vault(&temp_dir).await;
    check_resolution_order(&vault).await;
    database.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_set_default_memory() {
    let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
    check_concurrent_set_default(vault_over(Arc::clone(&store)), store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_set_default_sqlite() {
    let temp_dir = TempDir::new().unwrap();
    let (vault, store, database) = sqlite_vault(&temp_dir).await;
    check_concurrent_set_default(vault, store).await;
    database.close().await.unwrap();
}

#[tokio::test]
async fn test_create_with_default_moves_flag() {
    let temp_dir = TempDir::new().unwrap();
    let (vault, store, database) = sqlite_vault(&temp_dir).await;
    let bot = BotId::new();

    let old = vault.create(crm(bot, "old", true)).await.unwrap();
    let new = vault.create(crm(bot, "new", true)).await.unwrap();

    let old_record = store.credential(old.id).await.unwrap().unwrap();
    let new_record = store.credential(new.id).await.unwrap().unwrap();
    assert!(!old_record.is_default);
    assert!(new_record.is_default);
    assert_eq!(token(&vault, bot, None).await, "new");

    // Promoting through update clears the other default too
    vault
        .update(
            old.id,
            CredentialUpdate {
                is_default: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(token(&vault, bot, None).await, "old");

    database.close().await.unwrap();
}

#[tokio::test]
async fn test_listing_never_exposes_secrets() {
    let vault = vault_over(Arc::new(MemoryStore::new()));
    let bot = BotId::new();
    vault
        .create(NewCredential {
            payload: SecretValue::new(json!({ "token": "sup3r-s3cret" })),
            ..crm(bot, "main", true)
        })
        .await
        .unwrap();

    let listed = vault.list(bot).await.unwrap();
    assert_eq!(listed.len(), 1);
    let rendered = serde_json::to_string(&listed).unwrap();
    assert!(!rendered.contains("sup3r-s3cret"));
    assert!(rendered.contains("contacts:read"));
}

#[tokio::test]
async fn test_set_default_unknown_id() {
    let vault = vault_over(Arc::new(MemoryStore::new()));
    assert!(matches!(
        vault.set_default(CredentialId::new()).await,
        Err(EngineError::CredentialNotFound(_))
    ));
}

#[tokio::test]
async fn test_wrong_key_cannot_resolve() {
    let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
    let bot = BotId::new();
    vault_over(Arc::clone(&store))
        .create(crm(bot, "a", true))
        .await
        .unwrap();

    let other = vault_over(store);
    assert!(matches!(
        other.resolve(bot, &crm_ref(None)).await,
        Err(EngineError::Decryption)
    ));
}
