#![allow(clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use imperium_core::string::{Letter, StringRequirement};
use imperium_crypto::sha256;

use super::*;
use crate::error::RequirementKind;
use crate::test_helpers::{Fixture, PASSWORD, received};

#[test]
fn ranks_are_ordered_by_authority() {
    assert!(Rank::Owner > Rank::Admin);
    assert!(Rank::Verified > Rank::Everyone);
    assert_eq!(Rank::ALL.iter().max(), Some(&Rank::Owner));
    assert_eq!("MODERATOR".parse::<Rank>().unwrap(), Rank::Moderator);
    assert!(matches!("moderator".parse::<Rank>(), Err(Error::Corrupted(_))));
}

#[test]
fn discord_ids_survive_the_signed_column() {
    let snowflake = u64::MAX - 7;
    assert_eq!(discord_from_column(discord_to_column(snowflake)), snowflake);
}

#[tokio::test]
async fn register_creates_an_everyone_account() {
    let f = Fixture::new().await;
    let id = f.account("player_one").await;

    let account = f.accounts.select_by_id(id).await.unwrap().unwrap();
    assert_eq!(account.username, "player_one");
    assert_eq!(account.rank, Rank::Everyone);
    assert_eq!(account.playtime, Duration::ZERO);
    assert_eq!(account.discord, None);
    assert!(!account.legacy);

    assert!(f.accounts.exists_by_id(id).await.unwrap());
    assert!(f.accounts.exists_by_username("player_one").await.unwrap());
    assert_eq!(
        f.accounts.select_by_username("player_one").await.unwrap(),
        Some(account)
    );

    let updates: Vec<AccountUpdate> = received(&f).await;
    assert_eq!(updates, vec![AccountUpdate { account: id }]);
}

#[tokio::test]
async fn taken_username_is_not_registered_twice() {
    let f = Fixture::new().await;
    f.account("player_one").await;

    assert_eq!(f.accounts.register("player_one", PASSWORD).await.unwrap(), None);
}

#[tokio::test]
async fn legacy_username_blocks_registration() {
    let f = Fixture::new().await;
    sqlx::query(
        "INSERT INTO legacy_account (username_hash, password_hash, password_salt) VALUES (?, x'00', x'00')",
    )
    .bind(sha256(b"old_timer").to_vec())
    .execute(f.store.pool())
    .await
    .unwrap();

    assert!(f.accounts.exists_legacy_by_username("old_timer").await.unwrap());
    assert!(!f.accounts.exists_legacy_by_username("new_comer").await.unwrap());
    assert_eq!(f.accounts.register("old_timer", PASSWORD).await.unwrap(), None);
}

#[tokio::test]
async fn unmet_requirements_are_reported_in_order() {
    let f = Fixture::new().await;

    let err = f.accounts.register("Al", PASSWORD).await.unwrap_err();
    let Error::MissingRequirements { kind, missing } = err else {
        panic!("expected missing requirements, got {err}");
    };
    assert_eq!(kind, RequirementKind::Username);
    assert_eq!(
        missing,
        vec![
            StringRequirement::Letter(Letter::AllLowercase),
            StringRequirement::Length { min: 3, max: 32 },
        ]
    );

    let err = f.accounts.register("admin", PASSWORD).await.unwrap_err();
    assert!(matches!(
        err,
        Error::MissingRequirements { kind: RequirementKind::Username, .. }
    ));

    let err = f.accounts.register("player_one", "password").await.unwrap_err();
    assert!(matches!(
        err,
        Error::MissingRequirements { kind: RequirementKind::Password, ref missing } if missing.len() == 3
    ));
    assert!(!f.accounts.exists_by_username("player_one").await.unwrap());
}

#[tokio::test]
async fn custom_requirements_replace_the_defaults() {
    let f = Fixture::new().await;
    let hasher = std::sync::Arc::new(
        imperium_crypto::PasswordHasher::new(imperium_crypto::HashParams::testing()).unwrap(),
    );
    let lenient = AccountService::new(f.store.clone(), hasher, std::sync::Arc::clone(&f.bus))
        .with_requirements(Vec::new(), vec![StringRequirement::Length { min: 1, max: 4 }]);

    assert!(lenient.username_requirements().is_empty());
    assert!(lenient.register("ANYONE", "pw").await.unwrap().is_some());
}

#[tokio::test]
async fn password_change_requires_the_current_password() {
    let f = Fixture::new().await;
    let id = f.account("player_one").await;
    assert!(f.accounts.verify_password(id, PASSWORD).await.unwrap());
    assert!(!f.accounts.verify_password(id, "Wr0ng-secret").await.unwrap());
    assert!(!f.accounts.verify_password(999, PASSWORD).await.unwrap());

    assert!(!f.accounts.update_password(id, "Wr0ng-secret", "N3w-secret").await.unwrap());
    assert!(f.accounts.update_password(id, PASSWORD, "N3w-secret").await.unwrap());

    assert!(!f.accounts.verify_password(id, PASSWORD).await.unwrap());
    assert!(f.accounts.verify_password(id, "N3w-secret").await.unwrap());
    assert!(!f.accounts.update_password(999, PASSWORD, "N3w-secret").await.unwrap());
}

#[tokio::test]
async fn weak_new_password_is_rejected() {
    let f = Fixture::new().await;
    let id = f.account("player_one").await;

    let err = f.accounts.update_password(id, PASSWORD, "short").await.unwrap_err();
    assert!(matches!(
        err,
        Error::MissingRequirements { kind: RequirementKind::Password, .. }
    ));
    assert!(f.accounts.verify_password(id, PASSWORD).await.unwrap());
}

#[tokio::test]
async fn stored_hash_uses_the_configured_lengths() {
    let f = Fixture::new().await;
    let id = f.account("player_one").await;

    let hash = f.accounts.select_password_by_id(id).await.unwrap().unwrap();
    assert_eq!(hash.hash().len(), 32);
    assert_eq!(hash.salt().len(), 16);
    assert!(f.accounts.select_password_by_id(999).await.unwrap().is_none());
}

#[tokio::test]
async fn discord_link_is_unique() {
    let f = Fixture::new().await;
    let first = f.account("player_one").await;
    let second = f.account("player_two").await;
    received::<AccountUpdate>(&f).await;

    assert!(f.accounts.update_discord(first, 42).await.unwrap());
    assert!(!f.accounts.update_discord(first, 42).await.unwrap());
    assert!(!f.accounts.update_discord(second, 42).await.unwrap());

    let linked = f.accounts.select_by_discord(42).await.unwrap().unwrap();
    assert_eq!(linked.id, first);
    assert_eq!(linked.discord, Some(42));
    assert_eq!(
        received::<AccountUpdate>(&f).await,
        vec![AccountUpdate { account: first }]
    );
}

#[tokio::test]
async fn playtime_accumulates() {
    let f = Fixture::new().await;
    let id = f.account("player_one").await;

    assert!(!f.accounts.increment_playtime(id, Duration::ZERO).await.unwrap());
    assert!(f.accounts.increment_playtime(id, Duration::from_secs(90)).await.unwrap());
    assert!(f.accounts.increment_playtime(id, Duration::from_secs(30)).await.unwrap());
    assert!(!f.accounts.increment_playtime(999, Duration::from_secs(30)).await.unwrap());

    let account = f.accounts.select_by_id(id).await.unwrap().unwrap();
    assert_eq!(account.playtime, Duration::from_secs(120));
}

#[tokio::test]
async fn rank_update_notifies_only_on_change() {
    let f = Fixture::new().await;
    let id = f.account("player_one").await;
    received::<AccountUpdate>(&f).await;

    assert!(!f.accounts.update_rank(id, Rank::Everyone).await.unwrap());
    assert!(f.accounts.update_rank(id, Rank::Admin).await.unwrap());

    assert_eq!(
        f.accounts.select_by_id(id).await.unwrap().unwrap().rank,
        Rank::Admin
    );
    assert_eq!(received::<AccountUpdate>(&f).await.len(), 1);
}

#[tokio::test]
async fn test_account_is_seeded_idempotently() {
    let f = Fixture::new().await;

    let id = f.accounts.seed_test_account().await.unwrap();
    assert_eq!(f.accounts.seed_test_account().await.unwrap(), id);

    let account = f.accounts.select_by_username("test").await.unwrap().unwrap();
    assert_eq!(account.rank, Rank::Owner);
    assert!(f.accounts.verify_password(id, "test").await.unwrap());
}

#[tokio::test]
async fn corrupted_rank_is_an_error() {
    let f = Fixture::new().await;
    let id = f.account("player_one").await;
    sqlx::query("UPDATE account SET rank = 'EMPEROR' WHERE id = ?")
        .bind(id)
        .execute(f.store.pool())
        .await
        .unwrap();

    assert!(matches!(
        f.accounts.select_by_id(id).await,
        Err(Error::Corrupted(_))
    ));
}
