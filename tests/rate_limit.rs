mod common;

use anyhow::Result;
use common::{unique_ip, Harness, PASSWORD};
use credo::auth::{AuthError, RateLimitPolicy};
use credo::store::FailureReason;

fn policy() -> RateLimitPolicy {
    RateLimitPolicy {
        max_attempts: 5,
        ip_max_attempts: 8,
        window: chrono::Duration::minutes(15),
    }
}

#[tokio::test]
async fn fifth_failure_locks_out_the_identifier() -> Result<()> {
    let h = Harness::with_policy(policy()).await?;
    let ip = unique_ip();
    let account = h.register().await?;

    for _ in 0..5 {
        assert!(matches!(
            h.login(&account.email, "wrong password", &ip).await,
            Err(AuthError::InvalidCredentials)
        ));
        h.clock.advance(chrono::Duration::seconds(1));
    }

    // The correct password is not even checked while limited.
    assert!(matches!(
        h.login(&account.email, PASSWORD, &ip).await,
        Err(AuthError::RateLimited)
    ));
    Ok(())
}

#[tokio::test]
async fn four_failures_then_success_clears_the_count() -> Result<()> {
    let h = Harness::with_policy(policy()).await?;
    let account = h.register().await?;

    // Fresh addresses keep the per-IP limit out of the picture.
    for _ in 0..4 {
        h.login(&account.email, "wrong password", &unique_ip()).await.ok();
        h.clock.advance(chrono::Duration::seconds(1));
    }
    h.login(&account.email, PASSWORD, &unique_ip()).await?;
    h.clock.advance(chrono::Duration::seconds(1));

    for _ in 0..4 {
        h.login(&account.email, "wrong password", &unique_ip()).await.ok();
        h.clock.advance(chrono::Duration::seconds(1));
    }
    h.login(&account.email, PASSWORD, &unique_ip()).await?;
    Ok(())
}

#[tokio::test]
async fn own_login_does_not_reset_the_address_count() -> Result<()> {
    let h = Harness::with_policy(policy()).await?;
    let ip = unique_ip();
    let own = h.register().await?;
    let victim = h.register().await?;

    for round in 0..2 {
        for _ in 0..4 {
            let ghost = format!("{}@example.com", common::unique("spray"));
            h.login(&ghost, "guess", &ip).await.ok();
        }
        h.clock.advance(chrono::Duration::seconds(1));
        if round == 0 {
            h.login(&own.email, PASSWORD, &ip).await?;
            h.clock.advance(chrono::Duration::seconds(1));
        }
    }

    // Eight failures from one address, with a success in between.
    assert!(matches!(
        h.login(&victim.email, PASSWORD, &ip).await,
        Err(AuthError::RateLimited)
    ));
    assert!(matches!(
        h.login(&own.email, PASSWORD, &ip).await,
        Err(AuthError::RateLimited)
    ));
    Ok(())
}

#[tokio::test]
async fn failures_age_out_of_the_window() -> Result<()> {
    let h = Harness::with_policy(policy()).await?;
    let ip = unique_ip();
    let account = h.register().await?;

    for _ in 0..5 {
        h.login(&account.email, "wrong password", &ip).await.ok();
    }
    assert!(matches!(
        h.login(&account.email, PASSWORD, &ip).await,
        Err(AuthError::RateLimited)
    ));

    h.clock.advance(chrono::Duration::minutes(16));
    h.login(&account.email, PASSWORD, &ip).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_identifiers_are_throttled_too() -> Result<()> {
    let h = Harness::with_policy(policy()).await?;
    let ip = unique_ip();
    let ghost = format!("{}@example.com", common::unique("ghost"));

    for _ in 0..5 {
        assert!(matches!(
            h.login(&ghost, PASSWORD, &ip).await,
            Err(AuthError::InvalidCredentials)
        ));
    }
    assert!(matches!(
        h.login(&ghost, PASSWORD, &ip).await,
        Err(AuthError::RateLimited)
    ));
    Ok(())
}

#[tokio::test]
async fn one_address_spraying_many_accounts_is_limited() -> Result<()> {
    let h = Harness::with_policy(policy()).await?;
    let ip = unique_ip();
    let victim = h.register().await?;

    // Spread across identifiers so no single one reaches its own limit.
    for _ in 0..8 {
        let ghost = format!("{}@example.com", common::unique("spray"));
        h.login(&ghost, "guess", &ip).await.ok();
    }
    assert!(matches!(
        h.login(&victim.email, PASSWORD, &ip).await,
        Err(AuthError::RateLimited)
    ));

    // Another address is unaffected.
    h.login(&victim.email, PASSWORD, &unique_ip()).await?;
    Ok(())
}

#[tokio::test]
async fn wrong_otp_guesses_are_throttled() -> Result<()> {
    let h = Harness::with_policy(policy()).await?;
    let email = format!("{}@example.com", common::unique("otp"));
    let device = common::device(&unique_ip());

    h.auth.issue_email_otp(&email, "signup", &device).await?;
    let code = h.mailer.otp_code(&email).await?;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    for _ in 0..5 {
        assert!(matches!(
            h.auth.verify_email_otp(&email, "signup", wrong, &device).await,
            Err(AuthError::InvalidCredentials)
        ));
    }
    assert_eq!(
        h.attempts
            .failure_reasons(&format!("otp:signup:{email}"))
            .await,
        vec![FailureReason::InvalidCode; 5]
    );
    assert!(matches!(
        h.auth.verify_email_otp(&email, "signup", &code, &device).await,
        Err(AuthError::RateLimited)
    ));
    Ok(())
}
