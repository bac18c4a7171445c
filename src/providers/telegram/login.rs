//! Interactive Telegram login: phone, one-time code, optional 2FA password.

use grammers_client::{Client, SignInError};

use crate::error::{RelayError, Result};

/// Drive the three-stage sign-in flow on the terminal. On success the caller
/// persists the session; on failure nothing is written.
pub async fn interactive_sign_in(client: &Client) -> Result<()> {
    let phone = prompt("Phone number (international format, e.g. +4915123456789): ")?;
    let token = client
        .request_login_code(&phone)
        .await
        .map_err(|e| RelayError::Auth(format!("could not request login code: {e}")))?;

    let code = prompt("Login code (sent in Telegram): ")?;
    match client.sign_in(&token, &code).await {
        Ok(user) => {
            tracing::info!(
                "telegram: signed in as {}",
                user.username().map(|u| format!("@{u}")).unwrap_or_else(|| user.id().to_string())
            );
            Ok(())
        }
        Err(SignInError::PasswordRequired(password_token)) => {
            let hint = password_token.hint().unwrap_or("none");
            let password = prompt(&format!("Two-factor password (hint: {hint}): "))?;
            client
                .check_password(password_token, password.trim())
                .await
                .map_err(|e| RelayError::Auth(format!("two-factor password rejected: {e}")))?;
            tracing::info!("telegram: signed in with two-factor authentication");
            Ok(())
        }
        Err(SignInError::InvalidCode) => Err(RelayError::Auth("login code rejected".into())),
        Err(e) => Err(RelayError::Auth(format!("sign-in failed: {e}"))),
    }
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    print!("{label}");
    std::io::stdout()
        .flush()
        .map_err(|e| RelayError::transport_with("stdout flush failed", e))?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| RelayError::transport_with("stdin read failed", e))?;
    let trimmed = line.trim().to_string();
    if trimmed.is_empty() {
        return Err(RelayError::Auth("empty input".into()));
    }
    Ok(trimmed)
}
