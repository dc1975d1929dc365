use std::sync::Arc;

use secrecy::SecretString;

use crate::config::Config;
use crate::crypto::random_hex;
use crate::db::Store;
use crate::services::{
    AccountService, AuthError, PasswordHasherService, Registration, SessionManager, SessionSettings,
};

pub async fn cmd_user_create(
    config: &Config,
    email: String,
    username: String,
    password: Option<String>,
    admin: bool,
) -> anyhow::Result<()> {
    let password = match password {
        Some(password) => password,
        None => {
            println!("Password for {username}:");
            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            input.trim_end_matches(['\r', '\n']).to_string()
        }
    };

    let store = Store::new(&config.general.database_path).await?;

    // No tokens are issued here, so the signing key is irrelevant.
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        &SecretString::from(random_hex(32)),
        SessionSettings::from(&config.auth),
    ));
    let accounts = AccountService::new(
        store,
        PasswordHasherService::new(config.security.clone()),
        sessions,
        config.registration.clone(),
    );

    match accounts
        .create_user(
            Registration {
                email,
                username,
                password,
            },
            admin,
        )
        .await
    {
        Ok(user) => {
            let role = if user.is_admin { "admin" } else { "user" };
            println!("✓ Created {role} {} ({})", user.username, user.id);
            Ok(())
        }
        Err(AuthError::Validation(msg) | AuthError::Conflict(msg)) => {
            println!("Could not create user: {msg}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
