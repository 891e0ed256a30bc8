//! Terminal credentials in the OS credential store (Keychain, DPAPI or the
//! Secret Service API via the `keyring` crate).

use keyring::Entry;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

const SERVICE_NAME: &str = "festival-pos-sync";

pub const KEY_API_KEY: &str = "pos_api_key";
pub const KEY_TERMINAL_ID: &str = "terminal_id";

/// Read one credential. Missing entries and keyring failures both yield
/// `None`; failures are logged.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if !pw.trim().is_empty() => Some(pw.trim().to_string()),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    entry.set_password(value).map_err(keyring_error)?;
    info!(key, value = %redact(value), "Credential stored");
    Ok(())
}

/// Succeeds when the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_error(e)),
    }
}

/// Store the pair handed out at terminal onboarding.
pub fn store_terminal_credentials(api_key: &str, terminal_id: &str) -> Result<()> {
    let api_key = api_key.trim();
    let terminal_id = terminal_id.trim();
    if api_key.is_empty() || terminal_id.is_empty() {
        return Err(SyncError::Config(
            "apiKey and terminalId are both required".into(),
        ));
    }
    set_credential(KEY_API_KEY, api_key)?;
    set_credential(KEY_TERMINAL_ID, terminal_id)?;
    Ok(())
}

pub fn clear_terminal_credentials() -> Result<()> {
    delete_credential(KEY_API_KEY)?;
    delete_credential(KEY_TERMINAL_ID)?;
    info!("Terminal credentials cleared");
    Ok(())
}

/// Show only the last four characters of a secret.
pub fn redact(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

fn keyring_error(err: keyring::Error) -> SyncError {
    SyncError::Config(format!("keyring: {err}"))
}
