//! Encrypted secret store management.
//!
//! Values never print; `list` shows names only.

use anyhow::Result;

use pdk_config::secrets::SecretStore;

use super::{EXIT_FAILURE, EXIT_OK};

pub fn set(name: &str, value: &str) -> Result<i32> {
    let mut store = SecretStore::open_default().map_err(|e| anyhow::anyhow!("{e}"))?;
    store.set(name, value);
    store.save().map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("secret '{name}' stored");
    Ok(EXIT_OK)
}

pub fn list() -> Result<i32> {
    let store = SecretStore::open_default().map_err(|e| anyhow::anyhow!("{e}"))?;
    let names: Vec<&str> = store.names().collect();
    if names.is_empty() {
        println!("no secrets stored");
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(EXIT_OK)
}

pub fn remove(name: &str) -> Result<i32> {
    let mut store = SecretStore::open_default().map_err(|e| anyhow::anyhow!("{e}"))?;
    if !store.remove(name) {
        eprintln!("no secret named '{name}'");
        return Ok(EXIT_FAILURE);
    }
    store.save().map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("secret '{name}' removed");
    Ok(EXIT_OK)
}
