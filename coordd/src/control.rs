//! One-shot settings access for `coordd get` / `coordd set`.
//!
//! The command joins as a short-lived secondary. When no primary is running
//! it briefly becomes one itself, holding the endpoint while it touches the
//! file so no other instance can start writing concurrently.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use coordd_client::{LinkEvent, PrimaryLink};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::instance::InstanceOptions;
use crate::negotiator::{InstanceIdentity, Role};
use crate::settings::SettingsStore;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for the snapshot answering our registration.
async fn wait_synced(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Result<()> {
    let synced = async {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::SettingsChanged { .. } => return Ok(()),
                LinkEvent::ShutdownRequested => bail!("primary is shutting down"),
                LinkEvent::PrimaryLost { reason } => bail!("lost primary: {reason}"),
            }
        }
        Err(anyhow!("link to primary closed"))
    };
    timeout(CONFIRM_TIMEOUT, synced)
        .await
        .context("timed out waiting for the settings snapshot")?
}

async fn finish(link: &PrimaryLink) {
    match timeout(CONFIRM_TIMEOUT, link.unregister()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("Unregister failed: {}", err),
        Err(_) => debug!("Unregister timed out"),
    }
}

pub async fn get_setting(options: &InstanceOptions, key: &str) -> Result<Option<Value>> {
    let identity = InstanceIdentity::current();
    match options.negotiator()?.negotiate(&identity, None).await? {
        Role::Secondary(conn) => {
            let (link, mut events) = PrimaryLink::start(conn, identity.id());
            let synced = wait_synced(&mut events).await;
            let value = link.get(key);
            finish(&link).await;
            synced.map(|()| value)
        }
        Role::Primary(_listener) => {
            let settings = SettingsStore::new(&options.config.settings_file)
                .load()
                .await?;
            Ok(settings.get(key).cloned())
        }
    }
}

/// Returns the settings version carrying the new value.
pub async fn set_setting(options: &InstanceOptions, key: &str, value: Value) -> Result<u64> {
    if key.is_empty() {
        bail!("setting key must not be empty");
    }
    let identity = InstanceIdentity::current();
    match options.negotiator()?.negotiate(&identity, None).await? {
        Role::Secondary(conn) => {
            let (link, mut events) = PrimaryLink::start(conn, identity.id());
            let result = async {
                wait_synced(&mut events).await?;
                link.set(key, value, CONFIRM_TIMEOUT)
                    .await
                    .context("primary did not confirm the update")
            }
            .await;
            finish(&link).await;
            result
        }
        Role::Primary(_listener) => {
            let store = SettingsStore::new(&options.config.settings_file);
            let next = store.load().await?.with_value(key, value);
            store.persist(&next).await?;
            Ok(next.version)
        }
    }
}
