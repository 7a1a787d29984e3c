//! coordd client library
//!
//! The secondary side of the coordinator: a persistent link to the primary
//! instance that forwards registry and settings mutations and keeps a
//! read-only settings cache in step with the primary's broadcasts.

pub mod cache;

use std::io;
use std::time::Duration;

use coord_common::transport::{FrameReader, FrameWriter};
use coord_common::{Connection, Message, SettingsUpdate, SharedSettings};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use cache::{CacheUpdate, SettingsCache};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link to primary is closed")]
    Disconnected,
    #[error("timed out waiting for the primary")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Things the instance runtime has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A settings version was applied to the cache.
    SettingsChanged { version: u64 },
    /// The primary asked every secondary to shut down.
    ShutdownRequested,
    /// Connection dropped or the primary sent something undecodable.
    PrimaryLost { reason: String },
}

struct Outbound {
    msg: Message,
    flushed: Option<oneshot::Sender<io::Result<()>>>,
}

/// Handle to the primary. Cheap to clone; every clone shares one connection.
#[derive(Clone)]
pub struct PrimaryLink {
    instance_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    settings: watch::Receiver<SharedSettings>,
}

impl PrimaryLink {
    /// Take over a connection on which `RegisterInstance` was already sent.
    pub fn start(
        conn: Connection,
        instance_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let instance_id = instance_id.into();
        let (reader, writer) = conn.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (settings_tx, settings_rx) = watch::channel(SharedSettings::default());

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(
            reader,
            outbound_tx.clone(),
            settings_tx,
            events_tx,
            instance_id.clone(),
        ));

        let link = Self {
            instance_id,
            outbound: outbound_tx,
            settings: settings_rx,
        };
        (link, events_rx)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn enqueue(&self, msg: Message) -> Result<(), LinkError> {
        self.outbound
            .send(Outbound { msg, flushed: None })
            .map_err(|_| LinkError::Disconnected)
    }

    /// Enqueue and wait until the frame has been written to the socket.
    async fn send_flushed(&self, msg: Message) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                msg,
                flushed: Some(tx),
            })
            .map_err(|_| LinkError::Disconnected)?;
        match rx.await {
            Ok(result) => result.map_err(LinkError::from),
            Err(_) => Err(LinkError::Disconnected),
        }
    }

    pub fn register_worker(&self, pid: u32) -> Result<(), LinkError> {
        debug!(instance_id = %self.instance_id, pid, "Reporting worker to primary");
        self.enqueue(Message::RegisterWorker {
            instance_id: self.instance_id.clone(),
            pid,
        })
    }

    pub fn release_worker(&self, pid: u32) -> Result<(), LinkError> {
        debug!(instance_id = %self.instance_id, pid, "Releasing worker at primary");
        self.enqueue(Message::ReleaseWorker {
            instance_id: self.instance_id.clone(),
            pid,
        })
    }

    /// Tell the primary this instance is going away. Returns once the frame
    /// is on the wire.
    pub async fn unregister(&self) -> Result<(), LinkError> {
        info!(instance_id = %self.instance_id, "Unregistering from primary");
        self.send_flushed(Message::UnregisterInstance {
            instance_id: self.instance_id.clone(),
        })
        .await
    }

    pub fn request_settings(&self) -> Result<(), LinkError> {
        self.enqueue(Message::RequestGlobalSettings)
    }

    /// Current cached copy of the primary's settings.
    pub fn settings(&self) -> SharedSettings {
        self.settings.borrow().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.settings.borrow().get(key).cloned()
    }

    /// Ask the primary to set `key` and wait until its broadcast carrying the
    /// new value reaches this cache. Never applied optimistically.
    pub async fn set(&self, key: &str, value: Value, wait: Duration) -> Result<u64, LinkError> {
        let before = self.settings.borrow().version;
        self.enqueue(Message::UpdateGlobalSettings(SettingsUpdate::Set {
            key: key.to_string(),
            value: value.clone(),
        }))?;

        let mut rx = self.settings.clone();
        let confirmed = timeout(
            wait,
            rx.wait_for(|s| s.version > before && s.get(key) == Some(&value)),
        )
        .await
        .map_err(|_| LinkError::Timeout)?
        .map_err(|_| LinkError::Disconnected)?;
        Ok(confirmed.version)
    }

    /// Wait until the cache holds at least `version`.
    pub async fn wait_for_version(&self, version: u64, wait: Duration) -> Result<u64, LinkError> {
        let mut rx = self.settings.clone();
        let reached = timeout(wait, rx.wait_for(|s| s.version >= version))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(|_| LinkError::Disconnected)?;
        Ok(reached.version)
    }
}

async fn write_loop(mut writer: FrameWriter, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { msg, flushed }) = outbound.recv().await {
        let result = writer.send(&msg).await;
        let failed = result.is_err();
        if let Err(err) = &result {
            warn!(kind = msg.kind(), "Failed to write to primary: {}", err);
        }
        if let Some(tx) = flushed {
            let _ = tx.send(result);
        }
        if failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: FrameReader,
    outbound: mpsc::UnboundedSender<Outbound>,
    settings_tx: watch::Sender<SharedSettings>,
    events: mpsc::UnboundedSender<LinkEvent>,
    instance_id: String,
) {
    let mut cache = SettingsCache::new();

    let reason = loop {
        let msg = match reader.next_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break "primary closed the connection".to_string(),
            Err(err) => break format!("unreadable frame from primary: {err}"),
        };

        let update = match msg {
            Message::GlobalSettingsSnapshot(snapshot) => cache.apply_snapshot(snapshot),
            Message::UpdateGlobalSettings(SettingsUpdate::Broadcast(settings)) => {
                cache.apply_broadcast(settings)
            }
            Message::ShutdownAll => {
                info!(%instance_id, "Primary requested shutdown");
                let _ = events.send(LinkEvent::ShutdownRequested);
                continue;
            }
            other => {
                warn!(%instance_id, kind = other.kind(), "Ignoring unexpected message from primary");
                continue;
            }
        };

        match update {
            CacheUpdate::Applied { version } => {
                debug!(%instance_id, version, "Settings cache updated");
                settings_tx.send_replace(cache.current().clone());
                let _ = events.send(LinkEvent::SettingsChanged { version });
            }
            CacheUpdate::Stale { have, got } => {
                debug!(%instance_id, have, got, "Ignoring stale settings");
            }
            CacheUpdate::Gap { have, got, resync } => {
                warn!(%instance_id, have, got, "Settings version gap detected");
                if resync {
                    let _ = outbound.send(Outbound {
                        msg: Message::RequestGlobalSettings,
                        flushed: None,
                    });
                }
            }
        }
    };

    info!(%instance_id, %reason, "Link to primary lost");
    let _ = events.send(LinkEvent::PrimaryLost { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixStream;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(version: u64, theme: &str) -> SharedSettings {
        let mut settings = SharedSettings::default().with_value("theme", json!(theme));
        settings.version = version;
        settings
    }

    /// Link wired to a fake primary on the other end of a socket pair.
    fn linked() -> (PrimaryLink, mpsc::UnboundedReceiver<LinkEvent>, Connection) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (link, events) = PrimaryLink::start(Connection::new(ours), "sec-1");
        (link, events, Connection::new(theirs))
    }

    #[tokio::test]
    async fn version_gap_triggers_one_resync_request() {
        let (link, mut events, mut primary) = linked();

        primary
            .send(&Message::GlobalSettingsSnapshot(settings(4, "light")))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::SettingsChanged { version: 4 })
        );

        primary
            .send(&Message::UpdateGlobalSettings(SettingsUpdate::Broadcast(
                settings(6, "dark"),
            )))
            .await
            .unwrap();
        assert_eq!(
            primary.recv().await.unwrap(),
            Some(Message::RequestGlobalSettings)
        );
        assert_eq!(link.get("theme"), Some(json!("light")));

        primary
            .send(&Message::GlobalSettingsSnapshot(settings(6, "dark")))
            .await
            .unwrap();
        assert_eq!(link.wait_for_version(6, WAIT).await.unwrap(), 6);
        assert_eq!(link.get("theme"), Some(json!("dark")));
    }

    #[tokio::test]
    async fn set_completes_only_on_the_confirming_broadcast() {
        let (link, mut events, mut primary) = linked();
        primary
            .send(&Message::GlobalSettingsSnapshot(settings(1, "light")))
            .await
            .unwrap();
        events.recv().await;

        let setter = {
            let link = link.clone();
            tokio::spawn(async move { link.set("theme", json!("dark"), WAIT).await })
        };

        assert_eq!(
            primary.recv().await.unwrap(),
            Some(Message::UpdateGlobalSettings(SettingsUpdate::Set {
                key: "theme".into(),
                value: json!("dark"),
            }))
        );
        // Not applied optimistically.
        assert_eq!(link.get("theme"), Some(json!("light")));

        primary
            .send(&Message::UpdateGlobalSettings(SettingsUpdate::Broadcast(
                settings(2, "dark"),
            )))
            .await
            .unwrap();
        assert_eq!(setter.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn shutdown_and_loss_are_reported() {
        let (link, mut events, mut primary) = linked();
        primary.send(&Message::ShutdownAll).await.unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::ShutdownRequested));

        link.unregister().await.unwrap();
        assert_eq!(
            primary.recv().await.unwrap(),
            Some(Message::UnregisterInstance {
                instance_id: "sec-1".into()
            })
        );

        drop(primary);
        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::PrimaryLost { .. })
        ));
    }
}
