//! Startup role negotiation: connect to an existing primary, or become it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coord_common::process_utils::start_ticks;
use coord_common::{connect, try_bind, Connection, Endpoint, Listener, Message, TransportError};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("role negotiation on '{endpoint}' failed after {attempts} attempts")]
    Exhausted { endpoint: String, attempts: u32 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
pub enum Role {
    /// This process holds the endpoint.
    Primary(Listener),
    /// Connected to the primary; `RegisterInstance` already sent.
    Secondary(Connection),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Primary(_) => "primary",
            Role::Secondary(_) => "secondary",
        }
    }
}

/// Process-wide identity: `<pid>-<start ticks>` plus a `-g<n>` suffix once
/// the process has had to re-negotiate.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    pid: u32,
    base: String,
    generation: u32,
}

impl InstanceIdentity {
    pub fn current() -> Self {
        let pid = std::process::id();
        let stamp = start_ticks(pid).unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default()
        });
        Self::with_base(pid, format!("{pid}-{stamp}"))
    }

    pub fn with_base(pid: u32, base: impl Into<String>) -> Self {
        Self {
            pid,
            base: base.into(),
            generation: 0,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn id(&self) -> String {
        match self.generation {
            0 => self.base.clone(),
            n => format!("{}-g{}", self.base, n),
        }
    }

    pub fn next_generation(&mut self) {
        self.generation += 1;
    }
}

#[derive(Debug, Clone)]
pub struct Negotiator {
    endpoint: Endpoint,
    retries: u32,
    backoff: Duration,
}

impl Negotiator {
    pub fn new(endpoint: Endpoint, retries: u32, backoff: Duration) -> Self {
        Self {
            endpoint,
            retries,
            backoff,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connect first; bind only when nobody is listening. Losing a bind race
    /// means someone else just became primary, so back off and connect again.
    pub async fn negotiate(
        &self,
        identity: &InstanceIdentity,
        worker_pid: Option<u32>,
    ) -> Result<Role, NegotiationError> {
        let attempts = self.retries + 1;

        for attempt in 1..=attempts {
            match connect(&self.endpoint).await {
                Ok(mut conn) => {
                    let register = Message::RegisterInstance {
                        instance_id: identity.id(),
                        pid: identity.pid(),
                        worker_pid,
                    };
                    match conn.send(&register).await {
                        Ok(()) => {
                            info!(instance_id = %identity.id(), attempt, "Joined as secondary");
                            return Ok(Role::Secondary(conn));
                        }
                        // Primary went away between accept and write.
                        Err(err) => debug!(attempt, "Registration write failed: {}", err),
                    }
                }
                Err(TransportError::ConnectionRefused(_)) => match try_bind(&self.endpoint) {
                    Ok(listener) => {
                        info!(instance_id = %identity.id(), attempt, "Became primary");
                        return Ok(Role::Primary(listener));
                    }
                    Err(TransportError::AddressInUse(_)) => {
                        debug!(attempt, "Lost the bind race; retrying connect");
                    }
                    Err(err) => return Err(err.into()),
                },
                Err(err) => return Err(err.into()),
            }

            if attempt < attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        Err(NegotiationError::Exhausted {
            endpoint: self.endpoint.name().to_string(),
            attempts,
        })
    }
}
