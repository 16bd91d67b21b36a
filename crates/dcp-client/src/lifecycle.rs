//! Connection lifecycle tracking.
//!
//! Every connected entity (config provider, node connection, the client
//! itself) owns a [`Lifecycle`] field and publishes its transitions through a
//! watch channel. Composition instead of a base class: owners call
//! `transition`, observers `subscribe`.

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Lifecycle {
        let (tx, _rx) = watch::channel(LifecycleState::Disconnected);
        Lifecycle { name, tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn transition(&self, to: LifecycleState) {
        let from = self.tx.send_replace(to);
        if from != to {
            debug!(entity = self.name, ?from, ?to, "lifecycle transition");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }
}

/// Await a specific state on a lifecycle subscription.
pub async fn wait_for(
    rx: &mut watch::Receiver<LifecycleState>,
    state: LifecycleState,
) -> Result<(), watch::error::RecvError> {
    while *rx.borrow() != state {
        rx.changed().await?;
    }
    Ok(())
}
