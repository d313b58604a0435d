//! Host lifecycle and connectivity signals.
//!
//! Translates what the host platform reports (foreground/background,
//! connectivity, low power) into engine calls.

use agent_link_core::{Connector, CursorStore};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::engine::SessionEngine;

/// Signal from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "on", rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// App came to the foreground.
    Foreground,
    /// App went to the background.
    Background,
    /// Host connectivity came back.
    NetworkRestored,
    /// Host connectivity went away.
    NetworkLost,
    /// Low-power mode toggled.
    LowPower(bool),
}

/// Feeds lifecycle signals into a [`SessionEngine`].
///
/// - `Background` suspends the connection, keeping the session.
/// - `Foreground` triggers one immediate reconnect.
/// - `NetworkRestored` triggers one immediate reconnect.
/// - `NetworkLost` marks the network down, abandoning scheduled attempts.
/// - `LowPower` toggles suppression of automatic backoff reconnects.
pub struct LifecycleBridge<C, S>
where
    C: Connector,
    S: CursorStore,
{
    engine: SessionEngine<C, S>,
}

impl<C, S> LifecycleBridge<C, S>
where
    C: Connector,
    S: CursorStore,
{
    #[must_use]
    pub const fn new(engine: SessionEngine<C, S>) -> Self {
        Self { engine }
    }

    /// Apply one signal.
    pub async fn handle(&self, signal: LifecycleSignal) {
        tracing::debug!(?signal, "Lifecycle signal");
        match signal {
            LifecycleSignal::Foreground => {
                self.engine.reconnect_now().await;
            }
            LifecycleSignal::Background => self.engine.suspend().await,
            LifecycleSignal::NetworkRestored => {
                self.engine.set_network_available(true).await;
                self.engine.reconnect_now().await;
            }
            LifecycleSignal::NetworkLost => self.engine.set_network_available(false).await,
            LifecycleSignal::LowPower(on) => self.engine.set_low_power(on).await,
        }
    }

    /// Apply signals in order until the stream ends.
    pub async fn run(&self, signals: impl Stream<Item = LifecycleSignal>) {
        let mut signals = std::pin::pin!(signals);
        while let Some(signal) = signals.next().await {
            self.handle(signal).await;
        }
    }
}
