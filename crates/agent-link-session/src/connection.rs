//! Connection state machine.
//!
//! Owns the connection status, the epoch, the attempt counter and the
//! pending reconnect timer. Every status change goes through here and is
//! recorded so the engine can publish it in order.

use std::time::Duration;

use agent_link_core::{ConnectionStatus, Epoch, FrameSender, TransportError};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;

/// Why a connection could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// A connection is open, opening or scheduled.
    AlreadyActive,
    /// Host connectivity is known to be down.
    NetworkUnavailable,
}

/// What to do after the transport of the current epoch went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossOutcome {
    /// Schedule the given attempt after `delay`.
    Reconnect { attempt: u32, delay: Duration },
    /// The attempt budget is spent.
    Exhausted { attempts: u32 },
    /// Not eligible for automatic reconnection.
    Idle,
}

/// Handle of one live epoch.
#[derive(Debug, Clone)]
pub struct EpochHandle {
    pub epoch: Epoch,
    /// Cancelled as soon as the epoch is superseded.
    pub cancel: CancellationToken,
}

pub struct ConnectionMachine {
    status: ConnectionStatus,
    transitions: Vec<ConnectionStatus>,
    epoch: Epoch,
    epoch_cancel: CancellationToken,
    attempt: u32,
    manual: bool,
    recovering: bool,
    network_available: bool,
    low_power: bool,
    transport: Option<Box<dyn FrameSender>>,
    pending: Option<CancellationToken>,
    backoff: Backoff,
}

impl ConnectionMachine {
    #[must_use]
    pub fn new(backoff: Backoff) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            transitions: Vec::new(),
            epoch: Epoch::default(),
            epoch_cancel: CancellationToken::new(),
            attempt: 0,
            manual: false,
            recovering: false,
            network_available: true,
            low_power: false,
            transport: None,
            pending: None,
            backoff,
        }
    }

    #[must_use]
    pub const fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == epoch
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn is_manual(&self) -> bool {
        self.manual
    }

    #[must_use]
    pub const fn network_available(&self) -> bool {
        self.network_available
    }

    #[must_use]
    pub const fn low_power(&self) -> bool {
        self.low_power
    }

    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[must_use]
    pub const fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Status changes since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<ConnectionStatus> {
        std::mem::take(&mut self.transitions)
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status.clone();
            self.transitions.push(status);
        }
    }

    fn next_epoch(&mut self) -> EpochHandle {
        self.epoch_cancel.cancel();
        self.epoch = self.epoch.next();
        self.epoch_cancel = CancellationToken::new();
        EpochHandle {
            epoch: self.epoch,
            cancel: self.epoch_cancel.clone(),
        }
    }

    /// Current epoch with its cancellation token.
    #[must_use]
    pub fn current(&self) -> EpochHandle {
        EpochHandle {
            epoch: self.epoch,
            cancel: self.epoch_cancel.clone(),
        }
    }

    /// User-initiated connect. Starts a fresh episode.
    ///
    /// # Errors
    /// Returns [`StartError`] unless disconnected with the network up.
    pub fn begin_connect(&mut self) -> Result<EpochHandle, StartError> {
        if !self.status.is_disconnected() || self.pending.is_some() {
            return Err(StartError::AlreadyActive);
        }
        if !self.network_available {
            return Err(StartError::NetworkUnavailable);
        }
        self.manual = false;
        self.recovering = false;
        self.attempt = 0;
        self.set_status(ConnectionStatus::Connecting);
        Ok(self.next_epoch())
    }

    /// Externally triggered recovery: cancels any pending timer, resets the
    /// attempt counter and opens a new epoch right away.
    pub fn begin_recovery(&mut self) -> EpochHandle {
        self.cancel_pending();
        self.attempt = 0;
        self.recovering = true;
        self.set_status(ConnectionStatus::Connecting);
        self.next_epoch()
    }

    /// A scheduled reconnect timer fired.
    pub fn begin_attempt(&mut self) -> EpochHandle {
        self.pending = None;
        self.set_status(ConnectionStatus::Connecting);
        self.next_epoch()
    }

    /// Install the write half of the current epoch's transport.
    pub fn attach(&mut self, sender: Box<dyn FrameSender>) {
        self.transport = Some(sender);
    }

    /// The server acknowledged the handshake. Returns whether this ends a
    /// reconnect episode.
    pub fn on_connected(&mut self, agent_id: String) -> bool {
        self.attempt = 0;
        self.set_status(ConnectionStatus::Connected { agent_id });
        std::mem::take(&mut self.recovering)
    }

    /// The transport of the current epoch closed, failed or could not be
    /// opened. Drops any timer tied to it and decides whether to schedule
    /// another attempt.
    pub fn on_transport_lost(&mut self, has_session: bool) -> LossOutcome {
        self.cancel_pending();
        self.transport = None;
        self.set_status(ConnectionStatus::Disconnected);

        if self.manual || !has_session || !self.network_available || self.low_power {
            self.recovering = false;
            return LossOutcome::Idle;
        }
        if !self.backoff.allows(self.attempt) {
            self.recovering = false;
            return LossOutcome::Exhausted {
                attempts: self.attempt,
            };
        }

        self.attempt += 1;
        self.recovering = true;
        self.set_status(ConnectionStatus::Reconnecting {
            attempt: self.attempt,
        });
        LossOutcome::Reconnect {
            attempt: self.attempt,
            delay: self.backoff.delay(self.attempt),
        }
    }

    /// A user-initiated connect failed to open. Never schedules a retry.
    pub fn on_open_failed(&mut self) {
        self.cancel_pending();
        self.transport = None;
        self.recovering = false;
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Server asked us to come back later. Keeps the episode alive without
    /// spending an attempt.
    pub fn defer(&mut self) {
        self.recovering = true;
        self.set_status(ConnectionStatus::Reconnecting {
            attempt: self.attempt.max(1),
        });
    }

    /// Close down: cancels timers, supersedes the epoch and hands back the
    /// transport for closing. `manual` suppresses automatic reconnection
    /// until the next connect.
    pub fn shutdown(&mut self, manual: bool) -> Option<Box<dyn FrameSender>> {
        self.cancel_pending();
        self.next_epoch();
        self.manual = manual;
        self.recovering = false;
        self.set_status(ConnectionStatus::Disconnected);
        self.transport.take()
    }

    /// Install a pending timer, cancelling any previous one.
    pub fn set_pending(&mut self, token: CancellationToken) {
        self.cancel_pending();
        self.pending = Some(token);
    }

    /// Cancel the pending timer, if any.
    pub fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    /// Forget a timer that fired without starting an attempt.
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Drop a scheduled reconnect, leaving other timers alone.
    fn abandon_reconnect(&mut self) {
        if matches!(self.status, ConnectionStatus::Reconnecting { .. }) {
            self.cancel_pending();
            self.recovering = false;
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Record host connectivity. Returns whether it changed. Going offline
    /// abandons a scheduled reconnect.
    pub fn set_network_available(&mut self, available: bool) -> bool {
        let changed = self.network_available != available;
        self.network_available = available;
        if !available {
            self.abandon_reconnect();
        }
        changed
    }

    /// Low-power mode suppresses automatic backoff reconnects.
    pub fn set_low_power(&mut self, on: bool) {
        self.low_power = on;
        if on {
            self.abandon_reconnect();
        }
    }

    /// Send a frame on the current transport.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] if no transport is attached.
    pub async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        transport.send_text(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_link_core::ReconnectConfig;

    struct NullSender;

    #[async_trait::async_trait]
    impl FrameSender for NullSender {
        async fn send_text(&mut self, _frame: String) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(Backoff::new(ReconnectConfig::default()))
    }

    fn connected(machine: &mut ConnectionMachine) -> EpochHandle {
        let handle = machine.begin_connect().unwrap();
        machine.attach(Box::new(NullSender));
        machine.on_connected("agent-1".into());
        handle
    }

    #[test]
    fn test_connect_records_transitions() {
        let mut m = machine();
        connected(&mut m);
        assert_eq!(
            m.take_transitions(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected {
                    agent_id: "agent-1".into()
                },
            ]
        );
        assert!(m.take_transitions().is_empty());
    }

    #[test]
    fn test_connect_rejected_when_active_or_offline() {
        let mut m = machine();
        connected(&mut m);
        assert_eq!(m.begin_connect().unwrap_err(), StartError::AlreadyActive);

        let mut m = machine();
        m.set_network_available(false);
        assert_eq!(
            m.begin_connect().unwrap_err(),
            StartError::NetworkUnavailable
        );
    }

    #[test]
    fn test_loss_schedules_first_attempt() {
        let mut m = machine();
        connected(&mut m);
        m.take_transitions();

        let LossOutcome::Reconnect { attempt, delay } = m.on_transport_lost(true) else {
            panic!("expected reconnect");
        };
        assert_eq!(attempt, 1);
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_millis(1500));
        assert_eq!(
            m.take_transitions(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Reconnecting { attempt: 1 },
            ]
        );
        assert!(!m.has_transport());
    }

    #[test]
    fn test_attempts_bounded() {
        let mut m = machine();
        connected(&mut m);
        for expected in 1..=5 {
            match m.on_transport_lost(true) {
                LossOutcome::Reconnect { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected {other:?}"),
            }
            m.begin_attempt();
        }
        assert_eq!(
            m.on_transport_lost(true),
            LossOutcome::Exhausted { attempts: 5 }
        );
        assert!(m.status().is_disconnected());
    }

    #[test]
    fn test_manual_disconnect_suppresses_reconnect() {
        let mut m = machine();
        let handle = connected(&mut m);
        assert!(m.shutdown(true).is_some());
        assert!(handle.cancel.is_cancelled());
        assert!(!m.is_current(handle.epoch));
        assert_eq!(m.on_transport_lost(true), LossOutcome::Idle);
    }

    #[test]
    fn test_no_session_no_reconnect() {
        let mut m = machine();
        connected(&mut m);
        assert_eq!(m.on_transport_lost(false), LossOutcome::Idle);
    }

    #[test]
    fn test_low_power_suppresses_backoff() {
        let mut m = machine();
        connected(&mut m);
        m.set_low_power(true);
        assert_eq!(m.on_transport_lost(true), LossOutcome::Idle);
    }

    #[test]
    fn test_loss_drops_pending_resend() {
        let mut m = machine();
        connected(&mut m);
        let resend = CancellationToken::new();
        m.set_pending(resend.clone());
        m.set_low_power(true);
        assert_eq!(m.on_transport_lost(true), LossOutcome::Idle);
        assert!(resend.is_cancelled());
        assert!(!m.has_pending());
        assert!(m.begin_connect().is_ok());
    }

    #[test]
    fn test_recovery_resets_counter_and_reports_episode_end() {
        let mut m = machine();
        connected(&mut m);
        m.on_transport_lost(true);
        m.set_pending(CancellationToken::new());
        let handle = m.begin_recovery();
        assert!(!m.has_pending());
        assert_eq!(m.attempt(), 0);
        assert!(m.is_current(handle.epoch));
        assert!(m.on_connected("agent-2".into()));
        assert!(!m.on_connected("agent-2".into()));
    }

    #[test]
    fn test_pending_replaced_cancels_previous() {
        let mut m = machine();
        let first = CancellationToken::new();
        m.set_pending(first.clone());
        m.set_pending(CancellationToken::new());
        assert!(first.is_cancelled());
        m.cancel_pending();
        assert!(!m.has_pending());
    }

    #[test]
    fn test_network_loss_cancels_scheduled_attempt() {
        let mut m = machine();
        connected(&mut m);
        m.on_transport_lost(true);
        let timer = CancellationToken::new();
        m.set_pending(timer.clone());
        assert!(m.set_network_available(false));
        assert!(timer.is_cancelled());
        assert!(m.status().is_disconnected());
        assert!(!m.set_network_available(false));
    }

    #[test]
    fn test_low_power_abandons_scheduled_attempt_only() {
        let mut m = machine();
        connected(&mut m);
        let resend = CancellationToken::new();
        m.set_pending(resend.clone());
        m.set_low_power(true);
        assert!(!resend.is_cancelled());
        assert!(m.status().is_connected());

        m.set_low_power(false);
        m.on_transport_lost(true);
        m.set_pending(CancellationToken::new());
        m.set_low_power(true);
        assert!(!m.has_pending());
        assert!(m.status().is_disconnected());
    }

    #[tokio::test]
    async fn test_send_without_transport() {
        let mut m = machine();
        assert!(matches!(
            m.send("x".into()).await,
            Err(TransportError::Closed)
        ));
    }
}
