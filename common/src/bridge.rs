use crate::{
    config::BridgeConfig,
    types::{BridgeMode, BulbCommand, Counters, StatsPayload, SwitchStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    RelayOn,
    RelayOff,
    ShadowOn,
    ShadowOff,
    Publish(BulbCommand),
    Delay(u64),
}

/// Reconciliation and bypass controller for one relay and one remotely
/// commanded bulb.
///
/// Pure state machine: every entry point takes a caller-supplied monotonic
/// `now_ms` and returns the hardware/network actions to execute, in order.
/// The executor owns GPIO and MQTT; the engine owns the state.
#[derive(Debug, Clone)]
pub struct BridgeEngine {
    pub config: BridgeConfig,

    desired_on: bool,
    relay_on: bool,
    pending_since_ms: Option<u64>,
    bypass: bool,

    counters: Counters,
}

impl BridgeEngine {
    pub fn new(mut config: BridgeConfig) -> Self {
        config.sanitize();
        Self {
            config,
            desired_on: false,
            relay_on: false,
            pending_since_ms: None,
            bypass: false,
            counters: Counters::default(),
        }
    }

    pub fn desired_on(&self) -> bool {
        self.desired_on
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn bypass_active(&self) -> bool {
        self.bypass
    }

    pub fn mode(&self) -> BridgeMode {
        if self.bypass {
            BridgeMode::Bypass
        } else if self.pending_since_ms.is_some() {
            BridgeMode::AwaitingAck
        } else {
            BridgeMode::Idle
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Button edge: flip the desired state. While bypassed the relay is the
    /// sole actuator, so drive it directly and stay bypassed; the remote
    /// channel is only retried once a notification proves it alive again.
    pub fn handle_toggle(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        self.counters.toggles = self.counters.toggles.saturating_add(1);

        let target = !self.desired_on;
        self.set_desired(target, &mut actions);

        if self.bypass {
            self.set_relay(self.desired_on, &mut actions);
        } else {
            self.send_command(now_ms, &mut actions);
        }

        actions
    }

    /// Inbound state/update message from the remote actuator.
    pub fn handle_notification(&mut self, payload: &str, now_ms: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if self.bypass {
            // State may have drifted locally during the outage, so the
            // payload itself is untrusted; it only proves the channel is
            // back. Resend our own state and resume the normal cycle.
            self.counters.resyncs = self.counters.resyncs.saturating_add(1);
            self.bypass = false;
            self.send_command(now_ms, &mut actions);
            return actions;
        }

        if payload.contains(&self.config.on_marker) {
            self.set_desired(true, &mut actions);
            self.pending_since_ms = None;
            // Relay is a permanent power feed in remote-mediated mode:
            // latched on here, never released by the notification path.
            self.set_relay(true, &mut actions);
        } else if payload.contains(&self.config.off_marker) {
            self.set_desired(false, &mut actions);
            self.pending_since_ms = None;
        }
        // Anything else is inert; a pending ack deadline keeps running.

        actions
    }

    /// Ack deadline check, polled every scheduling round.
    pub fn tick(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let Some(since) = self.pending_since_ms else {
            return actions;
        };
        if now_ms.saturating_sub(since) <= self.config.ack_timeout_ms {
            return actions;
        }

        self.pending_since_ms = None;
        self.counters.missed_acks = self.counters.missed_acks.saturating_add(1);
        self.bypass = true;

        // Entering bypass with the bulb wanted on while its feed is already
        // live: the bulb PSU may have latched off on a stale OFF frame, so a
        // plain "keep relay on" would leave it dark. Cut power long enough
        // for the PSU capacitance to discharge, then re-energize.
        if self.desired_on && self.relay_on {
            self.set_relay(false, &mut actions);
            actions.push(EngineAction::Delay(self.config.discharge_hold_ms));
        }
        self.set_relay(self.desired_on, &mut actions);

        actions
    }

    /// Wi-Fi level outage observed by the transport layer.
    pub fn record_network_loss(&mut self) {
        self.counters.network_lost = self.counters.network_lost.saturating_add(1);
    }

    /// Broker disconnect observed by the transport layer.
    pub fn record_channel_loss(&mut self) {
        self.counters.channel_lost = self.counters.channel_lost.saturating_add(1);
    }

    pub fn status(&self, now_ms: u64) -> SwitchStatus {
        SwitchStatus {
            desired_on: self.desired_on,
            relay_on: self.relay_on,
            mode: self.mode().as_str(),
            ack_pending_ms: self
                .pending_since_ms
                .map(|since| now_ms.saturating_sub(since)),
            counters: self.counters,
        }
    }

    pub fn stats(&self, uptime_ms: u64) -> StatsPayload {
        StatsPayload {
            counters: self.counters,
            uptime_ms,
        }
    }

    /// Updates the desired state only on change; one shadow-indicator action
    /// per actual change.
    fn set_desired(&mut self, on: bool, actions: &mut Vec<EngineAction>) -> bool {
        if self.desired_on == on {
            return false;
        }
        self.desired_on = on;
        actions.push(if on {
            EngineAction::ShadowOn
        } else {
            EngineAction::ShadowOff
        });
        true
    }

    fn set_relay(&mut self, on: bool, actions: &mut Vec<EngineAction>) {
        if self.relay_on == on {
            return;
        }
        self.relay_on = on;
        actions.push(if on {
            EngineAction::RelayOn
        } else {
            EngineAction::RelayOff
        });
    }

    /// Exactly one publish per call; retry is the timeout machinery's job.
    fn send_command(&mut self, now_ms: u64, actions: &mut Vec<EngineAction>) {
        actions.push(EngineAction::Publish(BulbCommand::from_on(
            self.desired_on,
        )));
        self.pending_since_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn engine() -> BridgeEngine {
        BridgeEngine::new(BridgeConfig::default())
    }

    fn timeout_at(config: &BridgeConfig, armed_ms: u64) -> u64 {
        armed_ms + config.ack_timeout_ms + 1
    }

    #[test]
    fn retained_off_at_startup_settles_idle() {
        // Scenario A: first retained notification after a cold start.
        let mut engine = engine();

        let actions = engine.handle_notification("{\"state\":\"OFF\"}", 50);

        assert_eq!(actions, vec![]);
        assert!(!engine.desired_on());
        assert!(!engine.relay_on());
        assert_eq!(engine.mode(), BridgeMode::Idle);
    }

    #[test]
    fn toggle_publishes_and_acknowledged_on_latches_relay() {
        // Scenario B: happy path.
        let mut engine = engine();

        let actions = engine.handle_toggle(1_000);
        assert_eq!(
            actions,
            vec![
                EngineAction::ShadowOn,
                EngineAction::Publish(BulbCommand::On),
            ]
        );
        assert_eq!(engine.mode(), BridgeMode::AwaitingAck);

        let actions = engine.handle_notification("ON", 1_400);
        assert_eq!(actions, vec![EngineAction::RelayOn]);
        assert_eq!(engine.mode(), BridgeMode::Idle);
        assert!(engine.relay_on());
        assert_eq!(engine.counters().missed_acks, 0);
        assert_eq!(engine.counters().resyncs, 0);
    }

    #[test]
    fn silent_channel_times_out_into_bypass_without_discharge() {
        // Scenario C: relay was off, so bypass drives it straight on.
        let mut engine = engine();

        engine.handle_toggle(1_000);
        let deadline = timeout_at(&engine.config, 1_000);

        assert_eq!(engine.tick(deadline - 1), vec![]);
        let actions = engine.tick(deadline);

        assert_eq!(actions, vec![EngineAction::RelayOn]);
        assert_eq!(engine.mode(), BridgeMode::Bypass);
        assert_eq!(engine.counters().missed_acks, 1);
    }

    #[test]
    fn timeout_with_live_relay_runs_discharge_sequence() {
        // Scenario D: desired on, relay already on from remote-mediated
        // operation; the bulb PSU may have latched off.
        let mut engine = engine();
        engine.handle_toggle(0);
        engine.handle_notification("ON", 100);
        assert!(engine.relay_on());

        // Duplicate toggle pair lands us back at desired=on, awaiting ack.
        engine.handle_toggle(200);
        engine.handle_toggle(300);
        assert!(engine.desired_on());
        assert_eq!(engine.mode(), BridgeMode::AwaitingAck);

        let actions = engine.tick(timeout_at(&engine.config, 300));
        assert_eq!(
            actions,
            vec![
                EngineAction::RelayOff,
                EngineAction::Delay(engine.config.discharge_hold_ms),
                EngineAction::RelayOn,
            ]
        );
        assert_eq!(engine.mode(), BridgeMode::Bypass);
        assert!(engine.relay_on());
    }

    #[test]
    fn timeout_with_desired_off_never_discharges() {
        let mut engine = engine();
        engine.handle_toggle(0);
        engine.handle_notification("ON", 100);

        // Toggle to off; channel goes silent.
        engine.handle_toggle(200);
        assert!(!engine.desired_on());

        let actions = engine.tick(timeout_at(&engine.config, 200));
        assert_eq!(actions, vec![EngineAction::RelayOff]);
        assert_eq!(engine.mode(), BridgeMode::Bypass);
    }

    #[test]
    fn any_notification_during_bypass_resyncs_own_state() {
        // Scenario E: even garbage and even a contradicting OFF only prove
        // the channel is alive again.
        let mut engine = engine();
        engine.handle_toggle(0);
        engine.tick(timeout_at(&engine.config, 0));
        assert_eq!(engine.mode(), BridgeMode::Bypass);
        assert!(engine.desired_on());

        let actions = engine.handle_notification("OFF", 10_000);

        assert_eq!(actions, vec![EngineAction::Publish(BulbCommand::On)]);
        assert!(!engine.bypass_active());
        assert!(engine.desired_on());
        assert_eq!(engine.counters().resyncs, 1);
        assert_eq!(engine.mode(), BridgeMode::AwaitingAck);
    }

    #[test]
    fn toggle_storm_during_outage_counts_one_timeout() {
        let mut engine = engine();

        // Each toggle while awaiting re-arms the deadline; none expire yet.
        engine.handle_toggle(0);
        engine.handle_toggle(500);
        engine.handle_toggle(1_000);
        assert_eq!(engine.tick(1_100), vec![]);
        assert_eq!(engine.counters().missed_acks, 0);

        // Deadline from the last toggle expires exactly once.
        engine.tick(timeout_at(&engine.config, 1_000));
        assert_eq!(engine.counters().missed_acks, 1);
        assert_eq!(engine.mode(), BridgeMode::Bypass);
        assert_eq!(engine.relay_on(), engine.desired_on());

        // Further toggles drive the relay locally without new timers.
        engine.handle_toggle(10_000);
        engine.handle_toggle(11_000);
        engine.tick(60_000);
        assert_eq!(engine.counters().missed_acks, 1);
        assert_eq!(engine.mode(), BridgeMode::Bypass);
        assert_eq!(engine.relay_on(), engine.desired_on());
        assert_eq!(engine.counters().toggles, 5);
    }

    #[test]
    fn bypass_toggles_track_relay_exactly() {
        let mut engine = engine();
        engine.handle_toggle(0);
        engine.tick(timeout_at(&engine.config, 0));
        assert!(engine.relay_on());

        let actions = engine.handle_toggle(5_000);
        assert_eq!(
            actions,
            vec![EngineAction::ShadowOff, EngineAction::RelayOff]
        );

        let actions = engine.handle_toggle(6_000);
        assert_eq!(actions, vec![EngineAction::ShadowOn, EngineAction::RelayOn]);
        assert_eq!(engine.mode(), BridgeMode::Bypass);
    }

    #[test]
    fn unrecognized_payload_is_inert_while_awaiting_ack() {
        let mut engine = engine();
        engine.handle_toggle(1_000);

        let actions = engine.handle_notification("{\"brightness\":42}", 1_200);

        assert_eq!(actions, vec![]);
        assert_eq!(engine.mode(), BridgeMode::AwaitingAck);
        assert!(engine.desired_on());

        // The deadline armed at 1_000 still expires.
        engine.tick(timeout_at(&engine.config, 1_000));
        assert_eq!(engine.counters().missed_acks, 1);
    }

    #[test]
    fn remote_off_leaves_relay_latched() {
        let mut engine = engine();
        engine.handle_toggle(0);
        engine.handle_notification("ON", 100);
        assert!(engine.relay_on());

        // Remote actuator turns the bulb off over its own radio link; the
        // relay keeps feeding power.
        let actions = engine.handle_notification("OFF", 5_000);

        assert_eq!(actions, vec![EngineAction::ShadowOff]);
        assert!(!engine.desired_on());
        assert!(engine.relay_on());
        assert_eq!(engine.mode(), BridgeMode::Idle);
    }

    #[test]
    fn on_marker_wins_when_both_markers_present() {
        let mut engine = engine();

        engine.handle_notification("ON then OFF", 100);

        assert!(engine.desired_on());
        assert!(engine.relay_on());
    }

    #[test]
    fn duplicate_notifications_apply_at_most_one_shadow_change() {
        let mut engine = engine();

        let first = engine.handle_notification("ON", 100);
        let second = engine.handle_notification("ON", 200);

        assert_eq!(
            first,
            vec![EngineAction::ShadowOn, EngineAction::RelayOn]
        );
        assert_eq!(second, vec![]);
    }

    #[test]
    fn recovery_command_timeout_re_enters_bypass() {
        let mut engine = engine();
        engine.handle_toggle(0);
        engine.tick(timeout_at(&engine.config, 0));
        engine.handle_notification("ON", 10_000);
        assert_eq!(engine.mode(), BridgeMode::AwaitingAck);

        // The resync command also goes unacknowledged.
        engine.tick(timeout_at(&engine.config, 10_000));

        assert_eq!(engine.mode(), BridgeMode::Bypass);
        assert_eq!(engine.counters().missed_acks, 2);
        assert_eq!(engine.counters().resyncs, 1);
    }

    #[test]
    fn transport_loss_counters_do_not_touch_control_state() {
        let mut engine = engine();
        engine.handle_toggle(0);

        engine.record_network_loss();
        engine.record_channel_loss();
        engine.record_channel_loss();

        assert_eq!(engine.counters().network_lost, 1);
        assert_eq!(engine.counters().channel_lost, 2);
        assert_eq!(engine.mode(), BridgeMode::AwaitingAck);
    }

    #[test]
    fn status_reports_pending_age_and_mode() {
        let mut engine = engine();
        engine.handle_toggle(1_000);

        let status = engine.status(1_400);

        assert_eq!(status.mode, "AWAITING_ACK");
        assert_eq!(status.ack_pending_ms, Some(400));
        assert!(status.desired_on);
        assert!(!status.relay_on);
        assert_eq!(status.counters.toggles, 1);
    }
}
