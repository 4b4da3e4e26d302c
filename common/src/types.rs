use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeMode {
    Idle,
    AwaitingAck,
    Bypass,
}

impl BridgeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::AwaitingAck => "AWAITING_ACK",
            Self::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BulbCommand {
    On,
    Off,
}

impl BulbCommand {
    pub fn from_on(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

/// Diagnostic counters. Advisory only; nothing in the control logic reads
/// them back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    #[serde(rename = "networkLost")]
    pub network_lost: u32,
    #[serde(rename = "channelLost")]
    pub channel_lost: u32,
    pub resyncs: u32,
    #[serde(rename = "missedAcks")]
    pub missed_acks: u32,
    pub toggles: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchStatus {
    #[serde(rename = "desiredOn")]
    pub desired_on: bool,
    #[serde(rename = "relayOn")]
    pub relay_on: bool,
    pub mode: &'static str,
    #[serde(rename = "ackPendingMs")]
    pub ack_pending_ms: Option<u64>,
    pub counters: Counters,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsPayload {
    #[serde(flatten)]
    pub counters: Counters,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}
