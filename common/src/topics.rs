pub const TOPIC_BULB_COMMAND: &str = "switch/bulb/command";
pub const TOPIC_BULB_STATE: &str = "switch/bulb/state";
pub const TOPIC_BULB_UPDATE: &str = "switch/bulb/update";

pub const TOPIC_SWITCH_LWT: &str = "switch/LWT";
pub const TOPIC_SWITCH_STATUS: &str = "switch/status";
pub const TOPIC_SWITCH_STATS: &str = "switch/stats";

pub const AVAILABILITY_UP: &str = "up";
pub const AVAILABILITY_DOWN: &str = "down";
