//! Heartbeat tuning knobs, per registered agent.

use serde::{Deserialize, Serialize};

/// `[startMinuteLocal, endMinuteLocal)` window in the agent's IANA zone,
/// with wrap-around when `end <= start` (e.g. 22:00-06:00).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHours {
    pub start_minute_local: u16,
    pub end_minute_local: u16,
    pub timezone: String,
}

impl ActiveHours {
    /// Whether `minute_of_day` (0..1440, in the zone this window is defined
    /// for) falls within the window.
    pub fn contains(&self, minute_of_day: u16) -> bool {
        let (start, end) = (self.start_minute_local, self.end_minute_local);
        if start == end {
            // Degenerate window: always active.
            return true;
        }
        if end > start {
            minute_of_day >= start && minute_of_day < end
        } else {
            // Wraps past midnight.
            minute_of_day >= start || minute_of_day < end
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Interval between heartbeats, milliseconds.
    pub every_ms: i64,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub ack_max_chars: Option<usize>,
    #[serde(default)]
    pub include_reasoning: bool,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    #[serde(default)]
    pub show_alerts: bool,
    #[serde(default)]
    pub show_ok: bool,
    #[serde(default)]
    pub use_indicator: bool,
}

impl HeartbeatConfig {
    pub fn visibility_permits_sending(&self) -> bool {
        self.show_alerts || self.show_ok || self.use_indicator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_hours_plain_window() {
        let hours = ActiveHours {
            start_minute_local: 9 * 60,
            end_minute_local: 17 * 60,
            timezone: "UTC".into(),
        };
        assert!(hours.contains(10 * 60));
        assert!(!hours.contains(8 * 60));
        assert!(!hours.contains(17 * 60));
    }

    #[test]
    fn active_hours_wraps_midnight() {
        let hours = ActiveHours {
            start_minute_local: 22 * 60,
            end_minute_local: 6 * 60,
            timezone: "UTC".into(),
        };
        assert!(hours.contains(23 * 60));
        assert!(hours.contains(1 * 60));
        assert!(!hours.contains(12 * 60));
    }
}
