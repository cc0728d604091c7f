//! Connection health metrics
//!
//! Pure functions that summarize how stable the broker connection has been.

use std::time::{Duration, Instant};

/// Health metrics for the connection pair
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current connection pair became ready
    pub uptime: Option<Duration>,
    /// Number of reconnect sequences that ended in a connection
    pub reconnect_count: u32,
    /// Both connections currently open
    pub connected: bool,
    /// A reconnect sequence is running
    pub reconnecting: bool,
    pub is_healthy: bool,
}

/// Connection quality assessment
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionQuality {
    /// Stable connection for over an hour, no reconnects
    Excellent,
    Good,
    /// Some reconnections, but working
    Fair,
    /// Frequent reconnections
    Poor,
    /// Disconnected or reconnecting
    Critical,
}

impl HealthMetrics {
    pub fn calculate(
        connected_since: Option<Instant>,
        reconnect_count: u32,
        connected: bool,
        reconnecting: bool,
    ) -> Self {
        let uptime = connected_since
            .filter(|_| connected)
            .map(|since| since.elapsed());

        Self {
            uptime,
            reconnect_count,
            connected,
            reconnecting,
            is_healthy: connected && !reconnecting,
        }
    }

    pub fn quality(&self) -> ConnectionQuality {
        if !self.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (self.reconnect_count, self.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, _) => ConnectionQuality::Good,
            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(uptime_secs: u64, reconnect_count: u32) -> HealthMetrics {
        HealthMetrics {
            uptime: Some(Duration::from_secs(uptime_secs)),
            reconnect_count,
            connected: true,
            reconnecting: false,
            is_healthy: true,
        }
    }

    #[test]
    fn test_calculate_disconnected() {
        let metrics = HealthMetrics::calculate(Some(Instant::now()), 3, false, true);
        assert_eq!(metrics.uptime, None);
        assert!(!metrics.is_healthy);
        assert_eq!(metrics.quality(), ConnectionQuality::Critical);
    }

    #[test]
    fn test_calculate_connected() {
        let since = Instant::now() - Duration::from_secs(10);
        let metrics = HealthMetrics::calculate(Some(since), 0, true, false);
        assert!(metrics.uptime.unwrap() >= Duration::from_secs(10));
        assert!(metrics.is_healthy);
    }

    #[test]
    fn test_quality_levels() {
        assert_eq!(metrics(7200, 0).quality(), ConnectionQuality::Excellent);
        assert_eq!(metrics(60, 0).quality(), ConnectionQuality::Good);
        assert_eq!(metrics(3600, 2).quality(), ConnectionQuality::Good);
        assert_eq!(metrics(60, 2).quality(), ConnectionQuality::Fair);
        assert_eq!(metrics(60, 5).quality(), ConnectionQuality::Fair);
        assert_eq!(metrics(60, 8).quality(), ConnectionQuality::Poor);
        assert_eq!(metrics(60, 50).quality(), ConnectionQuality::Critical);
    }
}
