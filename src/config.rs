use std::time::Duration;

use crate::wire::protocol::WireFormat;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent rooms
    pub max_rooms: usize,
    /// Maximum sessions per room
    pub max_sessions_per_room: usize,
    /// Sync ticks per second
    pub tick_rate: u32,
    /// Steady-state wire encoding negotiated for every room
    pub wire_format: WireFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_rooms: 100,
            max_sessions_per_room: 64,
            tick_rate: 30,
            wire_format: WireFormat::Binary,
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(max_rooms) = std::env::var("MAX_ROOMS") {
            if let Ok(parsed) = max_rooms.parse::<usize>() {
                if parsed > 0 && parsed <= 10000 {
                    config.max_rooms = parsed;
                } else {
                    tracing::warn!("MAX_ROOMS must be 1-10000, using default");
                }
            } else {
                tracing::warn!("Invalid MAX_ROOMS '{}', using default", max_rooms);
            }
        }

        if let Ok(max_sessions) = std::env::var("MAX_SESSIONS_PER_ROOM") {
            if let Ok(parsed) = max_sessions.parse::<usize>() {
                if parsed > 0 && parsed <= 4096 {
                    config.max_sessions_per_room = parsed;
                } else {
                    tracing::warn!("MAX_SESSIONS_PER_ROOM must be 1-4096, using default");
                }
            } else {
                tracing::warn!(
                    "Invalid MAX_SESSIONS_PER_ROOM '{}', using default",
                    max_sessions
                );
            }
        }

        if let Ok(tick_rate) = std::env::var("TICK_RATE") {
            if let Ok(parsed) = tick_rate.parse::<u32>() {
                if parsed > 0 && parsed <= 240 {
                    config.tick_rate = parsed;
                } else {
                    tracing::warn!("TICK_RATE must be 1-240, using default");
                }
            } else {
                tracing::warn!("Invalid TICK_RATE '{}', using default", tick_rate);
            }
        }

        if let Ok(format) = std::env::var("WIRE_FORMAT") {
            if let Some(parsed) = WireFormat::parse(&format) {
                config.wire_format = parsed;
            } else {
                tracing::warn!("Invalid WIRE_FORMAT '{}', using default", format);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.max_rooms == 0 {
            return Err("max_rooms must be at least 1".to_string());
        }
        if self.max_sessions_per_room == 0 {
            return Err("max_sessions_per_room must be at least 1".to_string());
        }
        if self.tick_rate == 0 || self.tick_rate > 240 {
            return Err("tick_rate must be 1-240".to_string());
        }
        Ok(())
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_rooms, 100);
        assert_eq!(config.max_sessions_per_room, 64);
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.wire_format, WireFormat::Binary);
        config.validate().unwrap();
    }

    #[test]
    fn test_tick_duration() {
        let mut config = ServerConfig::default();
        config.tick_rate = 20;
        assert_eq!(config.tick_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_zero_tick_rate() {
        let config = ServerConfig {
            tick_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
