// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure levels for write-behind queues.
//!
//! A queue's pressure is its number of distinct pending keys divided by its
//! configured `queue_max_depth`. The level is reported to observability so
//! operators can see a store outage filling the queue before the overflow
//! policy kicks in.
//!
//! # Example
//!
//! ```
//! use cache_sync::BackpressureLevel;
//!
//! let level = BackpressureLevel::from_pressure(0.5);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(!level.at_capacity());
//!
//! let level = BackpressureLevel::from_pressure(0.85);
//! assert_eq!(level, BackpressureLevel::Throttle);
//!
//! // Full queue: new keys block or evict, per the overflow policy
//! let level = BackpressureLevel::from_pressure(1.0);
//! assert_eq!(level, BackpressureLevel::Critical);
//! assert!(level.at_capacity());
//! ```

/// Backpressure level based on queue fill ratio.
///
/// - **Normal** (< 70%): Store keeping up
/// - **Warn** (70-80%): Store falling behind, emit warnings
/// - **Throttle** (80-100%): Close to the overflow policy
/// - **Critical** (>= 100%): Queue full; new keys block or evict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Warn = 1,
    Throttle = 2,
    Critical = 3,
}

impl BackpressureLevel {
    /// Calculate backpressure level from pressure ratio (0.0 → 1.0)
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 0.80 => Self::Warn,
            p if p < 1.0 => Self::Throttle,
            _ => Self::Critical,
        }
    }

    /// Level for `depth` entries out of `max_depth`.
    #[must_use]
    pub fn from_depth(depth: usize, max_depth: usize) -> Self {
        if max_depth == 0 {
            return Self::Critical;
        }
        Self::from_pressure(depth as f64 / max_depth as f64)
    }

    /// Queue cannot take a new key without blocking or evicting.
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        matches!(self, Self::Critical)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - store falling behind",
            Self::Throttle => "Throttling - queue nearly full",
            Self::Critical => "Critical - queue full, overflow policy active",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
