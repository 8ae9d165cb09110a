//! Blockchain time configuration.
//!
//! The supervised chain splits wall-clock time in discrete slots of a fixed
//! duration, grouped in epochs of a fixed number of slots. Everything the
//! supervisor schedules (polling suppression, exclusion windows, epoch
//! turnover) is derived from the mapping between wall-clock instants and
//! `(epoch, slot)` coordinates defined here.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Epoch number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

/// Slot offset *in* a given epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochSlotOffset(pub u64);

/// Epoch position: this is an epoch and a slot offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochPosition {
    pub epoch: Epoch,
    pub slot: EpochSlotOffset,
}

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for EpochPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch.0, self.slot.0)
    }
}

#[derive(Debug, Error)]
pub enum EpochPositionParseError {
    #[error("expected a block date of the form '<epoch>.<slot>'")]
    Malformed,
    #[error("invalid number in block date: {0}")]
    BadNumber(#[from] std::num::ParseIntError),
}

impl FromStr for EpochPosition {
    type Err = EpochPositionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (epoch, slot) = s
            .split_once('.')
            .ok_or(EpochPositionParseError::Malformed)?;
        Ok(EpochPosition {
            epoch: Epoch(epoch.parse()?),
            slot: EpochSlotOffset(slot.parse()?),
        })
    }
}

impl Serialize for EpochPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EpochPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Time settings of the supervised blockchain: genesis instant, slot
/// duration and the constant number of slots per epoch.
///
/// Instants before the genesis time have no valid slot, in which case the
/// lookup operations return `None`.
#[derive(Debug, Clone)]
pub struct TimeSettings {
    pub genesis_time: SystemTime,
    pub slot_duration: Duration,
    pub slots_per_epoch: u64,
}

impl TimeSettings {
    /// Get the flat slot index associated with the given system time.
    pub fn slot_at(&self, at: SystemTime) -> Option<u64> {
        let elapsed = at.duration_since(self.genesis_time).ok()?;
        Some((elapsed.as_millis() / self.slot_duration.as_millis()) as u64)
    }

    /// Get the epoch and in-epoch slot offset for the given system time.
    pub fn position_at(&self, at: SystemTime) -> Option<EpochPosition> {
        let slot = self.slot_at(at)?;
        Some(EpochPosition {
            epoch: Epoch(slot / self.slots_per_epoch),
            slot: EpochSlotOffset(slot % self.slots_per_epoch),
        })
    }

    /// The instant at which the given position's slot opens.
    pub fn slot_start(&self, pos: EpochPosition) -> SystemTime {
        let flat = pos.epoch.0 * self.slots_per_epoch + pos.slot.0;
        self.genesis_time + self.slot_duration * flat as u32
    }

    /// The instant at which the given position's slot closes.
    pub fn slot_end(&self, pos: EpochPosition) -> SystemTime {
        self.slot_start(pos) + self.slot_duration
    }

    /// The instant at which the given epoch starts (slot 0 opens).
    pub fn epoch_start(&self, epoch: Epoch) -> SystemTime {
        self.slot_start(EpochPosition {
            epoch,
            slot: EpochSlotOffset(0),
        })
    }

    /// Number of slots left in the epoch of the given position, the
    /// position's own slot excluded.
    pub fn slots_until_epoch_end(&self, pos: EpochPosition) -> u64 {
        self.slots_per_epoch - pos.slot.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TimeSettings {
        TimeSettings {
            genesis_time: SystemTime::UNIX_EPOCH,
            slot_duration: Duration::from_secs(2),
            slots_per_epoch: 10,
        }
    }

    #[test]
    fn position_of_genesis_is_epoch_zero_slot_zero() {
        let settings = settings();
        assert_eq!(
            settings.position_at(settings.genesis_time),
            Some(EpochPosition {
                epoch: Epoch(0),
                slot: EpochSlotOffset(0)
            })
        );
    }

    #[test]
    fn position_before_genesis_is_none() {
        let settings = settings();
        let before = settings.genesis_time - Duration::from_secs(1);
        assert_eq!(settings.position_at(before), None);
        assert_eq!(settings.slot_at(before), None);
    }

    #[test]
    fn position_round_trips_through_slot_start() {
        let settings = settings();
        let pos = EpochPosition {
            epoch: Epoch(3),
            slot: EpochSlotOffset(7),
        };
        assert_eq!(settings.position_at(settings.slot_start(pos)), Some(pos));
        // one instant before the slot opens still belongs to the previous one
        let just_before = settings.slot_start(pos) - Duration::from_millis(1);
        assert_eq!(
            settings.position_at(just_before),
            Some(EpochPosition {
                epoch: Epoch(3),
                slot: EpochSlotOffset(6)
            })
        );
    }

    #[test]
    fn epoch_start_is_start_of_slot_zero() {
        let settings = settings();
        let epoch1 = settings.epoch_start(Epoch(1));
        assert_eq!(
            epoch1.duration_since(settings.genesis_time).unwrap(),
            Duration::from_secs(20)
        );
        assert_eq!(
            settings.position_at(epoch1),
            Some(EpochPosition {
                epoch: Epoch(1),
                slot: EpochSlotOffset(0)
            })
        );
    }

    #[test]
    fn slot_end_matches_next_slot_start() {
        let settings = settings();
        let pos = EpochPosition {
            epoch: Epoch(0),
            slot: EpochSlotOffset(9),
        };
        assert_eq!(settings.slot_end(pos), settings.epoch_start(Epoch(1)));
    }

    #[test]
    fn block_date_display_and_parse() {
        let pos = EpochPosition {
            epoch: Epoch(42),
            slot: EpochSlotOffset(17),
        };
        assert_eq!(pos.to_string(), "42.17");
        assert_eq!("42.17".parse::<EpochPosition>().unwrap(), pos);
        assert!("42".parse::<EpochPosition>().is_err());
        assert!("a.b".parse::<EpochPosition>().is_err());
    }

    #[test]
    fn slots_left_in_epoch() {
        let settings = settings();
        let pos = EpochPosition {
            epoch: Epoch(5),
            slot: EpochSlotOffset(8),
        };
        assert_eq!(settings.slots_until_epoch_end(pos), 2);
    }
}
