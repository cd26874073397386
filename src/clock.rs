//! Hybrid logical timestamps
//!
//! A `TimeAuthority` issues timestamps for one replica. Each timestamp is a
//! fixed-width string so that plain string comparison gives the total order:
//!
//! ```text
//! VVVV:WWWWWWWWWWWWWWW:CCCCCC:node
//!  |         |            |     └ replica node id (tiebreaker)
//!  |         |            └ per-tick counter
//!  |         └ wall clock millis
//!  └ schema version epoch
//! ```
//!
//! The version prefix comes first, so anything stamped under a newer schema
//! sorts after everything stamped under an older one, whatever the wall clocks
//! of the two replicas say.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Schema version epoch carried in every timestamp.
pub type SchemaVersion = u32;

const VERSION_WIDTH: usize = 4;
const WALL_WIDTH: usize = 15;
const COUNTER_WIDTH: usize = 6;
const MAX_VERSION: SchemaVersion = 9_999;
const MAX_COUNTER: u64 = 999_999;

/// An opaque, lexicographically ordered logical timestamp.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

/// The numeric parts of a timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimestampParts {
    pub version: SchemaVersion,
    pub wall: u64,
    pub counter: u64,
    pub node: String,
}

impl Timestamp {
    /// Wrap an already-encoded timestamp string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Timestamp(raw.into())
    }

    fn encode(version: SchemaVersion, wall: u64, counter: u64, node: &str) -> Self {
        Timestamp(format!(
            "{:0vw$}:{:0ww$}:{:0cw$}:{}",
            version,
            wall,
            counter,
            node,
            vw = VERSION_WIDTH,
            ww = WALL_WIDTH,
            cw = COUNTER_WIDTH,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the numeric components. Returns `None` for strings that were not
    /// produced by a `TimeAuthority`.
    pub fn parts(&self) -> Option<TimestampParts> {
        let mut fields = self.0.splitn(4, ':');
        let version = fields.next()?.parse().ok()?;
        let wall = fields.next()?.parse().ok()?;
        let counter = fields.next()?.parse().ok()?;
        let node = fields.next()?.to_string();
        Some(TimestampParts {
            version,
            wall,
            counter,
            node,
        })
    }

    /// Schema version this timestamp was issued under (0 if unparseable).
    pub fn version(&self) -> SchemaVersion {
        self.parts().map(|p| p.version).unwrap_or(0)
    }

    /// The replica node that issued this timestamp.
    pub fn node(&self) -> Option<String> {
        self.parts().map(|p| p.node)
    }

    /// Wall and counter components without the version prefix. Timestamps
    /// from one authority increase in tick order even when the version passed
    /// to `now` goes down, so the server orders its own stamps by tick.
    pub fn tick(&self) -> (u64, u64) {
        self.parts().map(|p| (p.wall, p.counter)).unwrap_or((0, 0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of wall-clock milliseconds.
pub type WallClock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_wall_clock() -> WallClock {
    Arc::new(|| chrono::Utc::now().timestamp_millis().max(0) as u64)
}

#[derive(Debug, Default)]
struct ClockState {
    wall: u64,
    counter: u64,
}

/// Issues strictly increasing timestamps for one replica.
///
/// Interior state sits behind a mutex so a single authority can be shared
/// (`Arc<TimeAuthority>`) between the local store and the sync driver.
pub struct TimeAuthority {
    node: String,
    wall_clock: WallClock,
    state: Mutex<ClockState>,
}

impl TimeAuthority {
    /// Create an authority for `node` backed by the system clock.
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_wall_clock(node, system_wall_clock())
    }

    /// Create an authority with an injected wall clock.
    pub fn with_wall_clock(node: impl Into<String>, wall_clock: WallClock) -> Self {
        Self {
            node: node.into(),
            wall_clock,
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Restore an authority after a restart so it never issues anything at or
    /// below `last` (typically the stored last-synced timestamp).
    pub fn seeded(node: impl Into<String>, last: &Timestamp) -> Self {
        let authority = Self::new(node);
        authority.update(last);
        authority
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Produce a timestamp greater than every timestamp produced or observed
    /// so far within `version`'s epoch.
    ///
    /// The version is only a prefix: observing a timestamp from a newer
    /// schema advances the clock but does not move this replica into that
    /// epoch.
    pub fn now(&self, version: SchemaVersion) -> Timestamp {
        let wall_now = (self.wall_clock)();
        let mut state = self.lock();

        if wall_now > state.wall {
            state.wall = wall_now;
            state.counter = 0;
        } else if state.counter >= MAX_COUNTER {
            // carry into the wall component
            state.wall += 1;
            state.counter = 0;
        } else {
            state.counter += 1;
        }

        Timestamp::encode(version.min(MAX_VERSION), state.wall, state.counter, &self.node)
    }

    /// Record a timestamp seen from another replica so later `now()` calls
    /// sort after it.
    pub fn update(&self, observed: &Timestamp) {
        let Some(parts) = observed.parts() else {
            log::warn!("Ignoring malformed timestamp {}", observed);
            return;
        };
        let mut state = self.lock();
        if (parts.wall, parts.counter) >= (state.wall, state.counter) {
            state.wall = parts.wall;
            state.counter = parts.counter;
        }
    }

    /// The minimal timestamp of `version`. Sorts before every timestamp a
    /// replica issues under that version.
    pub fn zero(version: SchemaVersion) -> Timestamp {
        Timestamp::encode(version.min(MAX_VERSION), 0, 0, "")
    }

    /// Total order over timestamps.
    pub fn compare(a: &Timestamp, b: &Timestamp) -> std::cmp::Ordering {
        a.cmp(b)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        // ClockState is plain data; a poisoned lock still holds a usable value
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for TimeAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeAuthority")
            .field("node", &self.node)
            .field("state", &*self.lock())
            .finish()
    }
}
