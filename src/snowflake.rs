use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    thread::sleep,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;

/// Custom epoch (2025-01-01T00:00:00Z) expressed in milliseconds.
const EPOCH_MILLIS: u64 = 1_735_689_600_000;
const NODE_ID_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;

/// Time-ordered unique identifier: 41 bits of milliseconds since the custom
/// epoch, 10 bits of node id, 12 bits of per-millisecond sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnowflakeId(u64);

impl SnowflakeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn node_id(&self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & MAX_NODE_ID as u64) as u16
    }
}

impl fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnowflakeId({})", self.0)
    }
}

impl FromStr for SnowflakeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>().map(SnowflakeId)
    }
}

#[derive(Debug)]
struct Generator {
    node_id: u16,
    last_timestamp: u64,
    sequence: u16,
}

impl Generator {
    fn next_id(&mut self) -> SnowflakeId {
        loop {
            let mut timestamp = current_millis();
            if timestamp < self.last_timestamp {
                // Clock went backwards; wait it out rather than risk duplicates.
                let wait = self.last_timestamp - timestamp;
                sleep(Duration::from_millis(wait));
                continue;
            }

            if timestamp == self.last_timestamp {
                self.sequence = (self.sequence + 1) & MAX_SEQUENCE;
                if self.sequence == 0 {
                    timestamp = wait_next_millis(self.last_timestamp);
                }
            } else {
                self.sequence = 0;
            }

            self.last_timestamp = timestamp;
            let elapsed = timestamp - EPOCH_MILLIS;
            let id = (elapsed << (NODE_ID_BITS + SEQUENCE_BITS))
                | ((self.node_id as u64) << SEQUENCE_BITS)
                | self.sequence as u64;
            return SnowflakeId(id);
        }
    }
}

/// Shared, thread-safe id factory for events and node identity.
///
/// One generator per store instance; embedders that mint events outside the
/// store can clone the handle freely.
#[derive(Debug, Clone)]
pub struct EventIdGenerator {
    node_id: u16,
    inner: Arc<Mutex<Generator>>,
}

impl EventIdGenerator {
    pub fn new(node_id: u16) -> Self {
        let node_id = node_id & MAX_NODE_ID;
        Self {
            node_id,
            inner: Arc::new(Mutex::new(Generator {
                node_id,
                last_timestamp: 0,
                sequence: 0,
            })),
        }
    }

    /// Derives a node id from the current process, for embedders that do not
    /// care which node id they get.
    pub fn for_process() -> Self {
        Self::new((std::process::id() & MAX_NODE_ID as u32) as u16)
    }

    pub fn next_id(&self) -> SnowflakeId {
        self.inner.lock().next_id()
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Stable textual node identity used for `Event::node_id` and snapshot
    /// attribution.
    pub fn node_name(&self) -> String {
        format!("eventcore-{:04}", self.node_id)
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(EPOCH_MILLIS)
}

fn wait_next_millis(last_timestamp: u64) -> u64 {
    loop {
        let timestamp = current_millis();
        if timestamp > last_timestamp {
            return timestamp;
        }
        sleep(Duration::from_micros(100));
    }
}
