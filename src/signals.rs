//! Cooldown-deduplicated alert emission.
//!
//! Every alert-worthy condition is described by a [`Signal`] with a stable
//! key. A signal is only published when its key has not been emitted
//! within its cooldown window, so conditions that persist across many
//! sweeps do not flood subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::bus::{Alert, DomainEvent, EventBus, EventKind, Severity};
use crate::core::contract::ContractId;
use crate::core::task::{RoomId, TaskId};

/// Default cooldown when a signal does not set its own.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Last-emitted timestamps per signal key.
///
/// Entries are created on first emission and refreshed on every
/// re-emission. They are never evicted; the key space is bounded by
/// rooms, tasks and conditions.
#[derive(Debug, Default)]
pub struct CooldownMap {
    last_emitted: HashMap<String, Instant>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an emission of `key` at `now` if it is outside `cooldown`.
    ///
    /// Returns `true` when the caller should emit.
    pub fn check_and_record(&mut self, key: &str, now: Instant, cooldown: Duration) -> bool {
        if let Some(last) = self.last_emitted.get(key) {
            if now.saturating_duration_since(*last) < cooldown {
                return false;
            }
        }
        self.last_emitted.insert(key.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.last_emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_emitted.is_empty()
    }
}

/// A noteworthy condition, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub key: String,
    pub severity: Severity,
    pub message: String,
    pub task_ids: Vec<TaskId>,
    pub contract_ids: Vec<ContractId>,
    pub cooldown: Duration,
}

impl Signal {
    /// Create a signal whose key is `room:condition:detail`.
    pub fn new(
        room: &RoomId,
        condition: &str,
        detail: &str,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: format!("{}:{}:{}", room, condition, detail),
            severity,
            message: message.into(),
            task_ids: Vec::new(),
            contract_ids: Vec::new(),
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_tasks(mut self, task_ids: Vec<TaskId>) -> Self {
        self.task_ids = task_ids;
        self
    }

    pub fn with_contracts(mut self, contract_ids: Vec<ContractId>) -> Self {
        self.contract_ids = contract_ids;
        self
    }

    fn into_alert(self) -> Alert {
        Alert {
            severity: self.severity,
            message: self.message,
            key: self.key,
            task_ids: self.task_ids,
            contract_ids: self.contract_ids,
        }
    }
}

/// Publishes signals as room-wide alerts, suppressing repeats.
#[derive(Debug, Clone)]
pub struct Signals {
    bus: EventBus,
    cooldowns: Arc<Mutex<CooldownMap>>,
}

impl Signals {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            cooldowns: Arc::new(Mutex::new(CooldownMap::new())),
        }
    }

    /// Emit `signal` to `room` unless its key is cooling down.
    ///
    /// Returns whether an alert was published.
    pub fn emit(&self, room: &RoomId, signal: Signal) -> bool {
        let allowed = {
            let mut map = self
                .cooldowns
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.check_and_record(&signal.key, Instant::now(), signal.cooldown)
        };
        if !allowed {
            debug!(key = %signal.key, "signal suppressed by cooldown");
            return false;
        }
        debug!(key = %signal.key, severity = %signal.severity, "signal emitted");
        self.bus
            .publish(DomainEvent::room(room, EventKind::Alert(signal.into_alert())));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_cooldown_map_suppresses_within_window() {
        let mut map = CooldownMap::new();
        let start = Instant::now();
        let cooldown = Duration::from_secs(45);

        assert!(map.check_and_record("k", start, cooldown));
        assert!(!map.check_and_record("k", start + Duration::from_secs(10), cooldown));
        assert!(map.check_and_record("k", start + Duration::from_secs(46), cooldown));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_cooldown_keys_are_independent() {
        let mut map = CooldownMap::new();
        let now = Instant::now();
        assert!(map.check_and_record("a", now, DEFAULT_COOLDOWN));
        assert!(map.check_and_record("b", now, DEFAULT_COOLDOWN));
    }

    #[test]
    fn test_signal_key_format() {
        let signal = Signal::new(&RoomId::from("r1"), "stale", "ana", Severity::Low, "stale work");
        assert_eq!(signal.key, "r1:stale:ana");
        assert_eq!(signal.cooldown, DEFAULT_COOLDOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_deduplicates_until_cooldown_elapses() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let signals = Signals::new(bus);
        let room = RoomId::from("r1");
        let signal = Signal::new(&room, "conflicts", "workspace", Severity::High, "conflicts")
            .with_cooldown(Duration::from_secs(60));

        assert!(signals.emit(&room, signal.clone()));
        assert!(!signals.emit(&room, signal.clone()));

        assert!(rx.try_recv().is_ok());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(signals.emit(&room, signal));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event.kind, EventKind::Alert(ref a) if a.key == "r1:conflicts:workspace"));
    }
}
