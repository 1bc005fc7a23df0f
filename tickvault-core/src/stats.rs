//! Process-wide receive/send counters
//!
//! Pure side channel: counter updates never influence control flow. The
//! registry is constructed explicitly and passed by Arc rather than living
//! in a global.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::now_millis;

#[derive(Default)]
pub struct StatsRegistry {
    last_recv: AtomicI64,
    last_send: AtomicI64,
    recv_count: AtomicU64,
    send_count: AtomicU64,
    count_by_topic: DashMap<String, AtomicU64>,
}

/// Point-in-time copy of the counters, for the stats endpoint and logs
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub last_recv: i64,
    pub last_send: i64,
    pub recv_count: u64,
    pub send_count: u64,
    pub count_by_topic: BTreeMap<String, u64>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_on_recv(&self, topic: &str) {
        self.last_recv.store(now_millis(), Ordering::Relaxed);
        self.recv_count.fetch_add(1, Ordering::Relaxed);
        self.count_by_topic
            .entry(topic.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_on_send(&self) {
        self.last_send.store(now_millis(), Ordering::Relaxed);
        self.send_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let count_by_topic = self
            .count_by_topic
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        StatsSnapshot {
            last_recv: self.last_recv.load(Ordering::Relaxed),
            last_send: self.last_send.load(Ordering::Relaxed),
            recv_count: self.recv_count.load(Ordering::Relaxed),
            send_count: self.send_count.load(Ordering::Relaxed),
            count_by_topic,
        }
    }
}
