// src/core/subscription/rebalance.rs

//! Weighted redistribution of one shard's subscriptions, plus the per-shard
//! scheduler that debounces rebalance requests.

use super::ServerWeights;
use super::storage::StorageInner;
use crate::core::types::ServerId;
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

/// Computes per-server target counts: the floor quota plus a weighted
/// random distribution of the remainder, drawn without replacement over the
/// fractional parts.
pub(crate) fn calculate_need_counts(
    weights: &ServerWeights,
    total: usize,
) -> HashMap<ServerId, usize> {
    let sum_weights: u64 = weights.values().sum();
    let mut needs = HashMap::new();
    if sum_weights == 0 {
        return needs;
    }

    // Deterministic order so the remainder draw is reproducible per seed.
    let mut entries: Vec<(ServerId, u64)> = weights.iter().map(|(s, w)| (*s, *w)).collect();
    entries.sort_by_key(|(server, _)| *server);

    let total_u64 = total as u64;
    let mut rem = total;
    let mut rem_sum_weights: u64 = 0;
    for (server, weight) in entries.iter_mut() {
        let need = (total_u64 * *weight / sum_weights) as usize;
        needs.insert(*server, need);
        // The fractional part becomes this server's weight in the
        // remainder draw.
        *weight = total_u64 * *weight % sum_weights;
        rem_sum_weights += *weight;
        debug_assert!(rem >= need, "floor quotas cannot exceed the total");
        rem -= need;
    }
    debug_assert!(rem <= entries.len(), "remainder exceeds server count");

    let mut rng = rand::thread_rng();
    while rem > 0 {
        if rem_sum_weights == 0 {
            // All fractional parts are zero but slots remain; spread them
            // over servers that did not win a remainder slot yet.
            for (server, weight) in entries.iter_mut() {
                if *weight == u64::MAX {
                    continue;
                }
                *needs.get_mut(server).expect("inserted above") += 1;
                *weight = u64::MAX;
                rem -= 1;
                if rem == 0 {
                    break;
                }
            }
            break;
        }
        let mut draw = rng.gen_range(0..rem_sum_weights);
        for (server, weight) in entries.iter_mut() {
            if *weight == u64::MAX || *weight == 0 {
                continue;
            }
            if draw < *weight {
                *needs.get_mut(server).expect("inserted above") += 1;
                rem_sum_weights -= *weight;
                // Without replacement: this server cannot win again.
                *weight = u64::MAX;
                break;
            }
            draw -= *weight;
        }
        rem -= 1;
    }

    needs
}

/// Performs the rebalance of one shard: gathers movable subscriptions,
/// computes quotas and moves only the surplus to servers in deficit.
pub(crate) fn rebalance_shard(inner: &Arc<StorageInner>, shard_idx: usize, weights: ServerWeights) {
    let sum_weights: u64 = weights.values().sum();
    if sum_weights == 0 {
        return;
    }
    if !inner.has_subscriptions() {
        return;
    }
    info!(shard_idx, "starting subscription rebalance");
    for (server, weight) in &weights {
        debug!(shard_idx, server = %server, weight, "rebalance weight");
    }

    let gathered = inner.gather_rebalanceable(shard_idx);
    let total = gathered.len();
    if total == 0 {
        return;
    }

    // Group by current server.
    let mut by_server: HashMap<ServerId, Vec<_>> = HashMap::new();
    for item in gathered {
        by_server.entry(item.3).or_default().push(item);
    }

    let needs = calculate_need_counts(&weights, total);
    if needs.is_empty() {
        return;
    }

    let mut counts: HashMap<ServerId, usize> = needs.keys().map(|s| (*s, 0)).collect();
    for (server, subs) in &by_server {
        counts.insert(*server, subs.len());
    }

    // Receivers in a stable order; the cursor never revisits a server that
    // reached its quota.
    let receivers: Vec<(ServerId, usize)> = {
        let mut v: Vec<_> = needs.iter().map(|(s, n)| (*s, *n)).collect();
        v.sort_by_key(|(server, _)| *server);
        v
    };
    let mut cursor = 0usize;

    let donors: Vec<ServerId> = by_server.keys().copied().collect();
    let mut rng = rand::thread_rng();
    for donor in donors {
        let need = needs.get(&donor).copied().unwrap_or(0);
        let surplus = {
            let subs = by_server.get_mut(&donor).expect("donor key exists");
            if subs.len() <= need {
                continue;
            }
            subs.shuffle(&mut rng);
            subs.split_off(need)
        };

        for (channel_name, fsm, control, current) in surplus {
            // Advance to the next receiver with remaining capacity.
            while cursor < receivers.len() {
                let (server, target) = receivers[cursor];
                if counts.get(&server).copied().unwrap_or(0) < target {
                    break;
                }
                cursor += 1;
            }
            let Some(&(new_server, _)) = receivers.get(cursor) else {
                warn!(shard_idx, "no rebalance receiver with remaining capacity");
                return;
            };

            info!(
                channel = %channel_name.name,
                from = %current,
                to = %new_server,
                shard_idx,
                "moving subscription"
            );
            *counts.entry(donor).or_default() -= 1;
            *counts.entry(new_server).or_default() += 1;
            inner.send_rebalance_event(&fsm, &channel_name, &control, new_server);
        }
    }
}

/// Debounces rebalance requests for one shard: at most one rebalance per
/// `min_interval`, always acting on the most recent weights.
pub(crate) struct RebalanceScheduler {
    weights: Mutex<Option<ServerWeights>>,
    notify: Notify,
    min_interval: Mutex<Duration>,
    stopped_tx: watch::Sender<bool>,
}

impl RebalanceScheduler {
    pub fn spawn(
        storage: Weak<StorageInner>,
        shard_idx: usize,
        min_interval: Duration,
    ) -> Arc<Self> {
        let (stopped_tx, _) = watch::channel(false);
        let scheduler = Arc::new(Self {
            weights: Mutex::new(None),
            notify: Notify::new(),
            min_interval: Mutex::new(min_interval),
            stopped_tx,
        });

        let task_scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut stopped = task_scheduler.stopped_tx.subscribe();
            loop {
                tokio::select! {
                    _ = task_scheduler.notify.notified() => {}
                    _ = stopped.changed() => return,
                }
                loop {
                    let Some(weights) = task_scheduler.weights.lock().take() else {
                        break;
                    };
                    let Some(storage) = storage.upgrade() else {
                        return;
                    };
                    storage.do_rebalance(shard_idx, weights);
                    drop(storage);

                    // Refuse further rebalances on this shard for the
                    // debounce window; fresh requests accumulate meanwhile.
                    let interval = *task_scheduler.min_interval.lock();
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = stopped.changed() => return,
                    }
                }
            }
        });

        scheduler
    }

    pub fn request(&self, weights: ServerWeights) {
        *self.weights.lock() = Some(weights);
        self.notify.notify_one();
    }

    pub fn set_min_interval(&self, interval: Duration) {
        *self.min_interval.lock() = interval;
    }

    pub fn stop(&self) {
        self.stopped_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(raw: i64) -> ServerId {
        ServerId::from_raw(raw)
    }

    #[test]
    fn quotas_are_floor_or_floor_plus_one() {
        let weights: ServerWeights = (0..5).map(|i| (server(i), 1)).collect();
        for total in [0usize, 1, 4, 5, 17, 100] {
            let needs = calculate_need_counts(&weights, total);
            let floor = total / 5;
            let mut sum = 0;
            for need in needs.values() {
                assert!(*need == floor || *need == floor + 1, "need {need} for total {total}");
                sum += need;
            }
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn weighted_quotas_respect_proportions() {
        let weights: ServerWeights = [(server(0), 3), (server(1), 1)].into_iter().collect();
        let needs = calculate_need_counts(&weights, 8);
        assert_eq!(needs[&server(0)], 6);
        assert_eq!(needs[&server(1)], 2);
    }

    #[test]
    fn zero_weights_produce_no_quotas() {
        let weights: ServerWeights = [(server(0), 0), (server(1), 0)].into_iter().collect();
        assert!(calculate_need_counts(&weights, 10).is_empty());
    }

    #[test]
    fn remainder_never_doubles_up() {
        // 7 subscriptions over 5 equal servers: two servers get 2, three
        // get 1, regardless of which ones win the draw.
        let weights: ServerWeights = (0..5).map(|i| (server(i), 1)).collect();
        for _ in 0..50 {
            let needs = calculate_need_counts(&weights, 7);
            let mut twos = 0;
            for need in needs.values() {
                match need {
                    1 => {}
                    2 => twos += 1,
                    other => panic!("unexpected quota {other}"),
                }
            }
            assert_eq!(twos, 2);
        }
    }
}
