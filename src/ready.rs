//! RDY accounting for a reader.
//!
//! The coordinator owns the in-flight budget, every connection's ready count
//! and all backoff tiers. It is driven from a single task and never touches
//! the network itself: each call returns the RDY updates the caller must send.

use crate::backoff::{Backoff, BackoffPhase, BackoffPolicy};
use crate::message::Completion;
use rand::Rng;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RdyUpdate {
    pub(crate) conn: u64,
    pub(crate) count: u64,
}

#[derive(Debug)]
struct Slot {
    max_rdy: u64,
    ready: u64,
    in_flight: u64,
    delivered_since_ready: u64,
    draining: bool,
    backoff: Backoff,
}

impl Slot {
    fn below_low_water(&self, mark: f64) -> bool {
        let remaining = self.ready.saturating_sub(self.delivered_since_ready);
        remaining <= (self.ready as f64 * mark).ceil() as u64
    }
}

#[derive(Debug)]
pub(crate) struct ReadyCoordinator {
    max_in_flight: u64,
    low_water_mark: f64,
    redistribute_interval: Duration,
    policy: BackoffPolicy,
    global: Backoff,
    slots: BTreeMap<u64, Slot>,
    paused: bool,
    rotation: usize,
    next_rotation: Option<Instant>,
    trial_cursor: usize,
}

impl ReadyCoordinator {
    pub(crate) fn new(
        max_in_flight: u64,
        low_water_mark: f64,
        redistribute_interval: Duration,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            max_in_flight,
            low_water_mark,
            redistribute_interval,
            policy,
            global: Backoff::new(policy),
            slots: BTreeMap::new(),
            paused: false,
            rotation: 0,
            next_rotation: None,
            trial_cursor: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    #[cfg(test)]
    pub(crate) fn ready(&self, conn: u64) -> Option<u64> {
        self.slots.get(&conn).map(|slot| slot.ready)
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self, conn: u64) -> Option<u64> {
        self.slots.get(&conn).map(|slot| slot.in_flight)
    }

    #[cfg(test)]
    pub(crate) fn global_tier(&self) -> u32 {
        self.global.tier()
    }

    #[cfg(test)]
    pub(crate) fn connection_tier(&self, conn: u64) -> Option<u32> {
        self.slots.get(&conn).map(|slot| slot.backoff.tier())
    }

    /// True once a draining connection has no messages left in flight.
    pub(crate) fn is_drained(&self, conn: u64) -> bool {
        self.slots
            .get(&conn)
            .is_some_and(|slot| slot.draining && slot.in_flight == 0)
    }

    pub(crate) fn add_connection(&mut self, conn: u64, max_rdy: u64, now: Instant) -> Vec<RdyUpdate> {
        self.slots.insert(
            conn,
            Slot {
                max_rdy,
                ready: 0,
                in_flight: 0,
                delivered_since_ready: 0,
                draining: false,
                backoff: Backoff::new(self.policy),
            },
        );
        self.rebalance(now, None)
    }

    pub(crate) fn remove_connection(&mut self, conn: u64, now: Instant) -> Vec<RdyUpdate> {
        if self.slots.remove(&conn).is_none() {
            return Vec::new();
        }
        self.rebalance(now, None)
    }

    /// Stops granting to `conn`. The caller has already sent it `RDY 0`.
    pub(crate) fn drain(&mut self, conn: u64, now: Instant) -> Vec<RdyUpdate> {
        match self.slots.get_mut(&conn) {
            Some(slot) => {
                slot.draining = true;
                slot.ready = 0;
            }
            None => return Vec::new(),
        }
        self.rebalance(now, None)
    }

    pub(crate) fn message_delivered(&mut self, conn: u64) {
        if let Some(slot) = self.slots.get_mut(&conn) {
            slot.in_flight += 1;
            slot.delivered_since_ready += 1;
        }
    }

    pub(crate) fn message_completed(
        &mut self,
        conn: u64,
        completion: Completion,
        now: Instant,
    ) -> Vec<RdyUpdate> {
        if let Some(slot) = self.slots.get_mut(&conn) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }

        let r: f64 = rand::rng().random();
        match completion {
            Completion::Finished => self.record_success(conn, now, r),
            Completion::Requeued { backoff: true } => self.record_failure(conn, now, r),
            Completion::Requeued { backoff: false } | Completion::TimedOut => {}
        }
        self.rebalance(now, Some(conn))
    }

    pub(crate) fn pause(&mut self, now: Instant) -> Vec<RdyUpdate> {
        self.paused = true;
        self.rebalance(now, None)
    }

    pub(crate) fn unpause(&mut self, now: Instant) -> Vec<RdyUpdate> {
        self.paused = false;
        self.rebalance(now, None)
    }

    /// Re-evaluates targets after waits expire or the rotation moves on.
    pub(crate) fn tick(&mut self, now: Instant) -> Vec<RdyUpdate> {
        self.rebalance(now, None)
    }

    /// Next instant at which `tick` may change a target.
    pub(crate) fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| !slot.draining)
            .filter_map(|slot| slot.backoff.deadline(now))
            .chain(self.global.deadline(now))
            .chain(self.next_rotation)
            .min()
    }

    fn record_failure(&mut self, conn: u64, now: Instant, r: f64) {
        if let Some(slot) = self.slots.get_mut(&conn) {
            if slot.backoff.failure_with(now, r) {
                tracing::debug!(conn, tier = slot.backoff.tier(), "connection backoff increased");
            }
        }
        if self.global.failure_with(now, r) {
            self.trial_cursor = self.trial_cursor.wrapping_add(1);
            tracing::warn!(
                tier = self.global.tier(),
                wait_ms = self.global.deadline(now).map(|until| (until - now).as_millis() as u64),
                "backing off"
            );
        } else if let Some(until) = self.global.deadline(now) {
            tracing::warn!(
                tier = self.global.tier(),
                wait_ms = (until - now).as_millis() as u64,
                "backoff at maximum tier"
            );
        }
    }

    fn record_success(&mut self, conn: u64, now: Instant, r: f64) {
        if let Some(slot) = self.slots.get_mut(&conn) {
            if slot.backoff.success_with(now, r) {
                tracing::debug!(conn, tier = slot.backoff.tier(), "connection backoff decreased");
            }
        }
        if self.global.success_with(now, r) {
            self.trial_cursor = self.trial_cursor.wrapping_add(1);
            if self.global.tier() == 0 {
                tracing::info!("backoff complete, resuming normal flow");
            } else {
                tracing::info!(tier = self.global.tier(), "backoff decreased");
            }
        }
    }

    fn rebalance(&mut self, now: Instant, refill: Option<u64>) -> Vec<RdyUpdate> {
        self.advance_rotation(now);
        let targets = self.targets(now);

        let mut updates = Vec::new();
        for (conn, target) in targets {
            let Some(slot) = self.slots.get_mut(&conn) else {
                continue;
            };
            let refill_due = refill == Some(conn)
                && target > 0
                && slot.below_low_water(self.low_water_mark);
            if target != slot.ready || refill_due {
                slot.ready = target;
                slot.delivered_since_ready = 0;
                updates.push(RdyUpdate {
                    conn,
                    count: target,
                });
            }
        }
        // shrink before growing so the daemons never see more than the budget
        updates.sort_by_key(|update| update.count);
        updates
    }

    /// Connections that may receive grants, in id order.
    fn active(&self) -> impl Iterator<Item = (&u64, &Slot)> {
        self.slots.iter().filter(|(_, slot)| !slot.draining)
    }

    fn healthy_count(&self, now: Instant) -> usize {
        self.active()
            .filter(|(_, slot)| slot.backoff.phase(now) == BackoffPhase::Normal)
            .count()
    }

    fn advance_rotation(&mut self, now: Instant) {
        let starving = !self.paused
            && self.global.phase(now) == BackoffPhase::Normal
            && self.healthy_count(now) as u64 > self.max_in_flight;
        if !starving {
            self.next_rotation = None;
            return;
        }
        match self.next_rotation {
            Some(at) if now >= at => {
                self.rotation = self.rotation.wrapping_add(1);
                self.next_rotation = Some(now + self.redistribute_interval);
            }
            Some(_) => {}
            None => self.next_rotation = Some(now + self.redistribute_interval),
        }
    }

    fn targets(&self, now: Instant) -> BTreeMap<u64, u64> {
        let mut targets: BTreeMap<u64, u64> = self.active().map(|(conn, _)| (*conn, 0)).collect();
        if self.paused || targets.is_empty() {
            return targets;
        }

        match self.global.phase(now) {
            BackoffPhase::Waiting(_) => return targets,
            BackoffPhase::Probing => {
                let candidates: Vec<u64> = self
                    .active()
                    .filter(|(_, slot)| !slot.backoff.is_waiting(now) && slot.max_rdy > 0)
                    .map(|(conn, _)| *conn)
                    .collect();
                if !candidates.is_empty() {
                    let pick = candidates[self.trial_cursor % candidates.len()];
                    targets.insert(pick, 1);
                }
                return self.fit_budget(targets);
            }
            BackoffPhase::Normal => {}
        }

        let mut remaining = self.max_in_flight;
        let mut healthy = Vec::new();
        for (conn, slot) in self.active() {
            match slot.backoff.phase(now) {
                BackoffPhase::Waiting(_) => {}
                BackoffPhase::Probing => {
                    if remaining > 0 && slot.max_rdy > 0 {
                        targets.insert(*conn, 1);
                        remaining -= 1;
                    }
                }
                BackoffPhase::Normal => healthy.push((*conn, slot.max_rdy)),
            }
        }

        if !healthy.is_empty() {
            let count = healthy.len() as u64;
            let share = remaining / count;
            let extra = (remaining % count) as usize;
            let offset = self.rotation % healthy.len();
            for (position, (conn, max_rdy)) in healthy.iter().enumerate() {
                let rank = (position + healthy.len() - offset) % healthy.len();
                let grant = share + u64::from(rank < extra);
                targets.insert(*conn, grant.min(*max_rdy));
            }
        }

        self.fit_budget(targets)
    }

    /// Lowers grants until Σ max(in_flight, ready) fits the budget.
    fn fit_budget(&self, mut targets: BTreeMap<u64, u64>) -> BTreeMap<u64, u64> {
        let committed: u64 = self
            .slots
            .iter()
            .map(|(conn, slot)| {
                let target = targets.get(conn).copied().unwrap_or(0);
                slot.in_flight.max(target)
            })
            .sum();
        let mut excess = committed.saturating_sub(self.max_in_flight);

        for (conn, target) in targets.iter_mut().rev() {
            if excess == 0 {
                break;
            }
            let in_flight = self.slots.get(conn).map_or(0, |slot| slot.in_flight);
            let cut = target.saturating_sub(in_flight).min(excess);
            *target -= cut;
            excess -= cut;
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn coordinator(max_in_flight: u64) -> ReadyCoordinator {
        ReadyCoordinator::new(
            max_in_flight,
            0.25,
            Duration::from_secs(5),
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(128), 0.3, 1),
        )
    }

    fn ready_of(coordinator: &ReadyCoordinator, conn: u64) -> u64 {
        coordinator.ready(conn).unwrap()
    }

    #[test]
    fn test_even_split_across_two_connections() {
        let mut c = coordinator(10);
        let now = Instant::now();

        let first = c.add_connection(1, 2500, now);
        assert_eq!(first, vec![RdyUpdate { conn: 1, count: 10 }]);

        let second = c.add_connection(2, 2500, now);
        assert_eq!(second[0], RdyUpdate { conn: 1, count: 5 });
        assert_eq!(second[1], RdyUpdate { conn: 2, count: 5 });
        assert_eq!(ready_of(&c, 1), 5);
        assert_eq!(ready_of(&c, 2), 5);
    }

    #[test]
    fn test_remaining_connection_gets_full_budget_after_close() {
        let mut c = coordinator(10);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        c.add_connection(2, 2500, now);

        let updates = c.remove_connection(2, now);
        assert_eq!(updates, vec![RdyUpdate { conn: 1, count: 10 }]);
    }

    #[test]
    fn test_remainder_goes_to_first_connections() {
        let mut c = coordinator(10);
        let now = Instant::now();
        for conn in 1..=3 {
            c.add_connection(conn, 2500, now);
        }
        assert_eq!(ready_of(&c, 1), 4);
        assert_eq!(ready_of(&c, 2), 3);
        assert_eq!(ready_of(&c, 3), 3);
    }

    #[test]
    fn test_grant_capped_by_max_rdy_count() {
        let mut c = coordinator(100);
        c.add_connection(1, 20, Instant::now());
        assert_eq!(ready_of(&c, 1), 20);
    }

    #[test]
    fn test_pause_and_unpause_round_trip() {
        let mut c = coordinator(10);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        c.add_connection(2, 2500, now);

        let paused = c.pause(now);
        assert!(c.is_paused());
        assert_eq!(paused.len(), 2);
        assert!(paused.iter().all(|update| update.count == 0));

        let resumed = c.unpause(now);
        assert!(!c.is_paused());
        assert_eq!(
            resumed,
            vec![RdyUpdate { conn: 1, count: 5 }, RdyUpdate { conn: 2, count: 5 }]
        );
    }

    #[test]
    fn test_new_connection_while_paused_gets_nothing() {
        let mut c = coordinator(10);
        let now = Instant::now();
        c.pause(now);
        assert!(c.add_connection(1, 2500, now).is_empty());
        assert_eq!(ready_of(&c, 1), 0);
    }

    #[test]
    fn test_low_water_refill() {
        let mut c = coordinator(8);
        let now = Instant::now();
        c.add_connection(1, 2500, now);

        for _ in 0..5 {
            c.message_delivered(1);
        }
        // 3 of 8 left, above ceil(8 * 0.25) = 2
        assert!(c.message_completed(1, Completion::Finished, now).is_empty());

        c.message_delivered(1);
        let updates = c.message_completed(1, Completion::Finished, now);
        assert_eq!(updates, vec![RdyUpdate { conn: 1, count: 8 }]);
    }

    #[test]
    fn test_backoff_trial_recovery() {
        let mut c = coordinator(10);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        c.message_delivered(1);

        let updates = c.message_completed(1, Completion::Requeued { backoff: true }, now);
        assert_eq!(updates, vec![RdyUpdate { conn: 1, count: 0 }]);
        assert_eq!(c.global_tier(), 1);
        assert_eq!(c.connection_tier(1), Some(1));

        let deadline = c.next_deadline(now).unwrap();
        let wait = deadline - now;
        assert!(wait >= Duration::from_millis(699) && wait <= Duration::from_millis(1300));

        let after = now + Duration::from_secs(2);
        assert_eq!(c.tick(after), vec![RdyUpdate { conn: 1, count: 1 }]);

        c.message_delivered(1);
        let restored = c.message_completed(1, Completion::Finished, after);
        assert_eq!(restored, vec![RdyUpdate { conn: 1, count: 10 }]);
        assert_eq!(c.global_tier(), 0);
        assert_eq!(c.connection_tier(1), Some(0));
    }

    #[test]
    fn test_global_trial_goes_to_one_connection() {
        let mut c = coordinator(10);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        c.add_connection(2, 2500, now);
        c.message_delivered(1);
        c.message_completed(1, Completion::Requeued { backoff: true }, now);

        // a new connection during backoff starts at zero
        assert!(c.add_connection(3, 2500, now).is_empty());

        let after = now + Duration::from_secs(2);
        let trials = c.tick(after);
        let total: u64 = [1, 2, 3].iter().map(|conn| ready_of(&c, *conn)).sum();
        assert_eq!(total, 1);
        assert_eq!(trials.iter().filter(|update| update.count == 1).count(), 1);
    }

    #[test]
    fn test_requeue_without_backoff_keeps_flow() {
        let mut c = coordinator(4);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        c.message_delivered(1);
        c.message_completed(1, Completion::Requeued { backoff: false }, now);
        c.message_delivered(1);
        c.message_completed(1, Completion::TimedOut, now);

        assert_eq!(c.global_tier(), 0);
        assert_eq!(ready_of(&c, 1), 4);
    }

    #[test]
    fn test_drain_redistributes_and_tracks_in_flight() {
        let mut c = coordinator(10);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        c.add_connection(2, 2500, now);
        for _ in 0..3 {
            c.message_delivered(2);
        }

        let updates = c.drain(2, now);
        // connection 2 still holds 3 messages, so 1 may only take 7
        assert_eq!(updates, vec![RdyUpdate { conn: 1, count: 7 }]);
        assert!(!c.is_drained(2));

        for _ in 0..3 {
            c.message_completed(2, Completion::Finished, now);
        }
        assert!(c.is_drained(2));
        assert_eq!(ready_of(&c, 1), 10);
        assert_eq!(ready_of(&c, 2), 0);
    }

    #[test]
    fn test_grants_respect_outstanding_in_flight() {
        let mut c = coordinator(10);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        for _ in 0..8 {
            c.message_delivered(1);
        }

        c.add_connection(2, 2500, now);
        assert_eq!(ready_of(&c, 1), 5);
        assert_eq!(ready_of(&c, 2), 2);
    }

    #[test]
    fn test_rotation_when_budget_below_connection_count() {
        let mut c = coordinator(1);
        let now = Instant::now();
        c.add_connection(1, 2500, now);
        c.add_connection(2, 2500, now);
        c.add_connection(3, 2500, now);
        assert_eq!(ready_of(&c, 1), 1);
        assert_eq!(ready_of(&c, 2), 0);

        let rotate_at = c.next_deadline(now).unwrap();
        assert_eq!(rotate_at, now + Duration::from_secs(5));

        c.tick(rotate_at);
        assert_eq!(ready_of(&c, 1), 0);
        assert_eq!(ready_of(&c, 2), 1);

        c.tick(rotate_at + Duration::from_secs(5));
        assert_eq!(ready_of(&c, 2), 0);
        assert_eq!(ready_of(&c, 3), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u64),
        Remove(usize),
        Drain(usize),
        Deliver(usize),
        Complete(usize, u8),
        Pause,
        Unpause,
        Advance(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..50).prop_map(Op::Add),
            any::<usize>().prop_map(Op::Remove),
            any::<usize>().prop_map(Op::Drain),
            any::<usize>().prop_map(Op::Deliver),
            (any::<usize>(), 0u8..4).prop_map(|(i, kind)| Op::Complete(i, kind)),
            Just(Op::Pause),
            Just(Op::Unpause),
            (0u64..10_000).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn prop_in_flight_budget_holds(
            max_in_flight in 1u64..40,
            ops in proptest::collection::vec(op(), 1..150),
        ) {
            let mut c = coordinator(max_in_flight);
            let mut now = Instant::now();
            let mut next_id = 0u64;
            let mut ids: Vec<u64> = Vec::new();

            for op in ops {
                let pick = |i: usize| (!ids.is_empty()).then(|| ids[i % ids.len()]);
                match op {
                    Op::Add(max_rdy) => {
                        next_id += 1;
                        ids.push(next_id);
                        c.add_connection(next_id, max_rdy, now);
                    }
                    Op::Remove(i) => {
                        if let Some(conn) = pick(i) {
                            ids.retain(|id| *id != conn);
                            c.remove_connection(conn, now);
                        }
                    }
                    Op::Drain(i) => {
                        if let Some(conn) = pick(i) {
                            c.drain(conn, now);
                        }
                    }
                    Op::Deliver(i) => {
                        // the daemon only sends while in_flight < RDY
                        if let Some(conn) = pick(i) {
                            if c.in_flight(conn).unwrap() < c.ready(conn).unwrap() {
                                c.message_delivered(conn);
                            }
                        }
                    }
                    Op::Complete(i, kind) => {
                        if let Some(conn) = pick(i) {
                            if c.in_flight(conn).unwrap() > 0 {
                                let completion = match kind {
                                    0 => Completion::Finished,
                                    1 => Completion::Requeued { backoff: true },
                                    2 => Completion::Requeued { backoff: false },
                                    _ => Completion::TimedOut,
                                };
                                c.message_completed(conn, completion, now);
                            }
                        }
                    }
                    Op::Pause => { c.pause(now); }
                    Op::Unpause => { c.unpause(now); }
                    Op::Advance(ms) => {
                        now += Duration::from_millis(ms);
                        c.tick(now);
                    }
                }

                let mut ready_sum = 0;
                let mut committed = 0;
                for conn in &ids {
                    let ready = c.ready(*conn).unwrap();
                    let in_flight = c.in_flight(*conn).unwrap();
                    ready_sum += ready;
                    committed += ready.max(in_flight);
                    if c.is_paused() {
                        prop_assert_eq!(ready, 0);
                    }
                }
                prop_assert!(ready_sum <= max_in_flight);
                prop_assert!(committed <= max_in_flight);
            }
        }
    }
}
