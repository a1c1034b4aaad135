// Rate statistics for the TDoA engine

/// Interval over which event rates are computed (ms).
const STATS_INTERVAL_MS: u32 = 500;

/// Counts events and latches an events-per-second rate once per interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateCounter {
    count: u32,
    rate: f32,
    last_reset_ms: u32,
}

impl RateCounter {
    pub fn new(now_ms: u32) -> Self {
        RateCounter {
            count: 0,
            rate: 0.0,
            last_reset_ms: now_ms,
        }
    }

    pub fn event(&mut self) {
        self.count += 1;
    }

    /// Roll the window if the interval has elapsed.
    pub fn update(&mut self, now_ms: u32) {
        let elapsed = now_ms.wrapping_sub(self.last_reset_ms);
        if elapsed >= STATS_INTERVAL_MS {
            self.rate = self.count as f32 * 1000.0 / elapsed as f32;
            self.count = 0;
            self.last_reset_ms = now_ms;
        }
    }

    /// Rate latched at the end of the previous interval (events/s).
    pub fn rate(&self) -> f32 {
        self.rate
    }
}

/// Engine statistics: rate counters for the interesting events plus scalars
/// tracked for one focus pair of anchors.
///
/// The focus ids are staged through `new_anchor_id`/`new_remote_anchor_id`
/// and applied on the next stats tick, at which point the scalars tied to
/// the previous focus are reset.
#[derive(Debug, Clone, Copy)]
pub struct TdoaStats {
    /// Range packets received from the radio.
    pub packets_received: RateCounter,
    /// Measurements handed to the estimator sink.
    pub packets_to_estimator: RateCounter,
    /// Reliable clock-correction samples for the focus anchor.
    pub clock_correction_count: RateCounter,
    /// Anchor-context lookups that found an existing record.
    pub context_hit_count: RateCounter,
    /// Anchor-context lookups that had to create a record.
    pub context_miss_count: RateCounter,
    /// Packets whose clock-correction sample was reliable.
    pub time_is_good: RateCounter,
    /// Packets for which a suitable peer anchor was found.
    pub suitable_data_found: RateCounter,

    /// Focus anchor id.
    pub anchor_id: u8,
    /// Focus remote anchor id.
    pub remote_anchor_id: u8,
    /// Staged focus anchor id, applied on the next tick.
    pub new_anchor_id: u8,
    /// Staged focus remote anchor id, applied on the next tick.
    pub new_remote_anchor_id: u8,

    /// Clock correction of the focus anchor.
    pub clock_correction: f64,
    /// Time of flight between the focus pair (anchor clock ticks).
    pub tof: u64,
    /// Distance difference of the focus pair (m).
    pub tdoa: f64,

    /// Time of the next focus-id/interval rollover.
    pub next_statistics_time: u32,
    /// Time of the previous rollover.
    pub previous_statistics_time: u32,
}

impl TdoaStats {
    pub fn new(now_ms: u32) -> Self {
        TdoaStats {
            packets_received: RateCounter::new(now_ms),
            packets_to_estimator: RateCounter::new(now_ms),
            clock_correction_count: RateCounter::new(now_ms),
            context_hit_count: RateCounter::new(now_ms),
            context_miss_count: RateCounter::new(now_ms),
            time_is_good: RateCounter::new(now_ms),
            suitable_data_found: RateCounter::new(now_ms),

            anchor_id: 0,
            remote_anchor_id: 1,
            new_anchor_id: 0,
            new_remote_anchor_id: 1,

            clock_correction: 0.0,
            tof: 0,
            tdoa: 0.0,

            next_statistics_time: now_ms + STATS_INTERVAL_MS,
            previous_statistics_time: 0,
        }
    }

    /// Periodic upkeep: apply staged focus ids and roll the rate counters.
    pub fn update(&mut self, now_ms: u32) {
        if now_ms > self.next_statistics_time {
            if self.anchor_id != self.new_anchor_id {
                self.anchor_id = self.new_anchor_id;
                self.clock_correction = 0.0;
                self.tof = 0;
                self.tdoa = 0.0;
            }
            if self.remote_anchor_id != self.new_remote_anchor_id {
                self.remote_anchor_id = self.new_remote_anchor_id;
                self.tof = 0;
                self.tdoa = 0.0;
            }

            self.previous_statistics_time = now_ms;
            self.next_statistics_time = now_ms + STATS_INTERVAL_MS;
        }

        self.packets_received.update(now_ms);
        self.packets_to_estimator.update(now_ms);
        self.clock_correction_count.update(now_ms);
        self.context_hit_count.update(now_ms);
        self.context_miss_count.update(now_ms);
        self.time_is_good.update(now_ms);
        self.suitable_data_found.update(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_counter_latches_rate_per_interval() {
        let mut counter = RateCounter::new(1000);
        for _ in 0..50 {
            counter.event();
        }
        assert_eq!(counter.rate(), 0.0);

        // 50 events over 500 ms -> 100 events/s
        counter.update(1500);
        assert_eq!(counter.rate(), 100.0);

        // No events in the next interval
        counter.update(2000);
        assert_eq!(counter.rate(), 0.0);
    }

    #[test]
    fn test_rate_counter_ignores_early_update() {
        let mut counter = RateCounter::new(1000);
        counter.event();
        counter.update(1200);
        assert_eq!(counter.rate(), 0.0);
        counter.update(1500);
        assert_eq!(counter.rate(), 2.0);
    }

    #[test]
    fn test_focus_anchor_change_resets_scalars() {
        let mut stats = TdoaStats::new(0);
        stats.clock_correction = 1.000001;
        stats.tof = 1234;
        stats.tdoa = 0.5;

        stats.new_anchor_id = 3;
        stats.update(501);

        assert_eq!(stats.anchor_id, 3);
        assert_eq!(stats.clock_correction, 0.0);
        assert_eq!(stats.tof, 0);
        assert_eq!(stats.tdoa, 0.0);
    }

    #[test]
    fn test_focus_remote_change_keeps_clock_correction() {
        let mut stats = TdoaStats::new(0);
        stats.clock_correction = 1.000001;
        stats.tof = 1234;
        stats.tdoa = 0.5;

        stats.new_remote_anchor_id = 5;
        stats.update(501);

        assert_eq!(stats.remote_anchor_id, 5);
        assert_eq!(stats.clock_correction, 1.000001);
        assert_eq!(stats.tof, 0);
        assert_eq!(stats.tdoa, 0.0);
    }

    #[test]
    fn test_staged_ids_not_applied_before_tick() {
        let mut stats = TdoaStats::new(0);
        stats.new_anchor_id = 7;
        stats.update(100);
        assert_eq!(stats.anchor_id, 0);
    }
}
