// TDoA engine
//
// The tag moves through a large mesh of anchors of which 5-20 are visible at
// a time, with arbitrary ids, random TX times, collisions and packet loss.
// For every received range packet the engine updates the sending anchor's
// clock correction, picks a reference anchor seen earlier, computes the time
// difference of arrival between the pair and hands the resulting distance
// difference to the estimator sink.

use nalgebra::Point3;
use tracing::debug;

use crate::clock_correction::{calculate_clock_correction, update_clock_correction};
use crate::constants::{truncate_to_anchor_ts, ANCHOR_TS_MASK, SPEED_OF_LIGHT};
use crate::stats::TdoaStats;
use crate::storage::{AnchorContext, AnchorStorage, REMOTE_ANCHOR_DATA_COUNT};

/// Standard deviation of the measurement noise reported to the estimator (m).
pub const MEASUREMENT_NOISE_STD: f32 = 0.15;

/// How the reference anchor is picked among the current anchor's neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingAlgorithm {
    /// First usable candidate, starting from a rotating offset so the pairs
    /// vary between packets.
    Random,
    /// The candidate with the most recent storage update.
    Youngest,
}

/// One TDoA measurement for the estimator: the tag is `distance_diff` metres
/// further from `anchor_ids[1]` than from `anchor_ids[0]`.
#[derive(Debug, Clone)]
pub struct TdoaMeasurement {
    pub anchor_ids: [u8; 2],
    pub anchor_positions: [Point3<f32>; 2],
    pub distance_diff: f64,
    pub std_dev: f32,
}

/// Capability to hand measurements to the estimator, injected at engine init.
pub trait MeasurementSink {
    fn enqueue(&mut self, measurement: &TdoaMeasurement);
}

/// Scratch space for the matching algorithms.
struct MatchingScratch {
    ids: [u8; REMOTE_ANCHOR_DATA_COUNT],
    seq_nrs: [u8; REMOTE_ANCHOR_DATA_COUNT],
    offset: u8,
}

pub struct TdoaEngine {
    pub storage: AnchorStorage,
    pub stats: TdoaStats,
    sink: Box<dyn MeasurementSink>,
    /// Tag timestamp counter frequency (Hz), for tick-to-metre conversion.
    ts_freq: f64,
    matching_algorithm: MatchingAlgorithm,
    matching: MatchingScratch,
}

impl TdoaEngine {
    pub fn new(
        now_ms: u32,
        sink: Box<dyn MeasurementSink>,
        ts_freq: f64,
        matching_algorithm: MatchingAlgorithm,
    ) -> Self {
        TdoaEngine {
            storage: AnchorStorage::new(),
            stats: TdoaStats::new(now_ms),
            sink,
            ts_freq,
            matching_algorithm,
            matching: MatchingScratch {
                ids: [0; REMOTE_ANCHOR_DATA_COUNT],
                seq_nrs: [0; REMOTE_ANCHOR_DATA_COUNT],
                offset: 0,
            },
        }
    }

    /// Look up (or create) the record for the anchor a packet came from.
    pub fn get_anchor_ctx_for_packet_processing(
        &mut self,
        anchor_id: u8,
        now_ms: u32,
    ) -> AnchorContext {
        let (ctx, found) = self.storage.get_or_create_ctx(anchor_id, now_ms);
        if found {
            self.stats.context_hit_count.event();
        } else {
            self.stats.context_miss_count.event();
        }
        ctx
    }

    /// Process one range packet from the anchor behind `anchor_ctx`.
    /// `tx_an_in_cl_an` is the TX time in the anchor's clock,
    /// `rx_an_by_t_in_cl_t` the arrival time in the tag's clock.
    pub fn process_packet(
        &mut self,
        anchor_ctx: &AnchorContext,
        tx_an_in_cl_an: u64,
        rx_an_by_t_in_cl_t: u64,
    ) {
        self.process_packet_filtered(anchor_ctx, tx_an_in_cl_an, rx_an_by_t_in_cl_t, None);
    }

    /// As [`process_packet`](Self::process_packet) but never picks
    /// `excluded_id` as the reference anchor. Returns true when the packet's
    /// clock-correction sample was reliable.
    pub fn process_packet_filtered(
        &mut self,
        anchor_ctx: &AnchorContext,
        tx_an_in_cl_an: u64,
        rx_an_by_t_in_cl_t: u64,
        excluded_id: Option<u8>,
    ) -> bool {
        let time_is_good =
            self.update_anchor_clock_correction(anchor_ctx, tx_an_in_cl_an, rx_an_by_t_in_cl_t);
        if time_is_good {
            self.stats.time_is_good.event();

            if let Some(other_ctx) = self.find_suitable_anchor(anchor_ctx, excluded_id) {
                self.stats.suitable_data_found.event();
                if let Some(distance_diff) = self.calc_distance_diff(
                    &other_ctx,
                    anchor_ctx,
                    tx_an_in_cl_an,
                    rx_an_by_t_in_cl_t,
                ) {
                    self.enqueue_tdoa(&other_ctx, anchor_ctx, distance_diff);
                }
            }
        }
        time_is_good
    }

    /// Update the anchor's clock correction from the new packet pair.
    /// Returns true when the sample was reliable.
    fn update_anchor_clock_correction(
        &mut self,
        anchor_ctx: &AnchorContext,
        tx_an_in_cl_an: u64,
        rx_an_by_t_in_cl_t: u64,
    ) -> bool {
        let latest_rx_an_by_t_in_cl_t = self.storage.rx_time(anchor_ctx);
        let latest_tx_an_in_cl_an = self.storage.tx_time(anchor_ctx);

        // No previous packet from this anchor yet
        if latest_rx_an_by_t_in_cl_t == 0 || latest_tx_an_in_cl_an == 0 {
            return false;
        }

        let candidate = match calculate_clock_correction(
            rx_an_by_t_in_cl_t,
            latest_rx_an_by_t_in_cl_t,
            tx_an_in_cl_an,
            latest_tx_an_in_cl_an,
            ANCHOR_TS_MASK,
        ) {
            Some(candidate) => candidate,
            // Retransmission or identical TX timestamp, no ratio to extract
            None => return false,
        };

        let sample_is_reliable =
            update_clock_correction(self.storage.clock_correction_storage_mut(anchor_ctx), candidate);

        if sample_is_reliable && self.storage.id(anchor_ctx) == self.stats.anchor_id {
            self.stats.clock_correction = self.storage.clock_correction(anchor_ctx);
            self.stats.clock_correction_count.event();
        }

        sample_is_reliable
    }

    /// Pick a reference anchor for the current packet, or `None` when no
    /// candidate qualifies (a normal condition early after discovery).
    fn find_suitable_anchor(
        &mut self,
        anchor_ctx: &AnchorContext,
        excluded_id: Option<u8>,
    ) -> Option<AnchorContext> {
        if self.storage.clock_correction(anchor_ctx) <= 0.0 {
            return None;
        }

        match self.matching_algorithm {
            MatchingAlgorithm::Random => self.match_random_anchor(anchor_ctx, excluded_id),
            MatchingAlgorithm::Youngest => self.match_youngest_anchor(anchor_ctx, excluded_id),
        }
    }

    /// A candidate qualifies when the sequence number the current anchor
    /// reported for it matches the candidate's own latest sequence number
    /// (the reported reception is of the candidate's latest packet) and a
    /// valid TOF between the pair is known.
    fn match_random_anchor(
        &mut self,
        anchor_ctx: &AnchorContext,
        excluded_id: Option<u8>,
    ) -> Option<AnchorContext> {
        // The rotating offset varies the starting point in the candidate
        // list between calls, and with it the anchor pairs produced.
        self.matching.offset = self.matching.offset.wrapping_add(1);
        let remote_count = self.storage.remote_seq_nr_list(
            anchor_ctx,
            &mut self.matching.ids,
            &mut self.matching.seq_nrs,
        );
        if remote_count == 0 {
            return None;
        }

        let offset = self.matching.offset as usize;
        for i in offset..offset + remote_count {
            let index = i % remote_count;
            let candidate_id = self.matching.ids[index];
            if excluded_id == Some(candidate_id) {
                continue;
            }
            let (other_ctx, found) = self
                .storage
                .get_or_create_ctx(candidate_id, anchor_ctx.now_ms);
            if found
                && self.matching.seq_nrs[index] == self.storage.seq_nr(&other_ctx)
                && self.storage.remote_tof(anchor_ctx, candidate_id).is_some()
            {
                return Some(other_ctx);
            }
        }

        None
    }

    /// Among the qualifying candidates, pick the one whose record was
    /// updated most recently.
    fn match_youngest_anchor(
        &mut self,
        anchor_ctx: &AnchorContext,
        excluded_id: Option<u8>,
    ) -> Option<AnchorContext> {
        let remote_count = self.storage.remote_seq_nr_list(
            anchor_ctx,
            &mut self.matching.ids,
            &mut self.matching.seq_nrs,
        );

        let mut youngest_update_time = 0u32;
        let mut best_id = None;

        for index in 0..remote_count {
            let candidate_id = self.matching.ids[index];
            if excluded_id == Some(candidate_id) {
                continue;
            }
            if self.storage.remote_tof(anchor_ctx, candidate_id).is_none() {
                continue;
            }
            let (other_ctx, found) = self
                .storage
                .get_or_create_ctx(candidate_id, anchor_ctx.now_ms);
            if found {
                let update_time = self.storage.last_update_time(&other_ctx);
                if update_time > youngest_update_time
                    && self.matching.seq_nrs[index] == self.storage.seq_nr(&other_ctx)
                {
                    youngest_update_time = update_time;
                    best_id = Some(candidate_id);
                }
            }
        }

        best_id.map(|id| self.storage.get_or_create_ctx(id, anchor_ctx.now_ms).0)
    }

    /// The TDoA between the reference anchor Ar and the current anchor An,
    /// in tag clock ticks.
    ///
    /// The tag-observed arrival gap of the two packets, minus the gap
    /// between their transmissions. The TX gap is only known in the anchor's
    /// clock (TOF from Ar to An plus the time An waited after receiving Ar's
    /// packet) and is re-expressed in tag ticks through the clock correction.
    fn calc_tdoa(
        &self,
        other_anchor_ctx: &AnchorContext,
        anchor_ctx: &AnchorContext,
        tx_an_in_cl_an: u64,
        rx_an_by_t_in_cl_t: u64,
    ) -> Option<f64> {
        let other_anchor_id = self.storage.id(other_anchor_ctx);

        let tof_ar_to_an_in_cl_an = self.storage.remote_tof(anchor_ctx, other_anchor_id)?;
        let (rx_ar_by_an_in_cl_an, _) = self.storage.remote_rx_time(anchor_ctx, other_anchor_id)?;
        let clock_correction = self.storage.clock_correction(anchor_ctx);

        let rx_ar_by_t_in_cl_t = self.storage.rx_time(other_anchor_ctx);

        let delta_tx_ar_to_tx_an_in_cl_an = tof_ar_to_an_in_cl_an
            + truncate_to_anchor_ts(tx_an_in_cl_an.wrapping_sub(rx_ar_by_an_in_cl_an));

        let time_diff_of_arrival_in_cl_t =
            truncate_to_anchor_ts(rx_an_by_t_in_cl_t.wrapping_sub(rx_ar_by_t_in_cl_t)) as f64
                - delta_tx_ar_to_tx_an_in_cl_an as f64 * clock_correction;

        Some(time_diff_of_arrival_in_cl_t)
    }

    fn calc_distance_diff(
        &self,
        other_anchor_ctx: &AnchorContext,
        anchor_ctx: &AnchorContext,
        tx_an_in_cl_an: u64,
        rx_an_by_t_in_cl_t: u64,
    ) -> Option<f64> {
        let tdoa = self.calc_tdoa(other_anchor_ctx, anchor_ctx, tx_an_in_cl_an, rx_an_by_t_in_cl_t)?;
        Some(SPEED_OF_LIGHT * tdoa / self.ts_freq)
    }

    /// Emit a measurement for the pair, provided both positions are fresh.
    fn enqueue_tdoa(
        &mut self,
        other_anchor_ctx: &AnchorContext,
        anchor_ctx: &AnchorContext,
        distance_diff: f64,
    ) {
        let position_a = self.storage.anchor_position(other_anchor_ctx);
        let position_b = self.storage.anchor_position(anchor_ctx);

        let (position_a, position_b) = match (position_a, position_b) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                debug!(
                    anchor = self.storage.id(anchor_ctx),
                    other_anchor = self.storage.id(other_anchor_ctx),
                    "dropping TDoA, anchor position unknown or stale"
                );
                return;
            }
        };

        self.stats.packets_to_estimator.event();

        let id_a = self.storage.id(other_anchor_ctx);
        let id_b = self.storage.id(anchor_ctx);
        if id_a == self.stats.anchor_id && id_b == self.stats.remote_anchor_id {
            self.stats.tdoa = distance_diff;
        }
        if id_b == self.stats.anchor_id && id_a == self.stats.remote_anchor_id {
            self.stats.tdoa = -distance_diff;
        }

        let measurement = TdoaMeasurement {
            anchor_ids: [id_a, id_b],
            anchor_positions: [position_a.coords, position_b.coords],
            distance_diff,
            std_dev: MEASUREMENT_NOISE_STD,
        };

        self.sink.enqueue(&measurement);
    }
}
