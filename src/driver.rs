// Tag driver: the boundary between the radio and the TDoA engine
//
// A single-threaded event dispatcher hooked to the radio event loop. Every
// event runs to completion; the only blocking happens inside the radio
// calls. Besides feeding the engine it paces outgoing LPP short packets
// into the silence after a reception from the destination anchor and keeps
// the per-anchor ranging-status bitmap current.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::constants::{
    ANCHOR_BASE_ADDRESS, ANCHOR_STATUS_TIMEOUT_MS, LPP_SEND_TIMEOUT, NR_OF_TDOA2_ANCHORS,
    RECEIVE_TIMEOUT_MS, UWB_TS_FREQ,
};
use crate::engine::{MatchingAlgorithm, MeasurementSink, TdoaEngine, TdoaMeasurement};
use crate::packet::{
    decode_lpp_short_anchor_pos, encode_mac_frame, LppShortPacket, MacFrame, RangePacket,
    LPP_HEADER_SHORT_PACKET, LPP_SHORT_ANCHORPOS,
};
use crate::storage::{AnchorContext, AnchorPosition};

/// Largest frame the driver reads from the radio.
pub const MAX_FRAME_LENGTH: usize = 128;

/// Events delivered by the radio event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UwbEvent {
    PacketReceived,
    PacketSent,
    ReceiveTimeout,
    ReceiveFailed,
    Timeout,
}

/// Hardware boundary towards the UWB transceiver.
pub trait Radio {
    /// Copy the received frame into `buf`; returns the frame length.
    fn read_packet(&mut self, buf: &mut [u8]) -> usize;
    /// 40-bit arrival timestamp of the received frame, tag clock.
    fn receive_timestamp(&self) -> u64;
    /// Re-arm the receiver.
    fn set_receive_mode(&mut self);
    /// Transmit a frame; the radio returns to receive mode on its own.
    fn transmit(&mut self, frame: &[u8]);
    /// Program the receive-wait timeout.
    fn set_receive_wait_timeout(&mut self, timeout_ms: u32);
}

/// Absolute-height measurement sent alongside TDoA in 2-D operation.
#[derive(Debug, Clone, Copy)]
pub struct HeightMeasurement {
    pub timestamp_ms: u32,
    pub height: f32,
    pub std_dev: f32,
}

/// The state estimator the driver feeds. Both queues are fire-and-forget;
/// overflow handling is the estimator's concern.
pub trait Estimator {
    fn enqueue_tdoa(&mut self, measurement: &TdoaMeasurement);
    fn enqueue_absolute_height(&mut self, measurement: &HeightMeasurement);
}

/// Driver options fixed at init.
#[derive(Debug, Clone)]
pub struct TagDriverConfig {
    /// MAC address of each of the 8 TDoA2 anchor slots.
    pub anchor_addresses: [u64; NR_OF_TDOA2_ANCHORS],
    pub matching_algorithm: MatchingAlgorithm,
    /// When set, every TDoA emission is accompanied by an absolute-height
    /// measurement at this height (2-D operation).
    pub fixed_height: Option<f32>,
}

impl Default for TagDriverConfig {
    fn default() -> Self {
        let mut anchor_addresses = [0u64; NR_OF_TDOA2_ANCHORS];
        for (id, address) in anchor_addresses.iter_mut().enumerate() {
            *address = ANCHOR_BASE_ADDRESS | id as u64;
        }
        TagDriverConfig {
            anchor_addresses,
            matching_algorithm: MatchingAlgorithm::Youngest,
            fixed_height: None,
        }
    }
}

/// State shared between the driver and the sink bridge handed to the engine.
struct DriverShared {
    estimator: Box<dyn Estimator>,
    /// Runtime-adjustable measurement noise, applied to every emission.
    std_dev: f32,
    fixed_height: Option<f32>,
    now_ms: u32,
    /// Distance diff per anchor, written for sequential id pairs only.
    log_dist_diff: [f32; NR_OF_TDOA2_ANCHORS],
}

/// The engine's measurement sink: overrides the standard deviation with the
/// runtime parameter, forwards to the estimator, and adds the fixed-height
/// measurement in 2-D operation.
struct EstimatorBridge {
    shared: Rc<RefCell<DriverShared>>,
}

impl MeasurementSink for EstimatorBridge {
    fn enqueue(&mut self, measurement: &TdoaMeasurement) {
        let mut shared = self.shared.borrow_mut();

        let mut measurement = measurement.clone();
        measurement.std_dev = shared.std_dev;

        let [id_a, id_b] = measurement.anchor_ids;
        if is_consecutive_ids(id_a, id_b) {
            shared.log_dist_diff[id_b as usize] = measurement.distance_diff as f32;
        }

        if let Some(height) = shared.fixed_height {
            let height_measurement = HeightMeasurement {
                timestamp_ms: shared.now_ms,
                height,
                std_dev: 0.0001,
            };
            shared.estimator.enqueue_absolute_height(&height_measurement);
        }

        shared.estimator.enqueue_tdoa(&measurement);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AnchorHistory {
    anchor_status_timeout_ms: u32,
}

fn is_consecutive_ids(previous_anchor: u8, current_anchor: u8) -> bool {
    (previous_anchor.wrapping_add(1) & 0x07) == current_anchor
}

pub struct TagDriver {
    pub engine: TdoaEngine,
    options: TagDriverConfig,

    previous_anchor: u8,
    history: [AnchorHistory; NR_OF_TDOA2_ANCHORS],
    ranging_state: u16,
    ranging_ok: bool,

    lpp_packet: Option<LppShortPacket>,
    lpp_queue: VecDeque<LppShortPacket>,
    lpp_packet_send_try_counter: u32,

    shared: Rc<RefCell<DriverShared>>,
    log_clock_correction: [f32; NR_OF_TDOA2_ANCHORS],
    log_anchor_distance: [u16; NR_OF_TDOA2_ANCHORS],
}

impl TagDriver {
    pub fn new(options: TagDriverConfig, estimator: Box<dyn Estimator>, now_ms: u32) -> Self {
        let shared = Rc::new(RefCell::new(DriverShared {
            estimator,
            std_dev: crate::engine::MEASUREMENT_NOISE_STD,
            fixed_height: options.fixed_height,
            now_ms,
            log_dist_diff: [0.0; NR_OF_TDOA2_ANCHORS],
        }));
        let sink = EstimatorBridge {
            shared: shared.clone(),
        };
        let engine = TdoaEngine::new(now_ms, Box::new(sink), UWB_TS_FREQ, options.matching_algorithm);

        TagDriver {
            engine,
            options,
            previous_anchor: 0,
            history: [AnchorHistory::default(); NR_OF_TDOA2_ANCHORS],
            ranging_state: 0,
            ranging_ok: false,
            lpp_packet: None,
            lpp_queue: VecDeque::new(),
            lpp_packet_send_try_counter: 0,
            shared,
            log_clock_correction: [0.0; NR_OF_TDOA2_ANCHORS],
            log_anchor_distance: [0; NR_OF_TDOA2_ANCHORS],
        }
    }

    /// Program the radio for reception. Call once before the event loop.
    pub fn init(&mut self, radio: &mut dyn Radio) {
        radio.set_receive_wait_timeout(RECEIVE_TIMEOUT_MS);
        radio.set_receive_mode();
    }

    /// Dispatch one radio event. All engine mutation happens here, in event
    /// order; measurements reach the estimator before this returns.
    pub fn on_event(&mut self, radio: &mut dyn Radio, event: UwbEvent, now_ms: u32) {
        self.shared.borrow_mut().now_ms = now_ms;

        match event {
            UwbEvent::PacketReceived => {
                if self.rx_callback(radio, now_ms) {
                    self.lpp_packet = None;
                } else {
                    radio.set_receive_mode();

                    // Discard the LPP packet if we cannot send it for too long
                    self.lpp_packet_send_try_counter += 1;
                    if self.lpp_packet_send_try_counter >= LPP_SEND_TIMEOUT {
                        self.drop_stalled_lpp_packet();
                    }
                }

                if self.lpp_packet.is_none() {
                    self.lpp_packet = self.lpp_queue.pop_front();
                    self.lpp_packet_send_try_counter = 0;
                }
            }
            UwbEvent::Timeout | UwbEvent::ReceiveFailed | UwbEvent::ReceiveTimeout => {
                radio.set_receive_mode();

                if self.lpp_packet.is_some() {
                    self.lpp_packet_send_try_counter += 1;
                    if self.lpp_packet_send_try_counter >= LPP_SEND_TIMEOUT {
                        self.drop_stalled_lpp_packet();
                    }
                }
            }
            UwbEvent::PacketSent => {
                // The radio is back in receive mode automatically
            }
        }

        let mut ranging_state = 0u16;
        for (anchor, history) in self.history.iter().enumerate() {
            if now_ms < history.anchor_status_timeout_ms {
                ranging_state |= 1 << anchor;
            }
        }
        self.ranging_state = ranging_state;

        self.engine.stats.update(now_ms);
    }

    /// Handle a received frame. Returns true when an LPP packet was
    /// transmitted in response (the radio is then in TX mode).
    fn rx_callback(&mut self, radio: &mut dyn Radio, now_ms: u32) -> bool {
        self.engine.stats.packets_received.event();

        let mut buf = [0u8; MAX_FRAME_LENGTH];
        let data_length = radio.read_packet(&mut buf);

        let frame = match MacFrame::decode(&buf[..data_length]) {
            Some(frame) => frame,
            None => return false,
        };
        let packet = match RangePacket::decode(frame.payload) {
            Some(packet) => packet,
            None => return false,
        };

        let anchor = (frame.source_address & 0xff) as u8;

        let mut lpp_sent = false;
        if let Some(lpp_packet) = self.lpp_packet {
            if lpp_packet.dest == anchor {
                self.send_lpp_short(radio, &lpp_packet);
                lpp_sent = true;
            }
        }

        let arrival = radio.receive_timestamp();

        if (anchor as usize) < NR_OF_TDOA2_ANCHORS {
            let rx_an_by_t_in_cl_t = arrival;
            let tx_an_in_cl_an = packet.timestamps[anchor as usize];
            let seq_nr = packet.seq_nrs[anchor as usize] & 0x7f;

            let ctx = self
                .engine
                .get_anchor_ctx_for_packet_processing(anchor, now_ms);
            self.update_remote_data(&ctx, &packet);
            self.engine
                .process_packet(&ctx, tx_an_in_cl_an, rx_an_by_t_in_cl_t);
            self.engine
                .storage
                .set_rx_tx_data(&ctx, rx_an_by_t_in_cl_t, tx_an_in_cl_an, seq_nr);

            self.log_clock_correction[anchor as usize] =
                self.engine.storage.clock_correction(&ctx) as f32;
            self.history[anchor as usize].anchor_status_timeout_ms =
                now_ms + ANCHOR_STATUS_TIMEOUT_MS;

            self.handle_lpp_packet(&frame, &ctx);

            self.previous_anchor = anchor;
            self.ranging_ok = true;
        }

        lpp_sent
    }

    /// Store the remote observations the packet carries: the reception
    /// timestamp and TOF the sender reports for each other anchor. Zero
    /// values mean nothing was received and are skipped.
    fn update_remote_data(&mut self, anchor_ctx: &AnchorContext, packet: &RangePacket) {
        let anchor_id = self.engine.storage.id(anchor_ctx);
        for i in 0..NR_OF_TDOA2_ANCHORS {
            let remote_id = i as u8;
            if anchor_id == remote_id {
                continue;
            }

            let remote_rx_time = packet.timestamps[i];
            let remote_seq_nr = packet.seq_nrs[i] & 0x7f;
            if remote_rx_time != 0 {
                self.engine
                    .storage
                    .set_remote_rx_time(anchor_ctx, remote_id, remote_rx_time, remote_seq_nr);
            }

            let tof = packet.distances[i];
            if tof != 0 {
                self.engine
                    .storage
                    .set_remote_tof(anchor_ctx, remote_id, tof as u64);

                if is_consecutive_ids(self.previous_anchor, anchor_id) {
                    self.log_anchor_distance[anchor_id as usize] =
                        packet.distances[self.previous_anchor as usize];
                }
            }
        }
    }

    /// Parse an LPP section trailing the ranging data, if present.
    fn handle_lpp_packet(&mut self, frame: &MacFrame, anchor_ctx: &AnchorContext) {
        let lpp_data = RangePacket::lpp_section(frame.payload);
        if lpp_data.len() < 2 || lpp_data[0] != LPP_HEADER_SHORT_PACKET {
            return;
        }

        let src_id = self
            .options
            .anchor_addresses
            .iter()
            .position(|&address| address == frame.source_address);

        if let Some(src_id) = src_id {
            self.handle_lpp_short_packet(src_id as u8, &lpp_data[1..], anchor_ctx);
        }
    }

    fn handle_lpp_short_packet(&mut self, src_id: u8, data: &[u8], anchor_ctx: &AnchorContext) {
        if data[0] == LPP_SHORT_ANCHORPOS && (src_id as usize) < NR_OF_TDOA2_ANCHORS {
            if let Some((x, y, z)) = decode_lpp_short_anchor_pos(&data[1..]) {
                self.engine.storage.set_anchor_position(anchor_ctx, x, y, z);
                debug!(anchor = src_id, x, y, z, "anchor position updated");
            }
        }
    }

    /// Transmit an LPP short packet; the radio goes back to receive mode by
    /// itself afterwards.
    fn send_lpp_short(&self, radio: &mut dyn Radio, packet: &LppShortPacket) {
        let dest_address = self.options.anchor_addresses[packet.dest as usize];
        let frame = encode_mac_frame(dest_address, &packet.encode_payload());
        radio.transmit(&frame);
        debug!(dest = packet.dest, "LPP short packet sent");
    }

    fn drop_stalled_lpp_packet(&mut self) {
        if let Some(packet) = self.lpp_packet.take() {
            warn!(dest = packet.dest, "dropping LPP packet, no TX opportunity");
        }
    }

    /// Queue an LPP short packet for transmission to its destination anchor.
    /// Returns false when the destination id is out of range.
    pub fn queue_lpp_packet(&mut self, packet: LppShortPacket) -> bool {
        if (packet.dest as usize) >= NR_OF_TDOA2_ANCHORS {
            return false;
        }
        self.lpp_queue.push_back(packet);
        true
    }

    /// True once at least one range packet has been fully processed.
    pub fn is_ranging_ok(&self) -> bool {
        self.ranging_ok
    }

    /// Position of an anchor, if known and fresh.
    pub fn anchor_position(&self, anchor_id: u8, now_ms: u32) -> Option<AnchorPosition> {
        let ctx = self.engine.storage.get_ctx(anchor_id, now_ms)?;
        self.engine.storage.anchor_position(&ctx)
    }

    /// Ids of all anchors in storage; fills `list`, returns the count.
    pub fn anchor_id_list(&self, list: &mut [u8]) -> usize {
        self.engine.storage.anchor_id_list(list)
    }

    /// Ids of recently heard anchors; fills `list`, returns the count.
    pub fn active_anchor_id_list(&self, list: &mut [u8], now_ms: u32) -> usize {
        self.engine.storage.active_anchor_id_list(list, now_ms)
    }

    /// Bitmap with bit `a` set while anchor `a` counts as ranging.
    pub fn ranging_state(&self) -> u16 {
        self.ranging_state
    }

    pub fn std_dev(&self) -> f32 {
        self.shared.borrow().std_dev
    }

    /// Override the measurement standard deviation at runtime.
    pub fn set_std_dev(&mut self, std_dev: f32) {
        self.shared.borrow_mut().std_dev = std_dev;
    }

    /// Clock correction per anchor as of its last packet.
    pub fn clock_correction_log(&self) -> [f32; NR_OF_TDOA2_ANCHORS] {
        self.log_clock_correction
    }

    /// Distance diff per anchor, sequential id pairs only.
    pub fn distance_diff_log(&self) -> [f32; NR_OF_TDOA2_ANCHORS] {
        self.shared.borrow().log_dist_diff
    }

    /// Inter-anchor distance per anchor, sequential id pairs only.
    pub fn anchor_distance_log(&self) -> [u16; NR_OF_TDOA2_ANCHORS] {
        self.log_anchor_distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock_correction::update_clock_correction;
    use crate::packet::encode_lpp_short_anchor_pos;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Scripted radio: hands out one prepared frame and records TX traffic.
    #[derive(Default)]
    struct ScriptedRadio {
        frame: Vec<u8>,
        rx_timestamp: u64,
        transmitted: Vec<Vec<u8>>,
        receive_mode_count: usize,
        receive_wait_timeout: Option<u32>,
    }

    impl Radio for ScriptedRadio {
        fn read_packet(&mut self, buf: &mut [u8]) -> usize {
            buf[..self.frame.len()].copy_from_slice(&self.frame);
            self.frame.len()
        }

        fn receive_timestamp(&self) -> u64 {
            self.rx_timestamp
        }

        fn set_receive_mode(&mut self) {
            self.receive_mode_count += 1;
        }

        fn transmit(&mut self, frame: &[u8]) {
            self.transmitted.push(frame.to_vec());
        }

        fn set_receive_wait_timeout(&mut self, timeout_ms: u32) {
            self.receive_wait_timeout = Some(timeout_ms);
        }
    }

    #[derive(Clone, Default)]
    struct QueueEstimator {
        tdoa: Rc<RefCell<Vec<TdoaMeasurement>>>,
        height: Rc<RefCell<Vec<HeightMeasurement>>>,
    }

    impl Estimator for QueueEstimator {
        fn enqueue_tdoa(&mut self, measurement: &TdoaMeasurement) {
            self.tdoa.borrow_mut().push(measurement.clone());
        }

        fn enqueue_absolute_height(&mut self, measurement: &HeightMeasurement) {
            self.height.borrow_mut().push(*measurement);
        }
    }

    fn driver_with_estimator(options: TagDriverConfig) -> (TagDriver, QueueEstimator) {
        let estimator = QueueEstimator::default();
        let driver = TagDriver::new(options, Box::new(estimator.clone()), 0);
        (driver, estimator)
    }

    fn empty_range_packet() -> RangePacket {
        RangePacket {
            seq_nrs: [0; NR_OF_TDOA2_ANCHORS],
            timestamps: [0; NR_OF_TDOA2_ANCHORS],
            distances: [0; NR_OF_TDOA2_ANCHORS],
        }
    }

    /// Frame from `anchor` carrying `packet` and an optional LPP section.
    fn anchor_frame(anchor: u8, packet: &RangePacket, lpp: &[u8]) -> Vec<u8> {
        let mut payload = packet.encode();
        payload.extend_from_slice(lpp);
        encode_mac_frame_from(ANCHOR_BASE_ADDRESS | anchor as u64, &payload)
    }

    /// Like encode_mac_frame but with an arbitrary source address.
    fn encode_mac_frame_from(source_address: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = encode_mac_frame(0, payload);
        buf[13..21].copy_from_slice(&source_address.to_le_bytes());
        buf
    }

    fn deliver(driver: &mut TagDriver, radio: &mut ScriptedRadio, frame: Vec<u8>, rx: u64, now: u32) {
        radio.frame = frame;
        radio.rx_timestamp = rx;
        driver.on_event(radio, UwbEvent::PacketReceived, now);
    }

    #[test]
    fn test_first_packet_populates_storage_and_latches_ranging_ok() {
        let (mut driver, estimator) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();
        driver.init(&mut radio);
        assert_eq!(radio.receive_wait_timeout, Some(RECEIVE_TIMEOUT_MS));
        assert!(!driver.is_ranging_ok());

        let mut packet = empty_range_packet();
        packet.timestamps[3] = 2000;
        packet.seq_nrs[3] = 5;
        deliver(&mut driver, &mut radio, anchor_frame(3, &packet, &[]), 1000, 100);

        let ctx = driver.engine.storage.get_ctx(3, 100).unwrap();
        assert_eq!(driver.engine.storage.rx_time(&ctx), 1000);
        assert_eq!(driver.engine.storage.tx_time(&ctx), 2000);
        assert_eq!(driver.engine.storage.seq_nr(&ctx), 5);
        assert_eq!(driver.engine.storage.clock_correction(&ctx), 0.0);
        assert!(estimator.tdoa.borrow().is_empty());

        assert!(driver.is_ranging_ok());
        assert_eq!(driver.ranging_state(), 1 << 3);
    }

    #[test]
    fn test_non_tdoa2_frame_is_ignored() {
        let (mut driver, estimator) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        let mut payload = empty_range_packet().encode();
        payload[0] = 0x21;
        let frame = encode_mac_frame_from(ANCHOR_BASE_ADDRESS | 3, &payload);
        deliver(&mut driver, &mut radio, frame, 1000, 100);

        assert!(!driver.is_ranging_ok());
        assert!(driver.engine.storage.get_ctx(3, 100).is_none());
        assert!(estimator.tdoa.borrow().is_empty());
        // Radio was re-armed
        assert_eq!(radio.receive_mode_count, 1);
    }

    #[test]
    fn test_sequence_number_high_bit_is_masked() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        let mut packet = empty_range_packet();
        packet.timestamps[2] = 2000;
        packet.seq_nrs[2] = 0x85;
        deliver(&mut driver, &mut radio, anchor_frame(2, &packet, &[]), 1000, 100);

        let ctx = driver.engine.storage.get_ctx(2, 100).unwrap();
        assert_eq!(driver.engine.storage.seq_nr(&ctx), 0x05);
    }

    #[test]
    fn test_lpp_anchor_position_is_applied() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        let mut packet = empty_range_packet();
        packet.timestamps[1] = 2000;
        let mut lpp = vec![LPP_HEADER_SHORT_PACKET];
        lpp.extend_from_slice(&encode_lpp_short_anchor_pos(1.0, 2.0, 3.0));
        deliver(&mut driver, &mut radio, anchor_frame(1, &packet, &lpp), 1000, 100);

        let position = driver.anchor_position(1, 100).unwrap();
        assert_eq!(position.coords.x, 1.0);
        assert_eq!(position.coords.y, 2.0);
        assert_eq!(position.coords.z, 3.0);
    }

    #[test]
    fn test_remote_data_ingest_skips_zero_entries() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        let mut packet = empty_range_packet();
        packet.timestamps[3] = 2000;
        packet.timestamps[4] = 111_111;
        packet.seq_nrs[4] = 0x80 | 9; // high bit must be dropped
        packet.distances[4] = 1000;
        // Slot 5 has no data at all (zeroes)
        deliver(&mut driver, &mut radio, anchor_frame(3, &packet, &[]), 1000, 100);

        let ctx = driver.engine.storage.get_ctx(3, 100).unwrap();
        assert_eq!(driver.engine.storage.remote_rx_time(&ctx, 4), Some((111_111, 9)));
        assert_eq!(driver.engine.storage.remote_tof(&ctx, 4), Some(1000));
        assert_eq!(driver.engine.storage.remote_rx_time(&ctx, 5), None);
        assert_eq!(driver.engine.storage.remote_tof(&ctx, 5), None);
    }

    /// End-to-end emission: anchor 4 announced its position, anchor 3 has a
    /// locked clock and pairs with it.
    fn run_emission_scenario(options: TagDriverConfig) -> (TagDriver, QueueEstimator) {
        let (mut driver, estimator) = driver_with_estimator(options);
        let mut radio = ScriptedRadio::default();

        // Packet from anchor 4 with its position
        let mut packet = empty_range_packet();
        packet.timestamps[4] = 400_000;
        packet.seq_nrs[4] = 9;
        let mut lpp = vec![LPP_HEADER_SHORT_PACKET];
        lpp.extend_from_slice(&encode_lpp_short_anchor_pos(1.0, 0.0, 0.0));
        deliver(&mut driver, &mut radio, anchor_frame(4, &packet, &lpp), 500_300, 100);

        // Pre-seed anchor 3 so its next packet pairs immediately
        let (ctx3, _) = driver.engine.storage.get_or_create_ctx(3, 100);
        driver.engine.storage.set_rx_tx_data(&ctx3, 500_200, 499_900, 5);
        driver.engine.storage.set_anchor_position(&ctx3, 0.0, 0.0, 0.0);
        update_clock_correction(driver.engine.storage.clock_correction_storage_mut(&ctx3), 1.0);

        // Packet from anchor 3 reporting its observation of anchor 4
        let mut packet = empty_range_packet();
        packet.timestamps[3] = 500_200;
        packet.seq_nrs[3] = 6;
        packet.timestamps[4] = 500_000;
        packet.seq_nrs[4] = 0x80 | 9;
        packet.distances[4] = 1000;
        deliver(&mut driver, &mut radio, anchor_frame(3, &packet, &[]), 500_500, 120);

        (driver, estimator)
    }

    #[test]
    fn test_emission_through_driver() {
        let (_, estimator) = run_emission_scenario(TagDriverConfig::default());

        let measurements = estimator.tdoa.borrow();
        assert_eq!(measurements.len(), 1);
        let m = &measurements[0];
        assert_eq!(m.anchor_ids, [4, 3]);
        let expected =
            crate::constants::SPEED_OF_LIGHT * ((200.0 - 1_200.0) / crate::constants::UWB_TS_FREQ);
        assert!((m.distance_diff - expected).abs() < 1e-9);
    }

    #[test]
    fn test_std_dev_parameter_overrides_emission() {
        let options = TagDriverConfig::default();
        let (mut driver, estimator) = driver_with_estimator(options);
        driver.set_std_dev(0.3);
        // Same scenario, inlined through the pre-built driver
        let mut radio = ScriptedRadio::default();
        let mut packet = empty_range_packet();
        packet.timestamps[4] = 400_000;
        packet.seq_nrs[4] = 9;
        let mut lpp = vec![LPP_HEADER_SHORT_PACKET];
        lpp.extend_from_slice(&encode_lpp_short_anchor_pos(1.0, 0.0, 0.0));
        deliver(&mut driver, &mut radio, anchor_frame(4, &packet, &lpp), 500_300, 100);

        let (ctx3, _) = driver.engine.storage.get_or_create_ctx(3, 100);
        driver.engine.storage.set_rx_tx_data(&ctx3, 500_200, 499_900, 5);
        driver.engine.storage.set_anchor_position(&ctx3, 0.0, 0.0, 0.0);
        update_clock_correction(driver.engine.storage.clock_correction_storage_mut(&ctx3), 1.0);

        let mut packet = empty_range_packet();
        packet.timestamps[3] = 500_200;
        packet.seq_nrs[3] = 6;
        packet.timestamps[4] = 500_000;
        packet.seq_nrs[4] = 9;
        packet.distances[4] = 1000;
        deliver(&mut driver, &mut radio, anchor_frame(3, &packet, &[]), 500_500, 120);

        let measurements = estimator.tdoa.borrow();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].std_dev, 0.3);
    }

    #[test]
    fn test_2d_mode_emits_height_alongside_tdoa() {
        let options = TagDriverConfig {
            fixed_height: Some(0.5),
            ..TagDriverConfig::default()
        };
        let (_, estimator) = run_emission_scenario(options);

        assert_eq!(estimator.tdoa.borrow().len(), 1);
        let heights = estimator.height.borrow();
        assert_eq!(heights.len(), 1);
        assert_eq!(heights[0].height, 0.5);
        assert_eq!(heights[0].std_dev, 0.0001);
    }

    #[test]
    fn test_lpp_packet_sent_when_destination_heard() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        let lpp_packet = LppShortPacket::new(3, &[0x01, 0x02]).unwrap();
        assert!(driver.queue_lpp_packet(lpp_packet));

        // An unrelated anchor first: nothing transmitted, packet pulled
        // from the queue into the send slot
        let mut packet = empty_range_packet();
        packet.timestamps[2] = 2000;
        deliver(&mut driver, &mut radio, anchor_frame(2, &packet, &[]), 1000, 100);
        assert!(radio.transmitted.is_empty());

        // Now the destination anchor
        let mut packet = empty_range_packet();
        packet.timestamps[3] = 2000;
        deliver(&mut driver, &mut radio, anchor_frame(3, &packet, &[]), 1000, 110);

        assert_eq!(radio.transmitted.len(), 1);
        let frame = MacFrame::decode(&radio.transmitted[0]).unwrap();
        assert_eq!(frame.dest_address, ANCHOR_BASE_ADDRESS | 3);
        assert_eq!(frame.payload, &[LPP_HEADER_SHORT_PACKET, 0x01, 0x02]);
    }

    #[test]
    fn test_stalled_lpp_packet_is_dropped() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        driver.queue_lpp_packet(LppShortPacket::new(7, &[0xaa]).unwrap());

        // Pull it into the send slot
        let mut packet = empty_range_packet();
        packet.timestamps[2] = 2000;
        deliver(&mut driver, &mut radio, anchor_frame(2, &packet, &[]), 1000, 100);

        // Starve it with receive timeouts
        for i in 0..LPP_SEND_TIMEOUT {
            driver.on_event(&mut radio, UwbEvent::ReceiveTimeout, 200 + i);
        }

        // The destination finally shows up, but the packet is gone
        let mut packet = empty_range_packet();
        packet.timestamps[7] = 2000;
        deliver(&mut driver, &mut radio, anchor_frame(7, &packet, &[]), 1000, 300);
        assert!(radio.transmitted.is_empty());
    }

    #[test]
    fn test_lpp_packet_with_invalid_destination_is_rejected() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        assert!(!driver.queue_lpp_packet(LppShortPacket::new(8, &[0x01]).unwrap()));
    }

    #[test]
    fn test_ranging_state_expires() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        let mut packet = empty_range_packet();
        packet.timestamps[3] = 2000;
        deliver(&mut driver, &mut radio, anchor_frame(3, &packet, &[]), 1000, 1000);
        assert_eq!(driver.ranging_state(), 1 << 3);

        driver.on_event(&mut radio, UwbEvent::Timeout, 1000 + ANCHOR_STATUS_TIMEOUT_MS);
        assert_eq!(driver.ranging_state(), 0);
    }

    #[test]
    fn test_anchor_distance_logged_for_sequential_pair() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        // Anchor 2 first, so anchor 3 is the sequential follower
        let mut packet = empty_range_packet();
        packet.timestamps[2] = 2000;
        deliver(&mut driver, &mut radio, anchor_frame(2, &packet, &[]), 1000, 100);

        let mut packet = empty_range_packet();
        packet.timestamps[3] = 2500;
        packet.timestamps[2] = 900;
        packet.distances[2] = 777;
        deliver(&mut driver, &mut radio, anchor_frame(3, &packet, &[]), 1100, 110);

        assert_eq!(driver.anchor_distance_log()[3], 777);
    }

    #[test]
    fn test_active_anchor_list_through_driver() {
        let (mut driver, _) = driver_with_estimator(TagDriverConfig::default());
        let mut radio = ScriptedRadio::default();

        for anchor in [1u8, 5] {
            let mut packet = empty_range_packet();
            packet.timestamps[anchor as usize] = 2000;
            deliver(&mut driver, &mut radio, anchor_frame(anchor, &packet, &[]), 1000, 100);
        }

        let mut list = [0u8; 16];
        assert_eq!(driver.anchor_id_list(&mut list), 2);
        assert_eq!(driver.active_anchor_id_list(&mut list, 150), 2);
        assert_eq!(driver.active_anchor_id_list(&mut list, 5000), 0);
    }
}
