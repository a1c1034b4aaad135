// Simulated UWB anchor mesh
//
// A scripted stand-in for the physical radio: eight anchors with
// free-running clocks transmit TDoA2 range packets in id order, and the tag
// observes them with configurable clock offset, jitter and packet loss.
// Used by the demo binary and the end-to-end tests.

use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::constants::{
    truncate_to_anchor_ts, ANCHOR_BASE_ADDRESS, NR_OF_TDOA2_ANCHORS, SPEED_OF_LIGHT, UWB_TS_FREQ,
};
use crate::driver::{Radio, UwbEvent};
use crate::packet::{encode_lpp_short_anchor_pos, RangePacket, LPP_HEADER_SHORT_PACKET};

/// Anchor positions, loadable from a JSON file (`{"anchors": [[x,y,z], ...]}`).
#[derive(Debug, Clone, Deserialize)]
pub struct AnchorLayout {
    pub anchors: Vec<[f32; 3]>,
}

impl Default for AnchorLayout {
    /// A 6 x 6 m room with anchors in two planes of four.
    fn default() -> Self {
        AnchorLayout {
            anchors: vec![
                [0.0, 0.0, 0.2],
                [6.0, 0.0, 0.2],
                [6.0, 6.0, 0.2],
                [0.0, 6.0, 0.2],
                [0.0, 0.0, 2.8],
                [6.0, 0.0, 2.8],
                [6.0, 6.0, 2.8],
                [0.0, 6.0, 2.8],
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub tag_position: Point3<f32>,
    /// Interval between consecutive anchor transmissions (s).
    pub slot_interval_s: f64,
    /// Every how many rounds each anchor appends its position as LPP.
    pub position_period_rounds: u32,
    /// Standard deviation of the tag arrival-timestamp jitter (ticks).
    pub rx_jitter_std_ticks: f64,
    /// Probability that the tag misses a transmission entirely.
    pub packet_loss: f64,
    /// Maximum anchor clock offset from nominal (parts per one).
    pub max_clock_offset_ppm: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            tag_position: Point3::new(2.0, 3.0, 1.0),
            slot_interval_s: 2.5e-3,
            position_period_rounds: 8,
            rx_jitter_std_ticks: 1.0,
            packet_loss: 0.0,
            max_clock_offset_ppm: 5e-6,
        }
    }
}

/// One simulated free-running 40-bit clock.
#[derive(Debug, Clone, Copy)]
struct SimClock {
    /// Relative frequency offset from nominal (parts per one).
    drift: f64,
    /// Counter value at simulation time zero.
    offset: u64,
}

impl SimClock {
    fn ticks_at(&self, t: f64) -> u64 {
        let ticks = (t * UWB_TS_FREQ * (1.0 + self.drift)).round() as u64;
        truncate_to_anchor_ts(ticks.wrapping_add(self.offset))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LastTransmission {
    /// Simulation time of the transmission, or None before the first one.
    time: Option<f64>,
    seq_nr: u8,
}

/// The mesh, the tag's radio front end, and the simulation clock in one.
///
/// `advance()` steps to the next anchor transmission and returns the radio
/// event the driver should be fed; the [`Radio`] impl then serves the
/// corresponding frame and arrival timestamp.
pub struct SimulatedMesh {
    positions: Vec<Point3<f32>>,
    tag_position: Point3<f32>,
    config: SimConfig,

    anchor_clocks: Vec<SimClock>,
    tag_clock: SimClock,
    last_tx: Vec<LastTransmission>,

    time_s: f64,
    slot: usize,
    round: u32,

    current_frame: Vec<u8>,
    current_arrival: u64,
    /// Frames the driver transmitted (LPP towards anchors).
    pub transmitted: Vec<Vec<u8>>,

    rng: StdRng,
}

impl SimulatedMesh {
    pub fn new(config: SimConfig, layout: &AnchorLayout, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let positions: Vec<Point3<f32>> = layout
            .anchors
            .iter()
            .take(NR_OF_TDOA2_ANCHORS)
            .map(|p| Point3::new(p[0], p[1], p[2]))
            .collect();

        let anchor_clocks = (0..positions.len())
            .map(|_| SimClock {
                drift: rng.gen_range(-config.max_clock_offset_ppm..config.max_clock_offset_ppm),
                offset: rng.gen_range(0..=crate::constants::ANCHOR_TS_MASK),
            })
            .collect();
        let tag_clock = SimClock {
            drift: rng.gen_range(-config.max_clock_offset_ppm..config.max_clock_offset_ppm),
            offset: rng.gen_range(0..=crate::constants::ANCHOR_TS_MASK),
        };

        let anchor_count = positions.len();
        SimulatedMesh {
            positions,
            tag_position: config.tag_position,
            config,
            anchor_clocks,
            tag_clock,
            last_tx: vec![LastTransmission::default(); anchor_count],
            time_s: 0.0,
            slot: 0,
            round: 0,
            current_frame: Vec::new(),
            current_arrival: 0,
            transmitted: Vec::new(),
            rng,
        }
    }

    /// Milliseconds since simulation start, the driver's `now_ms`.
    pub fn now_ms(&self) -> u32 {
        (self.time_s * 1000.0) as u32
    }

    fn distance(&self, a: Point3<f32>, b: Point3<f32>) -> f64 {
        (a - b).cast::<f64>().norm()
    }

    /// Propagation delay between two points (s).
    fn propagation_s(&self, a: Point3<f32>, b: Point3<f32>) -> f64 {
        self.distance(a, b) / SPEED_OF_LIGHT
    }

    /// True path-length difference the estimator should see for a
    /// measurement with `anchor_ids == [reference, current]` (m).
    pub fn true_distance_diff(&self, reference: u8, current: u8) -> f64 {
        let d_current = self.distance(self.positions[current as usize], self.tag_position);
        let d_reference = self.distance(self.positions[reference as usize], self.tag_position);
        d_current - d_reference
    }

    fn gaussian(&mut self, std: f64) -> f64 {
        // Box-Muller transform
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        std * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    /// Step to the next anchor transmission. Returns the event to feed the
    /// driver: `PacketReceived` with a frame staged, or `ReceiveTimeout`
    /// when the tag missed the packet.
    pub fn advance(&mut self) -> UwbEvent {
        let anchor = self.slot;
        self.time_s += self.config.slot_interval_s;
        self.slot = (self.slot + 1) % self.positions.len();
        if self.slot == 0 {
            self.round += 1;
        }

        let tx_time = self.time_s;
        let anchor_position = self.positions[anchor];
        let seq_nr = (self.last_tx[anchor].seq_nr + 1) & 0x7f;

        let mut packet = RangePacket {
            seq_nrs: [0; NR_OF_TDOA2_ANCHORS],
            timestamps: [0; NR_OF_TDOA2_ANCHORS],
            distances: [0; NR_OF_TDOA2_ANCHORS],
        };

        packet.timestamps[anchor] = self.anchor_clocks[anchor].ticks_at(tx_time);
        packet.seq_nrs[anchor] = seq_nr;

        // Report what this anchor heard from its neighbours
        for other in 0..self.positions.len() {
            if other == anchor {
                continue;
            }
            if let Some(other_tx_time) = self.last_tx[other].time {
                let propagation = self.propagation_s(self.positions[other], anchor_position);
                packet.timestamps[other] =
                    self.anchor_clocks[anchor].ticks_at(other_tx_time + propagation);
                packet.seq_nrs[other] = self.last_tx[other].seq_nr;
                packet.distances[other] = (propagation * UWB_TS_FREQ).round() as u16;
            }
        }

        self.last_tx[anchor] = LastTransmission {
            time: Some(tx_time),
            seq_nr,
        };

        let mut payload = packet.encode();
        if self.round % self.config.position_period_rounds == 0 {
            payload.push(LPP_HEADER_SHORT_PACKET);
            payload.extend_from_slice(&encode_lpp_short_anchor_pos(
                anchor_position.x,
                anchor_position.y,
                anchor_position.z,
            ));
        }

        if self.config.packet_loss > 0.0 && self.rng.gen::<f64>() < self.config.packet_loss {
            return UwbEvent::ReceiveTimeout;
        }

        let arrival_time = tx_time + self.propagation_s(anchor_position, self.tag_position);
        let jitter = self.gaussian(self.config.rx_jitter_std_ticks);
        self.current_arrival = truncate_to_anchor_ts(
            (self.tag_clock.ticks_at(arrival_time) as i64 + jitter.round() as i64) as u64,
        );

        self.current_frame = crate::packet::encode_mac_frame(crate::constants::TAG_ADDRESS, &payload);
        // Rewrite the source address to the transmitting anchor's
        let source = ANCHOR_BASE_ADDRESS | anchor as u64;
        self.current_frame[13..21].copy_from_slice(&source.to_le_bytes());

        UwbEvent::PacketReceived
    }
}

impl Radio for SimulatedMesh {
    fn read_packet(&mut self, buf: &mut [u8]) -> usize {
        let length = self.current_frame.len().min(buf.len());
        buf[..length].copy_from_slice(&self.current_frame[..length]);
        length
    }

    fn receive_timestamp(&self) -> u64 {
        self.current_arrival
    }

    fn set_receive_mode(&mut self) {}

    fn transmit(&mut self, frame: &[u8]) {
        self.transmitted.push(frame.to_vec());
    }

    fn set_receive_wait_timeout(&mut self, _timeout_ms: u32) {}
}
