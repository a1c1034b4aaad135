// Anchor storage for the TDoA engine
//
// A fixed array of anchor records, found by linear scan. The anchor set
// changes as the tag moves, so a full store reuses the least recently
// updated slot. Each record carries sub-caches of data the anchor reported
// about its neighbours (reception times and times of flight), each entry
// with its own end of life.

use nalgebra::Point3;

use crate::clock_correction::ClockCorrectionStorage;

/// Number of anchor records. Must be at least the number of concurrently
/// addressable anchors.
pub const ANCHOR_STORAGE_COUNT: usize = 16;

/// Remote-rx and remote-tof entries per anchor record.
pub const REMOTE_ANCHOR_DATA_COUNT: usize = 16;

// All validity windows in milliseconds.
const TOF_VALIDITY_PERIOD_MS: u32 = 2 * 1000;
const REMOTE_DATA_VALIDITY_PERIOD_MS: u32 = 30;
const ANCHOR_POSITION_VALIDITY_PERIOD_MS: u32 = 2 * 1000;
const ANCHOR_ACTIVE_VALIDITY_PERIOD_MS: u32 = 2 * 1000;

/// Reception time of a neighbour's packet as measured by this anchor, with
/// the sequence number of that packet.
#[derive(Debug, Clone, Copy, Default)]
struct RemoteAnchorData {
    id: u8,
    seq_nr: u8,
    rx_time: u64,
    end_of_life_ms: u32,
}

/// Time of flight between this anchor and a neighbour, in anchor clock ticks.
#[derive(Debug, Clone, Copy, Default)]
struct RemoteTof {
    id: u8,
    tof: u64,
    end_of_life_ms: u32,
}

/// Anchor position with the time it was last reported.
#[derive(Debug, Clone, Copy)]
pub struct AnchorPosition {
    pub coords: Point3<f32>,
    pub timestamp_ms: u32,
}

/// One tracked anchor.
#[derive(Debug, Clone, Copy)]
struct AnchorInfo {
    id: u8,
    is_initialized: bool,
    last_update_ms: u32,

    rx_time: u64,
    tx_time: u64,
    seq_nr: u8,

    clock_correction: ClockCorrectionStorage,

    position: Point3<f32>,
    position_timestamp_ms: u32,
    position_set: bool,

    remote_anchor_data: [RemoteAnchorData; REMOTE_ANCHOR_DATA_COUNT],
    remote_tof: [RemoteTof; REMOTE_ANCHOR_DATA_COUNT],
}

impl Default for AnchorInfo {
    fn default() -> Self {
        AnchorInfo {
            id: 0,
            is_initialized: false,
            last_update_ms: 0,
            rx_time: 0,
            tx_time: 0,
            seq_nr: 0,
            clock_correction: ClockCorrectionStorage::default(),
            position: Point3::origin(),
            position_timestamp_ms: 0,
            position_set: false,
            remote_anchor_data: [RemoteAnchorData::default(); REMOTE_ANCHOR_DATA_COUNT],
            remote_tof: [RemoteTof::default(); REMOTE_ANCHOR_DATA_COUNT],
        }
    }
}

/// Handle to one record: a slot index plus the time snapshot all validity
/// checks are made against. Never keep one across packets.
#[derive(Debug, Clone, Copy)]
pub struct AnchorContext {
    slot: usize,
    pub now_ms: u32,
}

/// The record array. Accessors take an [`AnchorContext`], which keeps two
/// records addressable at the same time (the engine works on a pair).
pub struct AnchorStorage {
    anchors: [AnchorInfo; ANCHOR_STORAGE_COUNT],
}

impl Default for AnchorStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl AnchorStorage {
    pub fn new() -> Self {
        AnchorStorage {
            anchors: [AnchorInfo::default(); ANCHOR_STORAGE_COUNT],
        }
    }

    /// Find the record for `anchor`, creating one if needed. The bool is
    /// true when the anchor was already in storage. Creation zeroes either
    /// the first free slot or, when full, the least recently updated one.
    pub fn get_or_create_ctx(&mut self, anchor: u8, now_ms: u32) -> (AnchorContext, bool) {
        let mut oldest_update_time = now_ms;
        let mut oldest_slot = 0;
        let mut first_uninitialized_slot = None;

        for (i, info) in self.anchors.iter().enumerate() {
            if info.is_initialized {
                if info.id == anchor {
                    return (AnchorContext { slot: i, now_ms }, true);
                }
                if info.last_update_ms < oldest_update_time {
                    oldest_update_time = info.last_update_ms;
                    oldest_slot = i;
                }
            } else if first_uninitialized_slot.is_none() {
                first_uninitialized_slot = Some(i);
            }
        }

        let slot = first_uninitialized_slot.unwrap_or(oldest_slot);
        self.anchors[slot] = AnchorInfo {
            id: anchor,
            is_initialized: true,
            ..AnchorInfo::default()
        };

        (AnchorContext { slot, now_ms }, false)
    }

    /// Find the record for `anchor` without creating one.
    pub fn get_ctx(&self, anchor: u8, now_ms: u32) -> Option<AnchorContext> {
        self.anchors
            .iter()
            .position(|info| info.is_initialized && info.id == anchor)
            .map(|slot| AnchorContext { slot, now_ms })
    }

    /// True when a record exists for `anchor`.
    pub fn contains(&self, anchor: u8) -> bool {
        self.get_ctx(anchor, 0).is_some()
    }

    /// Fill `list` with the ids of all initialized records; returns the count.
    pub fn anchor_id_list(&self, list: &mut [u8]) -> usize {
        let mut count = 0;
        for info in self.anchors.iter() {
            if count >= list.len() {
                break;
            }
            if info.is_initialized {
                list[count] = info.id;
                count += 1;
            }
        }
        count
    }

    /// As [`anchor_id_list`](Self::anchor_id_list), restricted to anchors
    /// updated within the active-validity window.
    pub fn active_anchor_id_list(&self, list: &mut [u8], now_ms: u32) -> usize {
        let expiry_time = now_ms.saturating_sub(ANCHOR_ACTIVE_VALIDITY_PERIOD_MS);
        let mut count = 0;
        for info in self.anchors.iter() {
            if count >= list.len() {
                break;
            }
            if info.is_initialized && info.last_update_ms > expiry_time {
                list[count] = info.id;
                count += 1;
            }
        }
        count
    }

    pub fn id(&self, ctx: &AnchorContext) -> u8 {
        self.anchors[ctx.slot].id
    }

    pub fn rx_time(&self, ctx: &AnchorContext) -> u64 {
        self.anchors[ctx.slot].rx_time
    }

    pub fn tx_time(&self, ctx: &AnchorContext) -> u64 {
        self.anchors[ctx.slot].tx_time
    }

    pub fn seq_nr(&self, ctx: &AnchorContext) -> u8 {
        self.anchors[ctx.slot].seq_nr
    }

    pub fn last_update_time(&self, ctx: &AnchorContext) -> u32 {
        self.anchors[ctx.slot].last_update_ms
    }

    /// Store the timestamps of the packet just received from this anchor and
    /// refresh its last-update time.
    pub fn set_rx_tx_data(&mut self, ctx: &AnchorContext, rx_time: u64, tx_time: u64, seq_nr: u8) {
        let info = &mut self.anchors[ctx.slot];
        info.rx_time = rx_time;
        info.tx_time = tx_time;
        info.seq_nr = seq_nr;
        info.last_update_ms = ctx.now_ms;
    }

    pub fn clock_correction(&self, ctx: &AnchorContext) -> f64 {
        self.anchors[ctx.slot].clock_correction.correction()
    }

    pub fn clock_correction_storage_mut(
        &mut self,
        ctx: &AnchorContext,
    ) -> &mut ClockCorrectionStorage {
        &mut self.anchors[ctx.slot].clock_correction
    }

    /// Anchor position, if one was reported within the validity window.
    pub fn anchor_position(&self, ctx: &AnchorContext) -> Option<AnchorPosition> {
        let info = &self.anchors[ctx.slot];
        let valid_creation_time = ctx.now_ms.saturating_sub(ANCHOR_POSITION_VALIDITY_PERIOD_MS);
        if info.position_set && info.position_timestamp_ms > valid_creation_time {
            return Some(AnchorPosition {
                coords: info.position,
                timestamp_ms: info.position_timestamp_ms,
            });
        }
        None
    }

    pub fn set_anchor_position(&mut self, ctx: &AnchorContext, x: f32, y: f32, z: f32) {
        let info = &mut self.anchors[ctx.slot];
        info.position = Point3::new(x, y, z);
        info.position_timestamp_ms = ctx.now_ms;
        info.position_set = true;
    }

    /// Reception time and sequence number this anchor reported for a packet
    /// from `remote_anchor`, if still within the validity window.
    pub fn remote_rx_time(&self, ctx: &AnchorContext, remote_anchor: u8) -> Option<(u64, u8)> {
        let info = &self.anchors[ctx.slot];
        for entry in info.remote_anchor_data.iter() {
            if entry.id == remote_anchor {
                if entry.end_of_life_ms > ctx.now_ms {
                    return Some((entry.rx_time, entry.seq_nr));
                }
                break;
            }
        }
        None
    }

    /// Record a reception time this anchor reported for `remote_anchor`.
    /// Reuses the entry for that id, or failing that the entry closest to
    /// its end of life.
    pub fn set_remote_rx_time(
        &mut self,
        ctx: &AnchorContext,
        remote_anchor: u8,
        rx_time: u64,
        seq_nr: u8,
    ) {
        let info = &mut self.anchors[ctx.slot];

        let mut index_to_update = 0;
        let mut oldest_time = u32::MAX;
        for (i, entry) in info.remote_anchor_data.iter().enumerate() {
            if entry.id == remote_anchor {
                index_to_update = i;
                break;
            }
            if entry.end_of_life_ms < oldest_time {
                oldest_time = entry.end_of_life_ms;
                index_to_update = i;
            }
        }

        info.remote_anchor_data[index_to_update] = RemoteAnchorData {
            id: remote_anchor,
            rx_time,
            seq_nr,
            end_of_life_ms: ctx.now_ms + REMOTE_DATA_VALIDITY_PERIOD_MS,
        };
    }

    /// Fill `ids`/`seq_nrs` with all non-expired remote-rx entries; returns
    /// the count. Order is the stable slot order.
    pub fn remote_seq_nr_list(
        &self,
        ctx: &AnchorContext,
        ids: &mut [u8; REMOTE_ANCHOR_DATA_COUNT],
        seq_nrs: &mut [u8; REMOTE_ANCHOR_DATA_COUNT],
    ) -> usize {
        let info = &self.anchors[ctx.slot];
        let mut count = 0;
        for entry in info.remote_anchor_data.iter() {
            if entry.end_of_life_ms > ctx.now_ms {
                ids[count] = entry.id;
                seq_nrs[count] = entry.seq_nr;
                count += 1;
            }
        }
        count
    }

    /// Time of flight between this anchor and `other_anchor`, if known and
    /// still valid. A stored TOF is never zero (callers filter zeroes on
    /// ingest), so `Some` implies a usable value.
    pub fn remote_tof(&self, ctx: &AnchorContext, other_anchor: u8) -> Option<u64> {
        let info = &self.anchors[ctx.slot];
        for entry in info.remote_tof.iter() {
            if entry.id == other_anchor {
                if entry.end_of_life_ms > ctx.now_ms {
                    return Some(entry.tof);
                }
                break;
            }
        }
        None
    }

    /// Record the time of flight between this anchor and `remote_anchor`.
    pub fn set_remote_tof(&mut self, ctx: &AnchorContext, remote_anchor: u8, tof: u64) {
        let info = &mut self.anchors[ctx.slot];

        let mut index_to_update = 0;
        let mut oldest_time = u32::MAX;
        for (i, entry) in info.remote_tof.iter().enumerate() {
            if entry.id == remote_anchor {
                index_to_update = i;
                break;
            }
            if entry.end_of_life_ms < oldest_time {
                oldest_time = entry.end_of_life_ms;
                index_to_update = i;
            }
        }

        info.remote_tof[index_to_update] = RemoteTof {
            id: remote_anchor,
            tof,
            end_of_life_ms: ctx.now_ms + TOF_VALIDITY_PERIOD_MS,
        };
    }
}
