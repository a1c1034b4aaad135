// Shared constants for the UWB TDoA tag

/// Speed of light in vacuum (m/s), used to convert tick differences to metres.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// UWB timestamp counter frequency (Hz): 499.2 MHz chipping clock times 128.
pub const UWB_TS_FREQ: f64 = 499.2e6 * 128.0;

/// Anchor timestamps are 40-bit counters; all tick arithmetic is modulo 2^40.
pub const ANCHOR_TS_MASK: u64 = (1 << 40) - 1;

/// Truncate a timestamp (or a wrapped difference of timestamps) to 40 bits.
#[inline]
pub fn truncate_to_anchor_ts(ts: u64) -> u64 {
    ts & ANCHOR_TS_MASK
}

/// Number of anchor slots addressed by a TDoA2 range packet.
pub const NR_OF_TDOA2_ANCHORS: usize = 8;

/// Base MAC address of the anchors; the low byte is the anchor id.
pub const ANCHOR_BASE_ADDRESS: u64 = 0xbccf_0000_0000_0000;

/// MAC address the tag transmits LPP packets from.
pub const TAG_ADDRESS: u64 = ANCHOR_BASE_ADDRESS | 0xff;

/// PAN id of the positioning network.
pub const PAN_ID: u16 = 0xbccf;

/// Receive-wait timeout programmed into the radio (ms).
pub const RECEIVE_TIMEOUT_MS: u32 = 10_000;

/// Events without a TX opportunity before a queued LPP packet is dropped.
pub const LPP_SEND_TIMEOUT: u32 = NR_OF_TDOA2_ANCHORS as u32 * 5;

/// An anchor counts as "ranging" this long after its last accepted packet (ms).
pub const ANCHOR_STATUS_TIMEOUT_MS: u32 = 1500;
