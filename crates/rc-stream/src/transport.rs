//! Media transport surface consumed by the streaming core.
//!
//! The peer connection, media tracks, and data channels are owned by the
//! signaling layer; the core only needs the narrow object-safe traits
//! defined here: write a sample, send on a channel, read a stats report,
//! close. Adapters for a concrete transport implement these traits.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::StreamError;

/// Time allowed for ICE gathering at session setup.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(20);

/// The peer connection, reduced to what the core calls.
pub trait PeerTransport: Send + Sync {
    /// Close the connection; must be idempotent and unblock any
    /// transport-side reads.
    fn close(&self);

    /// Current statistics keyed by stat id.
    fn get_stats(&self) -> StatsReport;
}

/// An outbound media track (video or audio).
pub trait MediaTrack: Send + Sync {
    fn write_sample(&self, data: &[u8], duration: Duration) -> Result<(), StreamError>;
}

/// Data channel ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A message arriving on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Handler invoked on the transport's callback thread; must not block.
pub type MessageHandler = Box<dyn Fn(ChannelMessage) + Send + Sync>;

/// One of the session's data channels (`input`, `control`, `cursor`).
pub trait DataChannel: Send + Sync {
    fn ready_state(&self) -> ChannelState;
    fn send(&self, data: &[u8]) -> Result<(), StreamError>;
    fn send_text(&self, text: &str) -> Result<(), StreamError>;
    fn on_message(&self, handler: MessageHandler);
    fn close(&self);
}

// ─── Statistics ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Receiver-side RTP stats reported over RTCP.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInboundRtp {
    pub kind: MediaKind,
    pub round_trip_time: Duration,
    pub fraction_lost: f64,
    pub packets_received: u64,
}

/// One entry of a transport stats report.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsEntry {
    RemoteInboundRtp(RemoteInboundRtp),
    /// Stat types the core does not consume.
    Other,
}

/// A transport stats report keyed by stat id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    pub entries: HashMap<String, StatsEntry>,
}

/// Network conditions of the representative video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoNetworkStats {
    pub rtt: Duration,
    pub fraction_lost: f64,
}

/// Pick the remote-inbound *video* stream with the most packets received
/// as the representative for adaptation. Audio streams are ignored; an
/// empty report yields `None`.
pub fn extract_remote_inbound_video_stats(report: &StatsReport) -> Option<VideoNetworkStats> {
    report
        .entries
        .values()
        .filter_map(|entry| match entry {
            StatsEntry::RemoteInboundRtp(rtp) if rtp.kind == MediaKind::Video => Some(rtp),
            _ => None,
        })
        .max_by_key(|rtp| rtp.packets_received)
        .map(|rtp| VideoNetworkStats {
            rtt: rtp.round_trip_time,
            fraction_lost: rtp.fraction_lost,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(kind: MediaKind, rtt_ms: u64, lost: f64, packets: u64) -> StatsEntry {
        StatsEntry::RemoteInboundRtp(RemoteInboundRtp {
            kind,
            round_trip_time: Duration::from_millis(rtt_ms),
            fraction_lost: lost,
            packets_received: packets,
        })
    }

    #[test]
    fn test_picks_video_stream_with_most_packets() {
        let mut report = StatsReport::default();
        report
            .entries
            .insert("a1".into(), rtp(MediaKind::Audio, 20, 0.01, 999));
        report
            .entries
            .insert("v1".into(), rtp(MediaKind::Video, 100, 0.20, 10));
        report
            .entries
            .insert("v2".into(), rtp(MediaKind::Video, 123, 0.05, 20));

        let stats = extract_remote_inbound_video_stats(&report).unwrap();
        assert_eq!(stats.rtt, Duration::from_millis(123));
        assert!((stats.fraction_lost - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_report_yields_none() {
        assert!(extract_remote_inbound_video_stats(&StatsReport::default()).is_none());
    }

    #[test]
    fn test_audio_only_report_yields_none() {
        let mut report = StatsReport::default();
        report
            .entries
            .insert("a1".into(), rtp(MediaKind::Audio, 20, 0.01, 50));
        report.entries.insert("x".into(), StatsEntry::Other);
        assert!(extract_remote_inbound_video_stats(&report).is_none());
    }
}
