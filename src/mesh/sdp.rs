//! Opus parameter pinning on outgoing session descriptions.
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusShape {
    pub max_playback_rate:   u32,
    pub max_average_bitrate: u32,
}

impl Default for OpusShape {
    fn default() -> Self {
        Self { max_playback_rate: 16_000, max_average_bitrate: 32_000 }
    }
}

impl OpusShape {
    fn fmtp(&self, pt: &str) -> String {
        format!(
            "a=fmtp:{pt} maxplaybackrate={}; stereo=0; sprop-stereo=0; maxaveragebitrate={}; cbr=1; useinbandfec=1; usedtx=1",
            self.max_playback_rate, self.max_average_bitrate,
        )
    }
}

/// Payload types mapped to opus by `a=rtpmap:<pt> opus/...`.
fn opus_payloads(sdp: &str) -> HashSet<String> {
    sdp.lines()
        .filter_map(|l| l.trim_end().strip_prefix("a=rtpmap:"))
        .filter_map(|rest| rest.split_once(' '))
        .filter(|(_, codec)| codec.to_ascii_lowercase().starts_with("opus/"))
        .map(|(pt, _)| pt.to_string())
        .collect()
}

/// First `a=ice-ufrag:` value; candidates from another ICE session carry a
/// different fragment.
pub fn ice_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|l| l.trim_end().strip_prefix("a=ice-ufrag:"))
        .map(str::trim)
        .filter(|u| !u.is_empty())
}

/// Rewrites (or adds) the fmtp line of every opus payload type. Descriptions
/// without opus are returned unchanged.
pub fn shape(sdp: &str, shape: &OpusShape) -> String {
    let opus = opus_payloads(sdp);
    if opus.is_empty() {
        return sdp.to_string();
    }
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let has_fmtp: HashSet<&str> = sdp
        .lines()
        .filter_map(|l| l.strip_prefix("a=fmtp:"))
        .filter_map(|rest| rest.split_once(' ').map(|(pt, _)| pt))
        .collect();

    let mut out = String::with_capacity(sdp.len() + 128);
    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((pt, _)) = line.strip_prefix("a=fmtp:").and_then(|r| r.split_once(' ')) {
            if opus.contains(pt) {
                out.push_str(&shape.fmtp(pt));
                out.push_str(eol);
                continue;
            }
        }
        out.push_str(line);
        out.push_str(eol);
        // rtpmap 後面沒有 fmtp 就補一行
        if let Some((pt, _)) = line.strip_prefix("a=rtpmap:").and_then(|r| r.split_once(' ')) {
            if opus.contains(pt) && !has_fmtp.contains(pt) {
                out.push_str(&shape.fmtp(pt));
                out.push_str(eol);
            }
        }
    }
    if !sdp.ends_with('\n') {
        out.truncate(out.len() - eol.len());
    }
    out
}
