//! Codec preference rewriting on raw SDP text
//!
//! The rewriter never parses the whole session description into a model. It
//! works on the lines of a single `m=` section so that payload types reused
//! by other sections are left alone, and it keeps every line it does not
//! need to touch byte-for-byte.

use std::collections::HashMap;

use tracing::debug;

use super::types::{CodecPreferenceList, MediaKind};

/// Packet-recovery encodings kept ahead of any codec preference
const RECOVERY_CODECS: [&str; 3] = ["red", "ulpfec", "flexfec-03"];

/// Encodings that are not codecs and never get bitrate directives
const NON_CODEC_NAMES: [&str; 4] = ["red", "rtx", "ulpfec", "flexfec-03"];

const START_BITRATE_PARAM: &str = "x-google-start-bitrate";

/// Static RTP payload types that may be listed without an `a=rtpmap` line
fn static_payload_name(pt: &str) -> Option<&'static str> {
    match pt {
        "0" => Some("PCMU"),
        "8" => Some("PCMA"),
        "9" => Some("G722"),
        _ => None,
    }
}

/// Lines of an SDP document plus the line ending they were split on
struct SdpLines<'a> {
    lines: Vec<&'a str>,
    eol: &'static str,
}

impl<'a> SdpLines<'a> {
    fn split(sdp: &'a str) -> Self {
        let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
        Self {
            lines: sdp.split(eol).collect(),
            eol,
        }
    }

    /// Index range `[m_line, next_m_line)` of the first section of `kind`
    fn section(&self, kind: MediaKind) -> Option<(usize, usize)> {
        let prefix = format!("m={} ", kind.as_str());
        let start = self.lines.iter().position(|l| l.starts_with(&prefix))?;
        let end = self.lines[start + 1..]
            .iter()
            .position(|l| l.starts_with("m="))
            .map(|offset| start + 1 + offset)
            .unwrap_or(self.lines.len());
        Some((start, end))
    }
}

/// Payload-type tables of one media section
#[derive(Debug, Default)]
struct PayloadTable {
    /// payload type -> encoding name, as written in the rtpmap
    names: HashMap<String, String>,
    /// original payload type -> retransmission payload types, in m-line order
    rtx: HashMap<String, Vec<String>>,
}

impl PayloadTable {
    fn parse(section: &[&str], m_line_pts: &[&str]) -> Self {
        let mut table = PayloadTable::default();
        let mut apt_of: HashMap<String, String> = HashMap::new();

        for line in section {
            if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if let Some((pt, encoding)) = rest.split_once(' ') {
                    let name = encoding.split('/').next().unwrap_or("").trim();
                    table.names.insert(pt.to_string(), name.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
                if let Some((pt, params)) = rest.split_once(' ') {
                    let apt = params
                        .split(';')
                        .filter_map(|p| p.trim().strip_prefix("apt="))
                        .next();
                    if let Some(apt) = apt {
                        apt_of.insert(pt.to_string(), apt.trim().to_string());
                    }
                }
            }
        }

        for pt in m_line_pts {
            if !table.names.contains_key(*pt) {
                if let Some(name) = static_payload_name(pt) {
                    table.names.insert(pt.to_string(), name.to_string());
                }
            }
        }

        // Walk in m-line order so rtx lists come out deterministic
        for pt in m_line_pts {
            if let Some(apt) = apt_of.get(*pt) {
                table.rtx.entry(apt.clone()).or_default().push(pt.to_string());
            }
        }

        table
    }

    fn payloads_named<'p>(&self, m_line_pts: &[&'p str], name: &str) -> Vec<&'p str> {
        m_line_pts
            .iter()
            .copied()
            .filter(|pt| {
                self.names
                    .get(*pt)
                    .map(|n| n.eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn with_rtx(&self, pts: &[&str]) -> Vec<String> {
        let mut block = Vec::new();
        for pt in pts {
            block.push(pt.to_string());
            if let Some(rtx) = self.rtx.get(*pt) {
                block.extend(rtx.iter().cloned());
            }
        }
        block
    }
}

/// Reorder and strip the codecs of the first `m=<kind>` section.
///
/// Payload types of the preferred codecs come first, highest priority
/// first, each followed by its retransmission payload types. For video the
/// `red`, `ulpfec` and `flexfec-03` payload types (and their rtx) are always
/// kept after the preferred codecs. Every other payload type is dropped
/// from the `m=` line along with its `rtpmap`, `fmtp` and `rtcp-fb` lines.
///
/// The input is returned unchanged when `preferences` is empty, when there
/// is no `m=` line of that kind, or when none of the preferred codecs is
/// offered. Applying the function to its own output is a no-op.
pub fn set_preferred_codecs(sdp: &str, preferences: &CodecPreferenceList, kind: MediaKind) -> String {
    if preferences.is_empty() {
        return sdp.to_string();
    }

    let doc = SdpLines::split(sdp);
    let Some((start, end)) = doc.section(kind) else {
        debug!(kind = %kind, "No m-line for media kind, SDP left unchanged");
        return sdp.to_string();
    };

    let m_fields: Vec<&str> = doc.lines[start].split_whitespace().collect();
    if m_fields.len() < 3 {
        return sdp.to_string();
    }
    let m_line_pts = &m_fields[3..];
    let table = PayloadTable::parse(&doc.lines[start + 1..end], m_line_pts);

    let mut kept: Vec<String> = Vec::new();
    if kind == MediaKind::Video {
        for name in RECOVERY_CODECS {
            let pts = table.payloads_named(m_line_pts, name);
            for pt in table.with_rtx(&pts) {
                if !kept.contains(&pt) {
                    kept.push(pt);
                }
            }
        }
    }

    let mut matched_codec = false;
    for name in preferences.names().iter().rev() {
        let pts = table.payloads_named(m_line_pts, name);
        if pts.is_empty() {
            continue;
        }
        matched_codec = true;
        let block: Vec<String> = table
            .with_rtx(&pts)
            .into_iter()
            .filter(|pt| !kept.contains(pt))
            .collect();
        kept.splice(0..0, block);
    }

    if !matched_codec {
        debug!(kind = %kind, "No preferred codec offered, SDP left unchanged");
        return sdp.to_string();
    }

    let removed: Vec<&str> = m_line_pts
        .iter()
        .copied()
        .filter(|pt| !kept.iter().any(|k| k == pt))
        .collect();
    let removed_prefixes: Vec<String> = removed
        .iter()
        .flat_map(|pt| {
            [
                format!("a=rtpmap:{} ", pt),
                format!("a=fmtp:{} ", pt),
                format!("a=rtcp-fb:{} ", pt),
            ]
        })
        .collect();

    let new_m_line = format!("{} {}", m_fields[..3].join(" "), kept.join(" "));

    let mut out: Vec<String> = Vec::with_capacity(doc.lines.len());
    for (idx, line) in doc.lines.iter().enumerate() {
        if idx == start {
            out.push(new_m_line.clone());
        } else if idx > start
            && idx < end
            && removed_prefixes.iter().any(|p| line.starts_with(p.as_str()))
        {
            continue;
        } else {
            out.push(line.to_string());
        }
    }

    debug!(kind = %kind, kept = ?kept, removed = ?removed, "Rewrote codec order");
    out.join(doc.eol)
}

/// Add a start-bitrate hint to every video codec payload type.
///
/// Existing `a=fmtp` lines get `;x-google-start-bitrate=<kbps>` appended
/// (replacing an older value); codecs without one get a new fmtp line right
/// after their rtpmap.
pub fn set_start_video_bandwidth(sdp: &str, kbps: u32) -> String {
    let doc = SdpLines::split(sdp);
    let Some((start, end)) = doc.section(MediaKind::Video) else {
        return sdp.to_string();
    };
    let m_fields: Vec<&str> = doc.lines[start].split_whitespace().collect();
    if m_fields.len() < 3 {
        return sdp.to_string();
    }
    let m_line_pts = &m_fields[3..];
    let table = PayloadTable::parse(&doc.lines[start + 1..end], m_line_pts);

    let codec_pts: Vec<&str> = m_line_pts
        .iter()
        .copied()
        .filter(|pt| match table.names.get(*pt) {
            Some(name) => !NON_CODEC_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name)),
            None => false,
        })
        .collect();

    let has_fmtp: Vec<&str> = codec_pts
        .iter()
        .copied()
        .filter(|pt| {
            let prefix = format!("a=fmtp:{} ", pt);
            doc.lines[start + 1..end].iter().any(|l| l.starts_with(&prefix))
        })
        .collect();

    let directive = format!("{}={}", START_BITRATE_PARAM, kbps);
    let mut out: Vec<String> = Vec::with_capacity(doc.lines.len() + codec_pts.len());
    for (idx, line) in doc.lines.iter().enumerate() {
        let in_section = idx > start && idx < end;
        if in_section {
            if let Some(pt) = codec_pts
                .iter()
                .find(|pt| line.starts_with(&format!("a=fmtp:{} ", pt)))
            {
                let (head, params) = line.split_at(format!("a=fmtp:{} ", pt).len());
                let mut kept: Vec<&str> = params
                    .split(';')
                    .map(str::trim)
                    .filter(|p| !p.is_empty() && !p.starts_with(START_BITRATE_PARAM))
                    .collect();
                kept.push(&directive);
                out.push(format!("{}{}", head, kept.join(";")));
                continue;
            }
        }
        out.push(line.to_string());
        if in_section {
            if let Some(pt) = codec_pts
                .iter()
                .find(|pt| line.starts_with(&format!("a=rtpmap:{} ", pt)))
            {
                if !has_fmtp.contains(pt) {
                    out.push(format!("a=fmtp:{} {}", pt, directive));
                }
            }
        }
    }
    out.join(doc.eol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn video_sdp() -> String {
        [
            "v=0",
            "o=- 4611731400430051336 2 IN IP4 127.0.0.1",
            "s=-",
            "t=0 0",
            "m=audio 9 UDP/TLS/RTP/SAVPF 111 0",
            "a=rtpmap:111 opus/48000/2",
            "a=rtcp-fb:111 transport-cc",
            "a=fmtp:111 minptime=10;useinbandfec=1",
            "m=video 9 UDP/TLS/RTP/SAVPF 96 97 98",
            "a=rtpmap:96 VP8/90000",
            "a=rtcp-fb:96 nack",
            "a=rtpmap:97 H264/90000",
            "a=rtcp-fb:97 nack",
            "a=fmtp:97 level-asymmetry-allowed=1;packetization-mode=1",
            "a=rtpmap:98 rtx/90000",
            "a=fmtp:98 apt=97",
            "",
        ]
        .join("\r\n")
    }

    fn m_line<'a>(sdp: &'a str, kind: &str) -> &'a str {
        sdp.split("\r\n")
            .find(|l| l.starts_with(&format!("m={} ", kind)))
            .unwrap()
    }

    #[test]
    fn test_h264_preference_strips_vp8() {
        let out = set_preferred_codecs(&video_sdp(), &vec!["H264"].into(), MediaKind::Video);
        assert_eq!(m_line(&out, "video"), "m=video 9 UDP/TLS/RTP/SAVPF 97 98");
        assert!(!out.contains("a=rtpmap:96 "));
        assert!(!out.contains("a=rtcp-fb:96 "));
        assert!(out.contains("a=fmtp:98 apt=97"));
        // audio section untouched
        assert_eq!(m_line(&out, "audio"), "m=audio 9 UDP/TLS/RTP/SAVPF 111 0");
        assert!(out.ends_with("\r\n"));
    }

    #[test]
    fn test_empty_preferences_is_noop() {
        let sdp = video_sdp();
        assert_eq!(set_preferred_codecs(&sdp, &CodecPreferenceList::new(), MediaKind::Video), sdp);
    }

    #[test]
    fn test_missing_section_is_noop() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n";
        assert_eq!(set_preferred_codecs(sdp, &vec!["VP8"].into(), MediaKind::Video), sdp);
    }

    #[test]
    fn test_unknown_codec_is_noop() {
        let sdp = video_sdp();
        assert_eq!(set_preferred_codecs(&sdp, &vec!["AV1"].into(), MediaKind::Video), sdp);
    }

    #[test]
    fn test_priority_order() {
        let out = set_preferred_codecs(&video_sdp(), &vec!["VP8", "H264"].into(), MediaKind::Video);
        assert_eq!(m_line(&out, "video"), "m=video 9 UDP/TLS/RTP/SAVPF 96 97 98");
        let out = set_preferred_codecs(&video_sdp(), &vec!["H264", "VP8"].into(), MediaKind::Video);
        assert_eq!(m_line(&out, "video"), "m=video 9 UDP/TLS/RTP/SAVPF 97 98 96");
    }

    #[test]
    fn test_case_insensitive_match_and_static_payloads() {
        let out = set_preferred_codecs(&video_sdp(), &vec!["pcmu"].into(), MediaKind::Audio);
        assert_eq!(m_line(&out, "audio"), "m=audio 9 UDP/TLS/RTP/SAVPF 0");
        assert!(!out.contains("a=rtpmap:111 "));
        assert!(!out.contains("a=fmtp:111 "));
        // video section keeps its own 96/97/98 lines
        assert!(out.contains("a=rtpmap:96 VP8/90000"));
    }

    #[test]
    fn test_recovery_payloads_preserved() {
        let sdp = [
            "v=0",
            "m=video 9 UDP/TLS/RTP/SAVPF 96 97 100 101 102 127",
            "a=rtpmap:96 VP8/90000",
            "a=rtpmap:97 rtx/90000",
            "a=fmtp:97 apt=96",
            "a=rtpmap:100 VP9/90000",
            "a=rtpmap:101 red/90000",
            "a=rtpmap:102 rtx/90000",
            "a=fmtp:102 apt=101",
            "a=rtpmap:127 ulpfec/90000",
            "",
        ]
        .join("\r\n");
        let out = set_preferred_codecs(&sdp, &vec!["VP9"].into(), MediaKind::Video);
        assert_eq!(m_line(&out, "video"), "m=video 9 UDP/TLS/RTP/SAVPF 100 101 102 127");
        assert!(out.contains("a=rtpmap:101 red/90000"));
        assert!(out.contains("a=rtpmap:127 ulpfec/90000"));
        assert!(!out.contains("a=fmtp:97 apt=96"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let prefs: CodecPreferenceList = vec!["H264", "VP8"].into();
        let once = set_preferred_codecs(&video_sdp(), &prefs, MediaKind::Video);
        let twice = set_preferred_codecs(&once, &prefs, MediaKind::Video);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_lf_line_endings_preserved() {
        let sdp = video_sdp().replace("\r\n", "\n");
        let out = set_preferred_codecs(&sdp, &vec!["H264"].into(), MediaKind::Video);
        assert!(!out.contains('\r'));
        assert!(out.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 98\n"));
    }

    #[test]
    fn test_start_bitrate_appends_and_inserts() {
        let out = set_start_video_bandwidth(&video_sdp(), 800);
        assert!(out.contains("a=rtpmap:96 VP8/90000\r\na=fmtp:96 x-google-start-bitrate=800\r\n"));
        assert!(out.contains(
            "a=fmtp:97 level-asymmetry-allowed=1;packetization-mode=1;x-google-start-bitrate=800"
        ));
        // rtx untouched
        assert!(out.contains("a=fmtp:98 apt=97\r\n"));
        // applying again replaces the value instead of stacking
        let again = set_start_video_bandwidth(&out, 500);
        assert!(again.contains("a=fmtp:96 x-google-start-bitrate=500\r\n"));
        assert!(!again.contains("x-google-start-bitrate=800"));
    }
}
