use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use rtcsig_session_core::sdp::{set_preferred_codecs, set_start_video_bandwidth, CodecPreferenceList, MediaKind};
use tracing::debug;

#[derive(Args, Debug)]
pub struct RewriteArgs {
    /// SDP file, stdin when omitted
    pub input: Option<PathBuf>,

    /// Audio codecs in preference order, e.g. `opus,PCMU`
    #[arg(long, value_delimiter = ',')]
    pub audio: Vec<String>,

    /// Video codecs in preference order, e.g. `H264,VP8`
    #[arg(long, value_delimiter = ',')]
    pub video: Vec<String>,

    /// Start bitrate hint for video in kbps
    #[arg(long)]
    pub start_bitrate: Option<u32>,
}

pub fn run(args: RewriteArgs) -> Result<()> {
    let sdp = match &args.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut sdp = String::new();
            std::io::stdin()
                .read_to_string(&mut sdp)
                .context("reading stdin")?;
            sdp
        }
    };
    print!("{}", rewrite(&sdp, &args));
    Ok(())
}

fn rewrite(sdp: &str, args: &RewriteArgs) -> String {
    let audio = preference(&args.audio);
    let video = preference(&args.video);
    debug!(audio = ?audio.names(), video = ?video.names(), "Rewriting SDP");

    let mut sdp = set_preferred_codecs(sdp, &audio, MediaKind::Audio);
    sdp = set_preferred_codecs(&sdp, &video, MediaKind::Video);
    if let Some(kbps) = args.start_bitrate {
        sdp = set_start_video_bandwidth(&sdp, kbps);
    }
    sdp
}

fn preference(names: &[String]) -> CodecPreferenceList {
    names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect::<Vec<&str>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OFFER: &str = "v=0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=rtpmap:0 PCMU/8000\r\n";

    fn args(audio: &[&str]) -> RewriteArgs {
        RewriteArgs {
            input: None,
            audio: audio.iter().map(|s| s.to_string()).collect(),
            video: Vec::new(),
            start_bitrate: None,
        }
    }

    #[test]
    fn test_no_preferences_leaves_sdp_alone() {
        assert_eq!(rewrite(OFFER, &args(&[])), OFFER);
    }

    #[test]
    fn test_audio_preference_applied() {
        let out = rewrite(OFFER, &args(&["PCMU"]));
        assert!(out.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0\r\n"));
        assert!(!out.contains("opus"));
    }
}
