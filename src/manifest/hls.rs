//! HLS (m3u8) manifest parser (spec §4.1).

use std::collections::HashMap;

use tracing::warn;

use crate::error::ManifestError;
use crate::model::{label_for, AudioTrack, VideoQuality};

use super::common::resolve;

#[derive(Debug, Clone, PartialEq)]
pub struct HlsVariant {
    pub url: String,
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
    pub frame_rate: Option<f64>,
    pub audio_group_ref: Option<String>,
}

impl HlsVariant {
    pub fn quality(&self) -> VideoQuality {
        let (width, height) = self
            .resolution
            .map_or((None, None), |(w, h)| (Some(w), Some(h)));
        VideoQuality::new(width, height, Some(self.bandwidth), self.frame_rate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HlsAudioRendition {
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub uri: Option<String>,
    pub is_default: bool,
    pub autoselect: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyDescriptor {
    pub method: String,
    pub uri: Option<String>,
    pub keyformat: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HlsSegment {
    pub uri: String,
    pub duration: f64,
    pub byte_range: Option<(u64, Option<u64>)>,
    pub key: Option<KeyDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HlsPlaylist {
    Master {
        variants: Vec<HlsVariant>,
        audio_groups: HashMap<String, Vec<HlsAudioRendition>>,
        is_drm: bool,
    },
    Media {
        target_duration: f64,
        segments: Vec<HlsSegment>,
        total_duration: f64,
        is_drm: bool,
        last_key: Option<KeyDescriptor>,
    },
}

impl HlsPlaylist {
    pub fn is_drm(&self) -> bool {
        match self {
            HlsPlaylist::Master { is_drm, .. } => *is_drm,
            HlsPlaylist::Media { is_drm, .. } => *is_drm,
        }
    }
}

/// Splits an `#EXT-X-STREAM-INF`/`#EXT-X-MEDIA`/`#EXT-X-KEY` attribute list
/// (`KEY=VALUE,KEY="v,with,commas"`) into key/value pairs. Commas and `=`
/// inside double quotes are not delimiters; quotes themselves are stripped.
fn parse_attribute_list(raw: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_quotes = false;
    let mut in_value = false;

    let mut flush = |key: &mut String, value: &mut String, attrs: &mut HashMap<String, String>| {
        if !key.trim().is_empty() {
            attrs.insert(key.trim().to_string(), value.trim().to_string());
        }
        key.clear();
        value.clear();
    };

    for ch in raw.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '=' if !in_quotes && !in_value => in_value = true,
            ',' if !in_quotes => {
                flush(&mut key, &mut value, &mut attrs);
                in_value = false;
            }
            _ => {
                if in_value {
                    value.push(ch);
                } else {
                    key.push(ch);
                }
            }
        }
    }
    flush(&mut key, &mut value, &mut attrs);
    attrs
}

fn parse_u64(attrs: &HashMap<String, String>, key: &str) -> u64 {
    attrs
        .get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or_else(|| {
            if attrs.contains_key(key) {
                warn!("malformed numeric attribute {key}, defaulting to 0");
            }
            0
        })
}

fn parse_resolution(attrs: &HashMap<String, String>) -> Option<(u32, u32)> {
    let raw = attrs.get("RESOLUTION")?;
    let (w, h) = raw.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

fn is_drm_method(method: &str, keyformat: Option<&str>) -> bool {
    if method != "NONE" && method != "AES-128" {
        return true;
    }
    if let Some(kf) = keyformat {
        let lower = kf.to_ascii_lowercase();
        if lower.contains("widevine") || lower.contains("fairplay") {
            return true;
        }
    }
    false
}

fn scan_raw_drm_markers(body: &str) -> bool {
    body.contains("com.widevine") || body.contains("com.apple.fps")
}

pub fn parse(body: &str, manifest_url: &str) -> Result<HlsPlaylist, ManifestError> {
    let mut lines = body.lines();
    let first = lines
        .next()
        .ok_or_else(|| ManifestError::invalid("empty manifest"))?;
    if !first.trim_start().starts_with("#EXTM3U") {
        return Err(ManifestError::invalid("missing #EXTM3U header"));
    }

    let is_master = body.contains("#EXT-X-STREAM-INF");
    if is_master {
        parse_master(body, manifest_url)
    } else {
        parse_media(body, manifest_url)
    }
}

fn parse_master(body: &str, manifest_url: &str) -> Result<HlsPlaylist, ManifestError> {
    let mut variants = Vec::new();
    let mut audio_groups: HashMap<String, Vec<HlsAudioRendition>> = HashMap::new();
    let mut is_drm = scan_raw_drm_markers(body);

    let mut lines = body.lines().peekable();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = parse_attribute_list(rest);
            if attrs.get("TYPE").map(String::as_str) == Some("AUDIO") {
                let group_id = attrs
                    .get("GROUP-ID")
                    .cloned()
                    .unwrap_or_else(|| "default".to_string());
                let rendition = HlsAudioRendition {
                    group_id: group_id.clone(),
                    name: attrs.get("NAME").cloned().unwrap_or_default(),
                    language: attrs.get("LANGUAGE").cloned(),
                    uri: attrs.get("URI").map(|u| resolve(manifest_url, u)),
                    is_default: attrs.get("DEFAULT").map(String::as_str) == Some("YES"),
                    autoselect: attrs.get("AUTOSELECT").map(String::as_str) == Some("YES"),
                };
                audio_groups.entry(group_id).or_default().push(rendition);
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attribute_list(rest);
            let bandwidth = parse_u64(&attrs, "BANDWIDTH");
            let resolution = parse_resolution(&attrs);
            let frame_rate = attrs.get("FRAME-RATE").and_then(|v| v.parse::<f64>().ok());
            let codecs = attrs.get("CODECS").cloned();
            let audio_group_ref = attrs.get("AUDIO").cloned();

            // The next non-comment, non-blank line is the variant URL.
            let mut variant_url = None;
            while let Some(peeked) = lines.peek() {
                let peeked = peeked.trim();
                if peeked.is_empty() || peeked.starts_with('#') {
                    lines.next();
                    continue;
                }
                variant_url = Some(peeked.to_string());
                lines.next();
                break;
            }
            let Some(url) = variant_url else {
                warn!("#EXT-X-STREAM-INF with no following variant URI, skipping");
                continue;
            };

            variants.push(HlsVariant {
                url: resolve(manifest_url, &url),
                bandwidth,
                resolution,
                codecs,
                frame_rate,
                audio_group_ref,
            });
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attribute_list(rest);
            let method = attrs.get("METHOD").cloned().unwrap_or_else(|| "NONE".to_string());
            if is_drm_method(&method, attrs.get("KEYFORMAT").map(String::as_str)) {
                is_drm = true;
            }
        }
    }

    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

    Ok(HlsPlaylist::Master {
        variants,
        audio_groups,
        is_drm,
    })
}

fn parse_media(body: &str, manifest_url: &str) -> Result<HlsPlaylist, ManifestError> {
    let mut target_duration = 0.0;
    let mut segments = Vec::new();
    let mut total_duration = 0.0;
    let mut is_drm = false;
    let mut current_key: Option<KeyDescriptor> = None;
    let mut pending_duration: Option<f64> = None;

    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = rest.trim().parse().unwrap_or(0.0);
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attribute_list(rest);
            let method = attrs.get("METHOD").cloned().unwrap_or_else(|| "NONE".to_string());
            let keyformat = attrs.get("KEYFORMAT").cloned();
            if is_drm_method(&method, keyformat.as_deref()) {
                is_drm = true;
            }
            current_key = Some(KeyDescriptor {
                method,
                uri: attrs.get("URI").map(|u| resolve(manifest_url, u)),
                keyformat,
            });
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration_part = rest.split(',').next().unwrap_or("0");
            pending_duration = Some(duration_part.trim().parse().unwrap_or(0.0));
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let duration = pending_duration.take().unwrap_or(0.0);
        total_duration += duration;
        segments.push(HlsSegment {
            uri: resolve(manifest_url, line),
            duration,
            byte_range: None,
            key: current_key.clone(),
        });
    }

    Ok(HlsPlaylist::Media {
        target_duration,
        segments,
        total_duration,
        is_drm,
        last_key: current_key,
    })
}

/// Builds the audio track list a scheduler would present to the user for a
/// given group, deduplicated by label (spec §3/§4.1 label rule reused for
/// bitrate-less audio renditions: label is simply the rendition name).
pub fn audio_tracks_for_group(groups: &HashMap<String, Vec<HlsAudioRendition>>, group: &str) -> Vec<AudioTrack> {
    groups
        .get(group)
        .map(|renditions| {
            renditions
                .iter()
                .map(|r| AudioTrack::new(r.language.clone(), None, r.name.clone()))
                .collect()
        })
        .unwrap_or_default()
}

pub fn label_for_variant(variant: &HlsVariant) -> String {
    let height = variant.resolution.map(|(_, h)| h);
    label_for(height, Some(variant.bandwidth))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n\
hi.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360\n\
lo.m3u8\n";

    #[test]
    fn master_parse_sorts_descending_and_labels() {
        let parsed = parse(MASTER, "https://cdn.example.com/master.m3u8").unwrap();
        let HlsPlaylist::Master { variants, is_drm, .. } = parsed else {
            panic!("expected master playlist");
        };
        assert!(!is_drm);
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].bandwidth, 5_000_000);
        assert_eq!(variants[1].bandwidth, 1_000_000);
        assert_eq!(label_for_variant(&variants[0]), "1080p");
        assert_eq!(label_for_variant(&variants[1]), "360p");
    }

    #[test]
    fn aes_128_is_not_drm() {
        let media = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\n#EXTINF:10,\nseg0.ts\n";
        let parsed = parse(media, "https://cdn.example.com/media.m3u8").unwrap();
        assert!(!parsed.is_drm());
    }

    #[test]
    fn sample_aes_is_drm() {
        let master = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000\n\
v.m3u8\n\
#EXT-X-KEY:METHOD=SAMPLE-AES,KEYFORMAT=\"com.apple.streamingkeydelivery\"\n";
        let parsed = parse(master, "https://cdn.example.com/master.m3u8").unwrap();
        assert!(parsed.is_drm());
    }

    #[test]
    fn rejects_missing_header() {
        let err = parse("not a playlist\n", "https://cdn.example.com/x.m3u8").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));
    }

    #[test]
    fn attribute_list_respects_quoted_commas() {
        let attrs = parse_attribute_list(r#"CODECS="avc1.4d401f,mp4a.40.2",BANDWIDTH=1000"#);
        assert_eq!(attrs.get("CODECS").unwrap(), "avc1.4d401f,mp4a.40.2");
        assert_eq!(attrs.get("BANDWIDTH").unwrap(), "1000");
    }
}
