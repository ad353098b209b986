//! DASH (MPD XML) manifest parser (spec §4.2).
//!
//! Deserializes the XML tree with `quick_xml`/`serde` into a raw wire model,
//! then maps that into the typed domain model and materializes segment
//! plans. serde ignores unknown XML attributes/elements, so the wire
//! structs below only need the fields this engine actually consumes.
//!
//! Wire struct fields mirror the MPD schema's attribute names verbatim so
//! quick_xml's serde support maps them without rename boilerplate.
#![allow(non_snake_case)]

use std::collections::HashMap;

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::ManifestError;

use super::common::{expand_template, resolve, TemplateVars};

const WIDEVINE_UUID: &str = "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";
const PLAYREADY_UUID: &str = "urn:uuid:9a04f079-9840-4286-ab92-e65be0885f95";
const FAIRPLAY_UUID: &str = "urn:uuid:94ce86fb-07ff-4f43-adb8-93d2fa968ca2";

#[derive(Debug, Deserialize, Clone)]
struct S {
    t: Option<i64>,
    d: i64,
    r: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct SegmentTimeline {
    #[serde(rename = "S", default)]
    segments: Vec<S>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireInitialization {
    sourceURL: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireSegmentTemplate {
    initialization: Option<String>,
    media: Option<String>,
    #[serde(rename = "SegmentTimeline")]
    timeline: Option<SegmentTimeline>,
    startNumber: Option<u64>,
    duration: Option<f64>,
    timescale: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireSegmentUrl {
    media: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireSegmentList {
    #[serde(rename = "Initialization")]
    initialization: Option<WireInitialization>,
    #[serde(rename = "SegmentURL", default)]
    segment_urls: Vec<WireSegmentUrl>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireBaseUrl {
    #[serde(rename = "$value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireContentProtection {
    schemeIdUri: Option<String>,
    pssh: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireRepresentation {
    id: Option<String>,
    bandwidth: Option<u64>,
    width: Option<u64>,
    height: Option<u64>,
    frameRate: Option<String>,
    codecs: Option<String>,
    mimeType: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<WireBaseUrl>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<WireSegmentTemplate>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<WireSegmentList>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireAdaptationSet {
    contentType: Option<String>,
    mimeType: Option<String>,
    lang: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<WireSegmentTemplate>,
    #[serde(rename = "ContentProtection", default)]
    content_protection: Vec<WireContentProtection>,
    #[serde(rename = "Representation", default)]
    representations: Vec<WireRepresentation>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WirePeriod {
    #[serde(rename = "BaseURL")]
    base_url: Option<WireBaseUrl>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<WireAdaptationSet>,
}

#[derive(Debug, Deserialize, Clone)]
struct WireMpd {
    #[serde(rename = "type")]
    mpd_type: Option<String>,
    mediaPresentationDuration: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<WireBaseUrl>,
    #[serde(rename = "Period", default)]
    periods: Vec<WirePeriod>,
}

/// Parses `PT#H#M#S` into seconds. Returns `None` if not ISO-8601-shaped.
fn parse_iso8601_duration(raw: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^PT(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?$").unwrap()
    });
    let caps = re.captures(raw.trim())?;
    let hours: f64 = caps.get(1).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let minutes: f64 = caps.get(2).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let seconds: f64 = caps.get(3).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentType {
    Video,
    Audio,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentProtectionRecord {
    pub scheme_id_uri: String,
    pub pssh: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub frame_rate: Option<String>,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub segment_uris: Vec<String>,
    pub initialization_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    pub content_type: ContentType,
    pub language: Option<String>,
    pub representations: Vec<Representation>,
    pub content_protection: Vec<ContentProtectionRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashManifest {
    pub dynamic: bool,
    pub total_duration: Option<f64>,
    pub base_url: Option<String>,
    pub adaptation_sets: Vec<AdaptationSet>,
    pub is_drm: bool,
}

fn content_type_of(explicit: Option<&str>, mime_type: Option<&str>) -> ContentType {
    match explicit {
        Some("audio") => return ContentType::Audio,
        Some("text") => return ContentType::Text,
        Some("video") => return ContentType::Video,
        _ => {}
    }
    match mime_type.and_then(|m| m.split('/').next()) {
        Some("audio") => ContentType::Audio,
        Some("text") => ContentType::Text,
        _ => ContentType::Video,
    }
}

fn is_known_drm_scheme(scheme: &str) -> bool {
    let lower = scheme.to_ascii_lowercase();
    lower == WIDEVINE_UUID || lower == PLAYREADY_UUID || lower == FAIRPLAY_UUID
}

/// Materializes segment URIs from a `SegmentTemplate`, using the
/// adaptation-set template as a fallback when the representation has none
/// of its own (spec §4.2: "inherited ... unless overridden").
fn materialize_template(
    template: &WireSegmentTemplate,
    representation_id: &str,
    bandwidth: u64,
    base: &str,
    presentation_duration: Option<f64>,
) -> (Vec<String>, Option<String>) {
    let init_uri = template.initialization.as_ref().map(|t| {
        let vars = TemplateVars {
            representation_id,
            number: None,
            time: None,
            bandwidth: Some(bandwidth),
        };
        resolve(base, &expand_template(t, &vars))
    });

    let Some(media) = template.media.as_ref() else {
        return (Vec::new(), init_uri);
    };

    let mut uris = Vec::new();
    let start_number = template.startNumber.unwrap_or(1);

    if let Some(timeline) = &template.timeline {
        let mut number = start_number;
        let mut time: i64 = 0;
        for entry in &timeline.segments {
            if let Some(t) = entry.t {
                time = t;
            }
            let repeat = entry.r.unwrap_or(0).max(0) as u64;
            for _ in 0..=repeat {
                let vars = TemplateVars {
                    representation_id,
                    number: Some(number),
                    time: Some(time as u64),
                    bandwidth: Some(bandwidth),
                };
                uris.push(resolve(base, &expand_template(media, &vars)));
                number += 1;
                time += entry.d;
            }
        }
        return (uris, init_uri);
    }

    // No timeline: if `duration`+`timescale` are present, derive a segment
    // count from the overall presentation duration rather than giving up.
    if let (Some(duration), Some(timescale)) = (template.duration, template.timescale) {
        if duration > 0.0 && timescale > 0 {
            let segment_seconds = duration / timescale as f64;
            if let Some(total) = presentation_duration {
                let count = (total / segment_seconds).ceil().max(1.0) as u64;
                for offset in 0..count {
                    let number = start_number + offset;
                    let vars = TemplateVars {
                        representation_id,
                        number: Some(number),
                        time: None,
                        bandwidth: Some(bandwidth),
                    };
                    uris.push(resolve(base, &expand_template(media, &vars)));
                }
                return (uris, init_uri);
            }
            warn!("SegmentTemplate has duration/timescale but no presentation duration to derive a count from");
        }
    }

    (uris, init_uri)
}

fn materialize_list(list: &WireSegmentList, base: &str) -> (Vec<String>, Option<String>) {
    let uris = list
        .segment_urls
        .iter()
        .filter_map(|s| s.media.as_ref())
        .map(|m| resolve(base, m))
        .collect();
    let init = list
        .initialization
        .as_ref()
        .and_then(|i| i.sourceURL.as_ref())
        .map(|u| resolve(base, u));
    (uris, init)
}

pub fn parse(body: &str, manifest_url: &str) -> Result<DashManifest, ManifestError> {
    let mpd: WireMpd = quick_xml::de::from_str(body)
        .map_err(|e| ManifestError::invalid(format!("malformed MPD XML: {e}")))?;

    let top_base = mpd
        .base_url
        .as_ref()
        .and_then(|b| b.value.clone())
        .map(|b| resolve(manifest_url, &b))
        .unwrap_or_else(|| manifest_url.to_string());

    let total_duration = mpd
        .mediaPresentationDuration
        .as_deref()
        .and_then(parse_iso8601_duration);
    let dynamic = mpd.mpd_type.as_deref() == Some("dynamic");

    let mut adaptation_sets = Vec::new();
    let mut is_drm = false;

    for period in &mpd.periods {
        let period_base = period
            .base_url
            .as_ref()
            .and_then(|b| b.value.clone())
            .map(|b| resolve(&top_base, &b))
            .unwrap_or_else(|| top_base.clone());

        for wire_set in &period.adaptation_sets {
            let content_type = content_type_of(wire_set.contentType.as_deref(), wire_set.mimeType.as_deref());

            let content_protection: Vec<ContentProtectionRecord> = wire_set
                .content_protection
                .iter()
                .filter_map(|cp| {
                    cp.schemeIdUri.clone().map(|scheme| ContentProtectionRecord {
                        scheme_id_uri: scheme,
                        pssh: cp.pssh.clone(),
                    })
                })
                .collect();

            let set_is_drm = !content_protection.is_empty()
                || content_protection
                    .iter()
                    .any(|cp| is_known_drm_scheme(&cp.scheme_id_uri));
            if set_is_drm {
                is_drm = true;
            }

            let mut representations = Vec::new();
            for wire_rep in &wire_set.representations {
                let rep_base = wire_rep
                    .base_url
                    .as_ref()
                    .and_then(|b| b.value.clone())
                    .map(|b| resolve(&period_base, &b))
                    .unwrap_or_else(|| period_base.clone());

                let id = wire_rep.id.clone().unwrap_or_default();
                let bandwidth = wire_rep.bandwidth.unwrap_or(0);

                let (segment_uris, initialization_uri) = if let Some(list) = &wire_rep.segment_list {
                    materialize_list(list, &rep_base)
                } else if let Some(template) = wire_rep.segment_template.as_ref().or(wire_set.segment_template.as_ref()) {
                    materialize_template(template, &id, bandwidth, &rep_base, total_duration)
                } else {
                    (Vec::new(), None)
                };

                if segment_uris.is_empty() {
                    warn!(representation = %id, "DASH representation produced zero segment URIs");
                }

                representations.push(Representation {
                    id,
                    bandwidth,
                    width: wire_rep.width,
                    height: wire_rep.height,
                    frame_rate: wire_rep.frameRate.clone(),
                    codecs: wire_rep.codecs.clone(),
                    mime_type: wire_rep.mimeType.clone(),
                    segment_uris,
                    initialization_uri,
                });
            }

            match content_type {
                ContentType::Audio => representations.sort_by(|a, b| a.bandwidth.cmp(&b.bandwidth)),
                _ => representations.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth)),
            }

            adaptation_sets.push(AdaptationSet {
                content_type,
                language: wire_set.lang.clone(),
                representations,
                content_protection,
            });
        }
    }

    if mpd.periods.is_empty() {
        return Err(ManifestError::invalid("MPD has no Period elements"));
    }

    Ok(DashManifest {
        dynamic,
        total_duration,
        base_url: Some(top_base),
        adaptation_sets,
        is_drm,
    })
}

/// Groups representations by content type for caller convenience.
pub fn video_representations(manifest: &DashManifest) -> Vec<&Representation> {
    manifest
        .adaptation_sets
        .iter()
        .filter(|a| a.content_type == ContentType::Video)
        .flat_map(|a| a.representations.iter())
        .collect()
}

/// Exposed for callers that need to build a `HashMap<String, &Representation>` lookup by id.
pub fn representation_index(manifest: &DashManifest) -> HashMap<&str, &Representation> {
    manifest
        .adaptation_sets
        .iter()
        .flat_map(|a| a.representations.iter())
        .map(|r| (r.id.as_str(), r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion_with_timeline_and_width_format() {
        let template = WireSegmentTemplate {
            initialization: None,
            media: Some("v_$RepresentationID$_$Number%05d$.m4s".to_string()),
            timeline: Some(SegmentTimeline {
                segments: vec![S { t: None, d: 100, r: Some(2) }],
            }),
            start_number: Some(1),
            duration: None,
            timescale: None,
        };
        let (uris, _) = materialize_template(&template, "v1", 0, "https://cdn.example.com/", None);
        assert_eq!(
            uris,
            vec![
                "https://cdn.example.com/v_v1_00001.m4s",
                "https://cdn.example.com/v_v1_00002.m4s",
                "https://cdn.example.com/v_v1_00003.m4s",
            ]
        );
    }

    #[test]
    fn widevine_scheme_sets_drm() {
        let xml = format!(
            r#"<MPD type="static"><Period><AdaptationSet contentType="video">
                <ContentProtection schemeIdUri="{WIDEVINE_UUID}"/>
                <Representation id="v1" bandwidth="1000"/>
            </AdaptationSet></Period></MPD>"#
        );
        let manifest = parse(&xml, "https://cdn.example.com/manifest.mpd").unwrap();
        assert!(manifest.is_drm);
    }

    #[test]
    fn rejects_missing_period() {
        let err = parse("<MPD type=\"static\"></MPD>", "https://cdn.example.com/manifest.mpd").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));
    }

    #[test]
    fn parses_iso8601_duration() {
        assert_eq!(parse_iso8601_duration("PT1H2M3S"), Some(3723.0));
        assert_eq!(parse_iso8601_duration("PT30S"), Some(30.0));
        assert_eq!(parse_iso8601_duration("garbage"), None);
    }
}
