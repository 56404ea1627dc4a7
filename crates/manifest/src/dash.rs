//! MPEG-DASH MPD parser.
//!
//! The XML is first read into a small element tree and then mapped onto the
//! document model. `BaseURL`, `SegmentTemplate`, `SegmentList`,
//! `SegmentBase` and the common representation attributes are inherited
//! from MPD to Period to AdaptationSet to Representation.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use media_packet::KeyId;
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    AdaptationSet, ByteRange, ContentProtection, ContentType, ManifestDocument, ManifestError,
    ManifestFormat, ManifestParser, Period, Representation, Result, SegmentAddressing, SegmentList,
    SegmentTemplate, SegmentUrl, SingleSegment, TimelineEntry,
};

/// Parser for MPEG-DASH media presentation descriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DashParser;

impl ManifestParser for DashParser {
    fn format(&self) -> ManifestFormat {
        ManifestFormat::Dash
    }

    fn parse(&self, content: &str, url: &Url) -> Result<ManifestDocument> {
        let mpd = parse_tree(content)?;
        let mut doc = ManifestDocument::new(url.clone(), ManifestFormat::Dash);

        doc.dynamic = mpd.attr("type") == Some("dynamic");
        doc.minimum_update_period = mpd.duration_attr("minimumUpdatePeriod")?;
        doc.media_presentation_duration = mpd.duration_attr("mediaPresentationDuration")?;
        doc.time_shift_buffer_depth = mpd.duration_attr("timeShiftBufferDepth")?;
        doc.suggested_presentation_delay = mpd.duration_attr("suggestedPresentationDelay")?;
        doc.availability_start_time = mpd
            .attr("availabilityStartTime")
            .map(parse_date_time)
            .transpose()?;

        let root = Scope::root(url.clone()).descend(&mpd)?;
        let mut next_start = Duration::ZERO;
        for (index, period_el) in mpd.children_named("Period").enumerate() {
            let start = period_el.duration_attr("start")?.unwrap_or(next_start);
            let duration = period_el.duration_attr("duration")?;
            let scope = root.descend(period_el)?;

            let mut adaptation_sets = Vec::new();
            for set_el in period_el.children_named("AdaptationSet") {
                adaptation_sets.push(parse_adaptation_set(set_el, &scope)?);
            }
            debug!(
                period = index,
                start = ?start,
                sets = adaptation_sets.len(),
                "Parsed DASH period"
            );

            doc.periods.push(Period {
                id: period_el.attr("id").map(str::to_string),
                start,
                duration,
                adaptation_sets,
            });
            next_start = start + duration.unwrap_or_default();
        }

        if doc.periods.is_empty() {
            return Err(ManifestError::Parse("MPD has no Period".to_string()));
        }
        Ok(doc)
    }
}

fn parse_adaptation_set(el: &Element, parent: &Scope) -> Result<AdaptationSet> {
    let scope = parent.descend(el)?;

    let mut content_protections = Vec::new();
    for cp in el.children_named("ContentProtection") {
        content_protections.push(parse_content_protection(cp)?);
    }

    let mut representations = Vec::new();
    for rep_el in el.children_named("Representation") {
        let rep_scope = scope.descend(rep_el)?;
        let Some(id) = rep_el.attr("id") else {
            warn!("Skipping Representation without id");
            continue;
        };
        let bandwidth = rep_el.number_attr::<u64>("bandwidth")?.unwrap_or(0);
        representations.push(Representation {
            id: id.to_string(),
            bandwidth,
            codecs: rep_scope.codecs.clone(),
            mime_type: rep_scope.mime_type.clone(),
            width: rep_scope.width,
            height: rep_scope.height,
            frame_rate: rep_scope.frame_rate,
            audio_sampling_rate: rep_scope.audio_sampling_rate,
            base_url: rep_scope.base_url.clone(),
            addressing: rep_scope.addressing(),
        });
        // Representation level protections apply to the whole set here.
        for cp in rep_el.children_named("ContentProtection") {
            content_protections.push(parse_content_protection(cp)?);
        }
    }

    let content_type = el
        .attr("contentType")
        .map(ContentType::infer)
        .filter(|t| *t != ContentType::Unknown)
        .or_else(|| scope.mime_type.as_deref().map(ContentType::infer))
        .filter(|t| *t != ContentType::Unknown)
        .or_else(|| {
            representations
                .iter()
                .flat_map(|r| [r.mime_type.as_deref(), r.codecs.as_deref()])
                .flatten()
                .map(ContentType::infer)
                .find(|t| *t != ContentType::Unknown)
        })
        .or_else(|| {
            el.child("ContentComponent")
                .and_then(|c| c.attr("contentType"))
                .map(ContentType::infer)
        })
        .unwrap_or(ContentType::Unknown);

    Ok(AdaptationSet {
        id: el.attr("id").map(str::to_string),
        content_type,
        mime_type: scope.mime_type.clone(),
        language: el.attr("lang").map(str::to_string),
        content_protections,
        representations,
    })
}

fn parse_content_protection(el: &Element) -> Result<ContentProtection> {
    let default_kid = match el.attr("default_KID") {
        Some(kid) => Some(
            KeyId::parse(kid).map_err(|e| ManifestError::Parse(format!("default_KID {kid}: {e}")))?,
        ),
        None => None,
    };
    let pssh = match el.child("pssh").map(|p| p.text.trim()).filter(|t| !t.is_empty()) {
        Some(text) => Some(Bytes::from(
            STANDARD
                .decode(text)
                .map_err(|e| ManifestError::Parse(format!("pssh: {e}")))?,
        )),
        None => None,
    };
    Ok(ContentProtection {
        scheme_id_uri: el.attr("schemeIdUri").unwrap_or_default().to_string(),
        value: el.attr("value").map(str::to_string),
        default_kid,
        pssh,
    })
}

/// Attributes and addressing in effect at one level of the hierarchy.
#[derive(Debug, Clone)]
struct Scope {
    base_url: Url,
    template: Option<SegmentTemplate>,
    list: Option<SegmentList>,
    index_range: Option<ByteRange>,
    codecs: Option<String>,
    mime_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<f64>,
    audio_sampling_rate: Option<u32>,
}

impl Scope {
    fn root(base_url: Url) -> Self {
        Self {
            base_url,
            template: None,
            list: None,
            index_range: None,
            codecs: None,
            mime_type: None,
            width: None,
            height: None,
            frame_rate: None,
            audio_sampling_rate: None,
        }
    }

    fn descend(&self, el: &Element) -> Result<Scope> {
        let mut scope = self.clone();
        if let Some(base) = el.child("BaseURL").map(|b| b.text.trim()).filter(|t| !t.is_empty()) {
            scope.base_url = self
                .base_url
                .join(base)
                .map_err(|e| ManifestError::invalid_url(base, e))?;
        }
        if let Some(template) = el.child("SegmentTemplate") {
            scope.template = Some(apply_template(self.template.as_ref(), template)?);
        }
        if let Some(list) = el.child("SegmentList") {
            scope.list = Some(apply_list(self.list.as_ref(), list)?);
        }
        if let Some(base) = el.child("SegmentBase") {
            if let Some(range) = base.child("Initialization").and_then(|i| i.attr("range")) {
                scope.index_range = ByteRange::parse(range);
            }
        }
        if let Some(codecs) = el.attr("codecs") {
            scope.codecs = Some(codecs.to_string());
        }
        if let Some(mime) = el.attr("mimeType") {
            scope.mime_type = Some(mime.to_string());
        }
        if let Some(width) = el.number_attr("width")? {
            scope.width = Some(width);
        }
        if let Some(height) = el.number_attr("height")? {
            scope.height = Some(height);
        }
        if let Some(rate) = el.attr("frameRate") {
            scope.frame_rate = parse_frame_rate(rate);
        }
        if let Some(rate) = el.number_attr("audioSamplingRate")? {
            scope.audio_sampling_rate = Some(rate);
        }
        Ok(scope)
    }

    fn addressing(&self) -> SegmentAddressing {
        if let Some(template) = &self.template {
            SegmentAddressing::Template(template.clone())
        } else if let Some(list) = &self.list {
            SegmentAddressing::List(list.clone())
        } else {
            SegmentAddressing::Single(SingleSegment {
                url: self.base_url.clone(),
                initialization: self.index_range,
            })
        }
    }
}

fn apply_template(parent: Option<&SegmentTemplate>, el: &Element) -> Result<SegmentTemplate> {
    let mut template = parent.cloned().unwrap_or_default();
    if let Some(init) = el.attr("initialization") {
        template.initialization = Some(init.to_string());
    }
    if let Some(media) = el.attr("media") {
        template.media = Some(media.to_string());
    }
    if let Some(start) = el.number_attr("startNumber")? {
        template.start_number = start;
    }
    if let Some(timescale) = el.number_attr::<u64>("timescale")? {
        template.timescale = timescale.max(1);
    }
    if let Some(duration) = el.number_attr("duration")? {
        template.duration = Some(duration);
    }
    if let Some(offset) = el.number_attr("presentationTimeOffset")? {
        template.presentation_time_offset = offset;
    }
    if let Some(timeline) = el.child("SegmentTimeline") {
        template.timeline = parse_timeline(timeline)?;
    }
    Ok(template)
}

fn apply_list(parent: Option<&SegmentList>, el: &Element) -> Result<SegmentList> {
    let mut list = parent.cloned().unwrap_or(SegmentList {
        initialization: None,
        timescale: 1,
        duration: None,
        start_number: 1,
        segments: Vec::new(),
    });
    if let Some(timescale) = el.number_attr::<u64>("timescale")? {
        list.timescale = timescale.max(1);
    }
    if let Some(duration) = el.number_attr("duration")? {
        list.duration = Some(duration);
    }
    if let Some(start) = el.number_attr("startNumber")? {
        list.start_number = start;
    }
    if let Some(init) = el.child("Initialization") {
        list.initialization = Some(SegmentUrl {
            url: init.attr("sourceURL").map(str::to_string),
            range: init.attr("range").and_then(ByteRange::parse),
        });
    }
    let segments: Vec<SegmentUrl> = el
        .children_named("SegmentURL")
        .map(|s| SegmentUrl {
            url: s.attr("media").map(str::to_string),
            range: s.attr("mediaRange").and_then(ByteRange::parse),
        })
        .collect();
    if !segments.is_empty() {
        list.segments = segments;
    }
    Ok(list)
}

fn parse_timeline(el: &Element) -> Result<Vec<TimelineEntry>> {
    el.children_named("S")
        .map(|s| -> Result<TimelineEntry> {
            Ok(TimelineEntry {
                t: s.number_attr("t")?,
                d: s
                    .number_attr("d")?
                    .ok_or_else(|| ManifestError::Parse("SegmentTimeline S without d".to_string()))?,
                r: s.number_attr("r")?.unwrap_or(0),
            })
        })
        .collect()
}

fn parse_frame_rate(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => value.trim().parse().ok(),
    }
}

/// Parses an ISO-8601 duration such as `PT1M30.5S`.
fn parse_duration(value: &str) -> Result<Duration> {
    iso8601_duration::Duration::parse(value.trim())
        .ok()
        .and_then(|d| d.to_std())
        .ok_or_else(|| ManifestError::Parse(format!("invalid duration {value}")))
}

fn parse_date_time(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(time) = value.parse::<DateTime<Utc>>() {
        return Ok(time);
    }
    // Some packagers omit the zone designator
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ManifestError::Parse(format!("invalid date {value}: {e}")))
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Element> {
        let mut element = Element {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            ..Default::default()
        };
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            element.attrs.push((key, value));
        }
        Ok(element)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn number_attr<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.attr(name) {
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ManifestError::Parse(format!("{}@{name}: invalid number {value}", self.name))),
            None => Ok(None),
        }
    }

    fn duration_attr(&self, name: &str) -> Result<Option<Duration>> {
        self.attr(name).map(parse_duration).transpose()
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Reads the document into an element tree and returns the `MPD` element.
fn parse_tree(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack = vec![Element::default()];
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => stack.push(Element::from_start(&e)?),
            Event::Empty(e) => {
                let element = Element::from_start(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err(ManifestError::Parse("unbalanced closing tag".to_string()));
                }
                if let Some(element) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(element);
                    }
                }
            }
            Event::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(ManifestError::Parse("unexpected end of document".to_string()));
    }
    stack
        .pop()
        .and_then(|root| root.children.into_iter().find(|e| e.name == "MPD"))
        .ok_or_else(|| ManifestError::Parse("no MPD element".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_packet::SystemId;

    const VOD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013"
     type="static" mediaPresentationDuration="PT1M0.5S" minBufferTime="PT2S">
  <BaseURL>media/</BaseURL>
  <Period id="p0">
    <AdaptationSet id="1" mimeType="video/mp4" codecs="avc1.64001f" frameRate="30000/1001">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"
                         cenc:default_KID="11111111-1111-1111-1111-111111111111"/>
      <ContentProtection schemeIdUri="urn:uuid:1077efec-c0b2-4d02-ace3-3c1e52e2fb4b">
        <cenc:pssh>AAAAIHBzc2gAAAAAEHfv7MCyTQKs4zweUuL7SwAAAAA=</cenc:pssh>
      </ContentProtection>
      <SegmentTemplate timescale="90000" duration="180000"
                       initialization="$RepresentationID$/init.mp4"
                       media="$RepresentationID$/seg-$Number%05d$.m4s"/>
      <Representation id="v720" bandwidth="3000000" width="1280" height="720"/>
      <Representation id="v360" bandwidth="800000" width="640" height="360">
        <BaseURL>low/</BaseURL>
      </Representation>
    </AdaptationSet>
    <AdaptationSet id="2" contentType="audio" lang="en">
      <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2" audioSamplingRate="48000">
        <SegmentList timescale="1000" duration="4000">
          <Initialization sourceURL="audio/init.mp4"/>
          <SegmentURL media="audio/1.m4s"/>
          <SegmentURL media="audio/2.m4s" mediaRange="0-999"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
    <AdaptationSet id="3" mimeType="text/vtt">
      <Representation id="sub" bandwidth="100">
        <BaseURL>subs/en.vtt</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_parse_static_mpd() {
        let url = Url::parse("http://cdn.test/vod/manifest.mpd").unwrap();
        let doc = DashParser.parse(VOD, &url).unwrap();

        assert!(!doc.dynamic);
        assert_eq!(doc.media_presentation_duration, Some(Duration::from_millis(60_500)));
        assert_eq!(doc.periods.len(), 1);
        let period = &doc.periods[0];
        assert_eq!(period.id.as_deref(), Some("p0"));
        assert_eq!(period.adaptation_sets.len(), 3);

        let video = &period.adaptation_sets[0];
        assert_eq!(video.content_type, ContentType::Video);
        assert_eq!(video.representations.len(), 2);
        let high = &video.representations[0];
        assert_eq!(high.bandwidth, 3_000_000);
        assert_eq!(high.width, Some(1280));
        assert_eq!(high.codecs.as_deref(), Some("avc1.64001f"));
        assert!((high.frame_rate.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(high.base_url.as_str(), "http://cdn.test/vod/media/");
        let SegmentAddressing::Template(template) = &high.addressing else {
            panic!("expected template addressing");
        };
        assert_eq!(template.timescale, 90000);
        assert_eq!(template.duration, Some(180000));
        assert_eq!(template.start_number, 1);
        assert_eq!(video.representations[1].base_url.as_str(), "http://cdn.test/vod/media/low/");

        let audio = &period.adaptation_sets[1];
        assert_eq!(audio.content_type, ContentType::Audio);
        assert_eq!(audio.language.as_deref(), Some("en"));
        let SegmentAddressing::List(list) = &audio.representations[0].addressing else {
            panic!("expected list addressing");
        };
        assert_eq!(list.segments.len(), 2);
        assert_eq!(list.segments[1].range, Some(ByteRange { start: 0, end: 999 }));
        assert_eq!(audio.representations[0].audio_sampling_rate, Some(48000));

        let text = &period.adaptation_sets[2];
        assert_eq!(text.content_type, ContentType::Text);
        let SegmentAddressing::Single(single) = &text.representations[0].addressing else {
            panic!("expected single addressing");
        };
        assert_eq!(single.url.as_str(), "http://cdn.test/vod/media/subs/en.vtt");
    }

    #[test]
    fn test_content_protection() {
        let url = Url::parse("http://cdn.test/vod/manifest.mpd").unwrap();
        let doc = DashParser.parse(VOD, &url).unwrap();
        let protections: Vec<_> = doc.content_protections().collect();
        assert_eq!(protections.len(), 2);
        assert!(protections[0].is_mp4_protection());
        assert_eq!(protections[0].default_kid, Some(KeyId([0x11; 16])));
        assert_eq!(protections[1].system_id(), Some(SystemId::COMMON));
        assert_eq!(protections[1].pssh.as_ref().map(|p| p.len()), Some(32));
    }

    #[test]
    fn test_parse_dynamic_mpd_with_timeline() {
        let mpd = r#"<MPD type="dynamic" availabilityStartTime="2024-01-01T00:00:00Z"
                 minimumUpdatePeriod="PT2S" timeShiftBufferDepth="PT30S">
          <Period start="PT0S">
            <AdaptationSet mimeType="video/mp4">
              <SegmentTemplate timescale="1000" media="v_$Time$.m4s" presentationTimeOffset="500">
                <SegmentTimeline>
                  <S t="500" d="2000" r="2"/>
                  <S d="1000"/>
                </SegmentTimeline>
              </SegmentTemplate>
              <Representation id="v" bandwidth="1000"/>
            </AdaptationSet>
          </Period>
        </MPD>"#;
        let url = Url::parse("http://live.test/channel/manifest.mpd").unwrap();
        let doc = DashParser.parse(mpd, &url).unwrap();
        assert!(doc.dynamic);
        assert_eq!(doc.minimum_update_period, Some(Duration::from_secs(2)));
        assert_eq!(doc.time_shift_buffer_depth, Some(Duration::from_secs(30)));
        assert_eq!(
            doc.availability_start_time,
            Some("2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );

        let rep = &doc.periods[0].adaptation_sets[0].representations[0];
        let SegmentAddressing::Template(template) = &rep.addressing else {
            panic!("expected template addressing");
        };
        assert_eq!(template.presentation_time_offset, 500);
        assert_eq!(
            template.timeline,
            vec![
                TimelineEntry { t: Some(500), d: 2000, r: 2 },
                TimelineEntry { t: None, d: 1000, r: 0 },
            ]
        );
    }

    #[test]
    fn test_period_starts_chain() {
        let mpd = r#"<MPD type="static">
          <Period duration="PT10S"/>
          <Period duration="PT5S"/>
        </MPD>"#;
        let url = Url::parse("http://cdn.test/a.mpd").unwrap();
        let doc = DashParser.parse(mpd, &url).unwrap();
        assert_eq!(doc.periods[1].start, Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_malformed_documents() {
        let url = Url::parse("http://cdn.test/a.mpd").unwrap();
        assert!(DashParser.parse("<MPD><Period></MPD>", &url).is_err());
        assert!(DashParser.parse("<Other/>", &url).is_err());
        assert!(DashParser.parse("<MPD/>", &url).is_err());
        assert!(DashParser.parse(r#"<MPD mediaPresentationDuration="soon"><Period/></MPD>"#, &url).is_err());
    }
}
