//! Segment addressing: turns a representation into the ordered list of
//! requests needed to play it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::{
    ByteRange, ManifestDocument, ManifestError, MediaPlaylist, Representation, Result,
    SegmentAddressing, SegmentKey, SegmentList, SegmentTemplate, SingleSegment,
};

/// One download needed to play a representation.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Segment number, or media sequence for HLS
    pub number: u64,
    /// Start on the presentation timeline
    pub start: Duration,
    pub duration: Duration,
    /// Initialization data rather than media
    pub init: bool,
    pub key: Option<SegmentKey>,
    pub discontinuity: bool,
}

impl SegmentRequest {
    fn media(url: Url, number: u64, start: Duration, duration: Duration) -> Self {
        Self {
            url,
            byte_range: None,
            number,
            start,
            duration,
            init: false,
            key: None,
            discontinuity: false,
        }
    }

    fn initialization(url: Url, byte_range: Option<ByteRange>, start: Duration) -> Self {
        Self {
            url,
            byte_range,
            number: 0,
            start,
            duration: Duration::ZERO,
            init: true,
            key: None,
            discontinuity: false,
        }
    }

    /// End on the presentation timeline.
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

fn ticks_to_duration(ticks: u64, timescale: u64) -> Duration {
    let nanos = ticks as u128 * 1_000_000_000 / timescale.max(1) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

fn duration_to_ticks(duration: Duration, timescale: u64) -> u64 {
    let ticks = duration.as_nanos() * timescale as u128 / 1_000_000_000;
    ticks.min(u64::MAX as u128) as u64
}

/// Time window in which segments may be requested, in timescale ticks
/// relative to the period's presentation time offset.
#[derive(Debug, Clone, Copy)]
struct Window {
    /// Segments must end at or before this point
    end: Option<u64>,
    /// Segments must end after this point
    start: u64,
}

impl ManifestDocument {
    /// Segment requests of `representation` in period `period_index`.
    ///
    /// Static documents list the whole period. Dynamic documents list what
    /// is available at `now`, bounded by the time shift buffer, with the
    /// live edge derived from the availability start time. Initialization
    /// requests come first.
    pub fn segments(
        &self,
        period_index: usize,
        representation: &Representation,
        now: DateTime<Utc>,
    ) -> Result<Vec<SegmentRequest>> {
        let period = self
            .periods
            .get(period_index)
            .ok_or_else(|| ManifestError::Addressing(format!("no period {period_index}")))?;
        let period_duration = self.period_duration(period_index);

        match &representation.addressing {
            SegmentAddressing::Template(template) => {
                let window = self.window(template.timescale, self.elapsed_in_period(period.start, now)?);
                expand_template(template, representation, period.start, period_duration, window)
            }
            SegmentAddressing::List(list) => expand_list(list, representation, period.start, period_duration),
            SegmentAddressing::Single(single) => Ok(expand_single(single, period.start, period_duration)),
            SegmentAddressing::Playlist(playlist) => Ok(expand_playlist(playlist, period.start)),
            SegmentAddressing::PlaylistRef(url) => Err(ManifestError::Addressing(format!(
                "media playlist {url} has not been loaded"
            ))),
        }
    }

    /// Time since the period became available, for dynamic documents.
    fn elapsed_in_period(&self, period_start: Duration, now: DateTime<Utc>) -> Result<Option<Duration>> {
        if !self.dynamic {
            return Ok(None);
        }
        let available = self.availability_start_time.ok_or_else(|| {
            ManifestError::Addressing("dynamic document without availabilityStartTime".to_string())
        })?;
        let elapsed = (now - available).to_std().unwrap_or_default();
        Ok(Some(elapsed.saturating_sub(period_start)))
    }

    fn window(&self, timescale: u64, elapsed: Option<Duration>) -> Window {
        match elapsed {
            Some(elapsed) => {
                let end = duration_to_ticks(elapsed, timescale);
                let start = self
                    .time_shift_buffer_depth
                    .map(|depth| end.saturating_sub(duration_to_ticks(depth, timescale)))
                    .unwrap_or(0);
                Window { end: Some(end), start }
            }
            None => Window { end: None, start: 0 },
        }
    }
}

fn expand_template(
    template: &SegmentTemplate,
    rep: &Representation,
    period_start: Duration,
    period_duration: Option<Duration>,
    window: Window,
) -> Result<Vec<SegmentRequest>> {
    let media = template
        .media
        .as_deref()
        .ok_or_else(|| ManifestError::Addressing(format!("representation {} has no media template", rep.id)))?;
    let timescale = template.timescale.max(1);
    let pto = template.presentation_time_offset;
    let period_ticks = period_duration.map(|d| duration_to_ticks(d, timescale));

    // (index, time relative to the offset, duration) of every addressable segment
    let mut slots: Vec<(u64, u64, u64)> = Vec::new();
    if !template.timeline.is_empty() {
        let mut time = pto;
        let mut index = 0u64;
        for (i, entry) in template.timeline.iter().enumerate() {
            if let Some(t) = entry.t {
                time = t;
            }
            if entry.d == 0 {
                return Err(ManifestError::Addressing("zero SegmentTimeline duration".to_string()));
            }
            let repeats = if entry.r >= 0 {
                entry.r as u64 + 1
            } else {
                // Repeat until the next entry, the period end or the live edge
                let limit = template
                    .timeline
                    .get(i + 1)
                    .and_then(|next| next.t)
                    .or_else(|| period_ticks.map(|p| pto + p))
                    .or_else(|| window.end.map(|e| pto + e))
                    .ok_or_else(|| ManifestError::Addressing("open-ended SegmentTimeline repeat".to_string()))?;
                limit.saturating_sub(time).div_ceil(entry.d)
            };
            for _ in 0..repeats {
                slots.push((index, time.saturating_sub(pto), entry.d));
                time += entry.d;
                index += 1;
            }
        }
    } else {
        let d = template.duration.filter(|d| *d > 0).ok_or_else(|| {
            ManifestError::Addressing(format!("representation {} has neither duration nor timeline", rep.id))
        })?;
        let count = match (window.end, period_ticks) {
            (Some(end), Some(period)) => (end / d).min(period.div_ceil(d)),
            (Some(end), None) => end / d,
            (None, Some(period)) => period.div_ceil(d),
            (None, None) => {
                return Err(ManifestError::Addressing(
                    "static template without a known period duration".to_string(),
                ));
            }
        };
        slots.extend((0..count).map(|i| (i, i * d, d)));
    }

    let mut requests = Vec::new();
    if let Some(init) = &template.initialization {
        let path = fill_template(init, rep, None, None)?;
        requests.push(SegmentRequest::initialization(join(&rep.base_url, &path)?, None, period_start));
    }
    for (index, offset, duration) in slots {
        let end = offset + duration;
        if window.end.is_some_and(|edge| end > edge) || (window.end.is_some() && end <= window.start) {
            continue;
        }
        let number = template.start_number + index;
        let path = fill_template(media, rep, Some(number), Some(offset + pto))?;
        requests.push(SegmentRequest::media(
            join(&rep.base_url, &path)?,
            number,
            period_start + ticks_to_duration(offset, timescale),
            ticks_to_duration(duration, timescale),
        ));
    }
    Ok(requests)
}

fn expand_list(
    list: &SegmentList,
    rep: &Representation,
    period_start: Duration,
    period_duration: Option<Duration>,
) -> Result<Vec<SegmentRequest>> {
    let mut requests = Vec::new();
    if let Some(init) = &list.initialization {
        let url = match &init.url {
            Some(path) => join(&rep.base_url, path)?,
            None => rep.base_url.clone(),
        };
        requests.push(SegmentRequest::initialization(url, init.range, period_start));
    }

    let segment_duration = match list.duration {
        Some(d) => ticks_to_duration(d, list.timescale),
        None if list.segments.len() == 1 => period_duration.unwrap_or_default(),
        None => Duration::ZERO,
    };
    for (i, segment) in list.segments.iter().enumerate() {
        let url = match &segment.url {
            Some(path) => join(&rep.base_url, path)?,
            None => rep.base_url.clone(),
        };
        let mut request = SegmentRequest::media(
            url,
            list.start_number + i as u64,
            period_start + segment_duration * i as u32,
            segment_duration,
        );
        request.byte_range = segment.range;
        requests.push(request);
    }
    Ok(requests)
}

fn expand_single(single: &SingleSegment, period_start: Duration, period_duration: Option<Duration>) -> Vec<SegmentRequest> {
    // The resource starts with its own initialization data
    vec![SegmentRequest::media(
        single.url.clone(),
        1,
        period_start,
        period_duration.unwrap_or_default(),
    )]
}

fn expand_playlist(playlist: &MediaPlaylist, period_start: Duration) -> Vec<SegmentRequest> {
    let mut requests = Vec::with_capacity(playlist.segments.len());
    let mut current_init = None;
    let mut start = period_start;
    for (i, segment) in playlist.segments.iter().enumerate() {
        if segment.init.is_some() && segment.init != current_init {
            if let Some(init) = &segment.init {
                requests.push(SegmentRequest::initialization(init.url.clone(), init.byte_range, start));
            }
            current_init = segment.init.clone();
        }
        requests.push(SegmentRequest {
            url: segment.url.clone(),
            byte_range: segment.byte_range,
            number: playlist.media_sequence + i as u64,
            start,
            duration: segment.duration,
            init: false,
            key: segment.key.clone(),
            discontinuity: segment.discontinuity,
        });
        start += segment.duration;
    }
    requests
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path).map_err(|e| ManifestError::invalid_url(path, e))
}

/// Substitutes `$RepresentationID$`, `$Number$`, `$Time$`, `$Bandwidth$`
/// (with optional `%0Nd` width) and `$$` in a segment template.
pub fn fill_template(template: &str, rep: &Representation, number: Option<u64>, time: Option<u64>) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('$') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('$')
            .ok_or_else(|| ManifestError::Addressing(format!("unterminated identifier in {template}")))?;
        let identifier = &after[..close];
        rest = &after[close + 1..];

        if identifier.is_empty() {
            out.push('$');
            continue;
        }
        let (name, format) = match identifier.split_once('%') {
            Some((name, format)) => (name, Some(format)),
            None => (identifier, None),
        };
        if name == "RepresentationID" {
            out.push_str(&rep.id);
            continue;
        }
        let value = match name {
            "Number" => number,
            "Time" => time,
            "Bandwidth" => Some(rep.bandwidth),
            _ => {
                return Err(ManifestError::Addressing(format!(
                    "unknown identifier ${identifier}$ in {template}"
                )));
            }
        }
        .ok_or_else(|| ManifestError::Addressing(format!("${name}$ is not available in {template}")))?;

        let width = match format {
            Some(format) => {
                let digits = format.trim_start_matches('0').trim_end_matches('d');
                if digits.is_empty() {
                    0
                } else {
                    digits.parse::<usize>().map_err(|_| {
                        ManifestError::Addressing(format!("invalid width %{format} in {template}"))
                    })?
                }
            }
            None => 0,
        };
        out.push_str(&format!("{value:0width$}"));
    }
    out.push_str(rest);
    Ok(out)
}
