//! End to end playback through the controller with in-memory servers.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use manifest::{ManifestError, ManifestFetcher, SegmentFetcher, SegmentRequest};
use media_packet::StreamType;
use player::{
    ClipDefinition, ClipKind, LoggingSink, ManifestDataProvider, PlayerConfig, PlayerController, PlayerError,
    PlayerState,
};
use playback_common::create_test_context;
use tokio_util::sync::CancellationToken;
use ts::{Pat, PatProgram, Pmt, PmtStream, StreamType as TsStreamType, TsWriter};
use url::Url;

const VIDEO_PID: u16 = 0x100;
const AUDIO_PID: u16 = 0x101;
const FRAMES_PER_SEGMENT: u64 = 25;

/// Serves fixed bodies by URL path; anything else is a 404.
#[derive(Default)]
struct FakeServer {
    files: HashMap<String, Bytes>,
}

impl FakeServer {
    fn with(mut self, path: &str, body: impl Into<Bytes>) -> Self {
        self.files.insert(path.to_string(), body.into());
        self
    }

    fn get(&self, url: &Url) -> Result<Bytes, ManifestError> {
        self.files
            .get(url.path())
            .cloned()
            .ok_or_else(|| ManifestError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
    }
}

#[async_trait]
impl ManifestFetcher for FakeServer {
    async fn fetch(&self, url: &Url, _token: &CancellationToken) -> manifest::Result<String> {
        let body = self.get(url)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl SegmentFetcher for FakeServer {
    async fn fetch_segment(&self, request: &SegmentRequest, _token: &CancellationToken) -> manifest::Result<Bytes> {
        self.get(&request.url)
    }
}

/// Transport stream segments of one second each: 25 video frames at 40ms
/// and an audio frame every other video frame, starting at 1s.
fn ts_segments(count: u64) -> Vec<Vec<u8>> {
    let mut writer = TsWriter::new();
    let mut segments = Vec::new();
    for segment in 0..count {
        writer.write_pat(&Pat {
            transport_stream_id: 1,
            version_number: 0,
            programs: vec![PatProgram {
                program_number: 1,
                pmt_pid: 0x1000,
            }],
        });
        writer.write_pmt(
            0x1000,
            &Pmt {
                program_number: 1,
                version_number: 0,
                pcr_pid: VIDEO_PID,
                streams: vec![
                    PmtStream::new(TsStreamType::H264, VIDEO_PID),
                    PmtStream::new(TsStreamType::AdtsAac, AUDIO_PID),
                ],
            },
        );
        for i in 0..FRAMES_PER_SEGMENT {
            let frame = segment * FRAMES_PER_SEGMENT + i;
            let ts = 90_000 + frame * 3600;
            let key = i == 0;
            let nal: &[u8] = if key { &[0, 0, 0, 1, 0x65, 0x88] } else { &[0, 0, 0, 1, 0x41, 0x9A] };
            writer.write_pes(VIDEO_PID, 0xE0, Some(ts), None, key, nal);
            if frame % 2 == 0 {
                let adts = [0xFF, 0xF1, 0x50, 0x80, 0x02, 0x1F, 0xFC, 0x21];
                writer.write_pes(AUDIO_PID, 0xC0, Some(ts), None, false, &adts);
            }
        }
        segments.push(writer.take());
    }
    segments
}

const PLAYLIST: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:1
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:1.0,
seg0.ts
#EXTINF:1.0,
seg1.ts
#EXT-X-ENDLIST
";

fn hls_server() -> FakeServer {
    let mut segments = ts_segments(2).into_iter();
    FakeServer::default()
        .with("/vod/index.m3u8", PLAYLIST)
        .with("/vod/seg0.ts", segments.next().unwrap_or_default())
        .with("/vod/seg1.ts", segments.next().unwrap_or_default())
}

fn hls_provider(server: FakeServer) -> Box<ManifestDataProvider> {
    let server = Arc::new(server);
    Box::new(ManifestDataProvider::new(
        ClipKind::Hls,
        Url::parse("https://cdn.test/vod/index.m3u8").unwrap(),
        server.clone(),
        server,
        PlayerConfig::default(),
        create_test_context(),
    ))
}

fn controller(sink: Arc<LoggingSink>) -> PlayerController {
    PlayerController::new(PlayerConfig::default(), sink, create_test_context())
}

/// Releases packets at most 100ms ahead of the clock, so playback takes
/// real time.
fn paced_controller(sink: Arc<LoggingSink>) -> PlayerController {
    let config = PlayerConfig::builder()
        .max_lead(Some(Duration::from_millis(100)))
        .build();
    PlayerController::new(config, sink, create_test_context())
}

async fn wait_for_state(controller: &PlayerController, wanted: PlayerState) {
    let mut states = controller.subscribe_state();
    tokio::time::timeout(Duration::from_secs(10), states.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .expect("controller dropped");
}

#[tokio::test]
async fn test_hls_clip_plays_to_completion() {
    let sink = Arc::new(LoggingSink::new());
    let controller = controller(sink.clone());
    let token = CancellationToken::new();

    controller
        .set_provider("https://cdn.test/vod/index.m3u8", hls_provider(hls_server()), Vec::new(), &token)
        .await
        .unwrap();
    assert_eq!(controller.state(), PlayerState::Prepared);
    assert_eq!(controller.duration(), Some(Duration::from_secs(2)));
    let info = controller.clip_info().unwrap();
    assert_eq!(info.kind, ClipKind::Hls);
    assert!(info.seekable);
    assert_eq!(info.streams.len(), 2);

    controller.start().await.unwrap();
    wait_for_state(&controller, PlayerState::Completed).await;

    assert_eq!(sink.packets(StreamType::Video), 50);
    assert_eq!(sink.packets(StreamType::Audio), 25);
}

#[tokio::test]
async fn test_seek_past_the_end_is_clamped() {
    let sink = Arc::new(LoggingSink::new());
    let controller = paced_controller(sink.clone());
    let token = CancellationToken::new();

    controller
        .set_provider("https://cdn.test/vod/index.m3u8", hls_provider(hls_server()), Vec::new(), &token)
        .await
        .unwrap();
    controller.start().await.unwrap();
    controller.pause().await.unwrap();

    let position = controller.seek_to(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(position, Duration::from_secs(2));
    assert!(controller.position() >= Duration::from_secs(2));
    assert_eq!(controller.state(), PlayerState::Paused);

    controller.start().await.unwrap();
    wait_for_state(&controller, PlayerState::Completed).await;
}

#[tokio::test]
async fn test_missing_segment_fails_prepare() {
    let playlist_only = FakeServer::default().with("/vod/index.m3u8", PLAYLIST);
    let controller = controller(Arc::new(LoggingSink::new()));
    let mut events = controller.subscribe_events();
    let token = CancellationToken::new();

    let result = controller
        .set_provider("https://cdn.test/vod/index.m3u8", hls_provider(playlist_only), Vec::new(), &token)
        .await;

    assert!(matches!(
        result,
        Err(PlayerError::Manifest(ManifestError::HttpStatus { status: 404, .. }))
    ));
    assert_eq!(controller.state(), PlayerState::Error);
    assert!(matches!(events.try_recv(), Ok(player::PlayerEvent::Error(_))));
}

#[tokio::test]
async fn test_start_without_source_is_rejected() {
    let controller = controller(Arc::new(LoggingSink::new()));
    assert!(matches!(
        controller.start().await,
        Err(PlayerError::InvalidState {
            state: PlayerState::Idle,
            ..
        })
    ));
    assert!(controller.seek_to(Duration::from_secs(1)).await.is_err());
    assert_eq!(controller.state(), PlayerState::Idle);
}

#[tokio::test]
async fn test_local_transport_stream_plays_to_completion() {
    let mut file = tempfile::Builder::new().suffix(".ts").tempfile().unwrap();
    for segment in ts_segments(2) {
        file.write_all(&segment).unwrap();
    }
    file.flush().unwrap();
    let path = file.path().to_string_lossy().into_owned();

    let sink = Arc::new(LoggingSink::new());
    let controller = controller(sink.clone());
    let token = CancellationToken::new();

    controller.set_source(ClipDefinition::new(path), &token).await.unwrap();
    assert_eq!(controller.clip_info().unwrap().kind, ClipKind::Progressive);
    controller.start().await.unwrap();
    wait_for_state(&controller, PlayerState::Completed).await;

    assert_eq!(sink.packets(StreamType::Video), 50);
    assert_eq!(sink.packets(StreamType::Audio), 25);
}
