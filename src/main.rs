use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use drm::DrmDescription;
use media_packet::StreamType;
use playback_common::{LoggingConfig, PlaybackContext, init_logging};
use player::{ClipDefinition, ClipKind, LoggingSink, PlayerConfig, PlayerController, PlayerEvent, PlayerState};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cli;
mod error;

use cli::{CliArgs, parse_header};
use error::AppError;

#[tokio::main]
async fn main() {
    // Using parse() instead of try_parse() to let clap automatically handle --help
    let args = CliArgs::parse();

    let mut logging = LoggingConfig::default().with_filter(if args.verbose { "debug" } else { "info" });
    if let Some(threshold) = args.split_logs {
        logging = logging.with_split_threshold(threshold);
    }
    if let Err(e) = init_logging(&logging) {
        eprintln!("{e}");
        exit(1);
    }

    info!("Cadence playback pipeline - by hua0512");

    match run(args).await {
        Ok(PlayerState::Error) => exit(1),
        Ok(state) => info!(%state, "Playback finished"),
        Err(e) => {
            error!(error = %e, "Playback failed");
            exit(1);
        }
    }
}

fn clip_definition(args: &CliArgs) -> Result<ClipDefinition, AppError> {
    let mut clip = ClipDefinition::new(args.url.clone());
    if let Some(kind) = &args.kind {
        clip = clip.with_kind(kind.parse::<ClipKind>().map_err(AppError::InvalidArgument)?);
    }
    if let Some(license_url) = &args.license_url {
        let mut description = DrmDescription::new(args.drm_scheme.clone()).with_license_url(license_url.clone());
        for header in &args.license_headers {
            let (name, value) = parse_header(header)
                .ok_or_else(|| AppError::InvalidArgument(format!("invalid header '{header}', expected 'Name: Value'")))?;
            description = description.with_property(name, value);
        }
        info!(scheme = %description.scheme, license_url = %license_url, "DRM enabled");
        clip = clip.with_drm(description);
    }
    Ok(clip)
}

async fn log_events(mut events: broadcast::Receiver<PlayerEvent>, token: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(PlayerEvent::StateChanged { from, to }) => info!(%from, %to, "State changed"),
            Ok(PlayerEvent::Error(e)) => error!(error = %e, "Player error"),
            Ok(PlayerEvent::BufferingChanged(buffering)) => info!(buffering, "Buffering changed"),
            Ok(PlayerEvent::DurationChanged(duration)) => {
                info!(duration_ms = duration.map(|d| d.as_millis() as u64), "Duration changed")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "Player events dropped"),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Plays the clip until it completes, fails or the user interrupts.
/// Returns the final player state.
async fn run(args: CliArgs) -> Result<PlayerState, AppError> {
    let clip = clip_definition(&args)?;
    let config = PlayerConfig::builder()
        .max_lead(args.max_lead_ms.map(Duration::from_millis))
        .build();
    let context = PlaybackContext::new("cadence")?.arc();
    let sink = Arc::new(LoggingSink::new());
    let controller = PlayerController::new(config, sink.clone(), context.clone());

    let token = CancellationToken::new();
    let events = tokio::spawn(log_events(controller.subscribe_events(), token.clone()));
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping playback");
            interrupt.cancel();
        }
    });

    let result = play(&controller, clip, args.seek_ms, &token).await;
    let state = controller.state();
    if matches!(state, PlayerState::Playing | PlayerState::Paused) {
        controller.stop().await?;
    }
    token.cancel();
    let _ = events.await;

    let stats = context.stats_snapshot();
    info!(
        video_packets = sink.packets(StreamType::Video),
        audio_packets = sink.packets(StreamType::Audio),
        bytes = sink.bytes(),
        downloaded = stats.bytes_downloaded,
        dropped_late = stats.packets_dropped_late,
        "Playback summary"
    );

    match result {
        Err(player::PlayerError::Cancelled) => Ok(controller.state()),
        Err(e) => Err(e.into()),
        Ok(()) => Ok(controller.state()),
    }
}

async fn play(
    controller: &PlayerController,
    clip: ClipDefinition,
    seek_ms: Option<u64>,
    token: &CancellationToken,
) -> Result<(), player::PlayerError> {
    controller.set_source(clip, token).await?;
    if let Some(info) = controller.clip_info() {
        info!(
            url = %info.url,
            kind = %info.kind,
            streams = info.streams.len(),
            duration_ms = info.duration.map(|d| d.as_millis() as u64),
            seekable = info.seekable,
            "Clip ready"
        );
    }
    controller.start().await?;

    if let Some(seek_ms) = seek_ms {
        let position = controller.seek_to(Duration::from_millis(seek_ms)).await?;
        info!(position_ms = position.as_millis() as u64, "Seeked");
    }

    let mut states = controller.subscribe_state();
    tokio::select! {
        _ = token.cancelled() => {}
        _ = states.wait_for(|s| matches!(s, PlayerState::Completed | PlayerState::Error)) => {}
    }
    Ok(())
}
