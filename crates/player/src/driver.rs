//! Runs a demuxer on the blocking pool and feeds its packets to the renderer.

use std::sync::Arc;
use std::time::Duration;

use demux::{AnyEngine, ClipInfo, ContainerEngine, DataSource, Demuxer};
use media_packet::{DrmInitData, MediaPacket, StreamConfig, StreamType};
use parking_lot::Mutex;
use playback_common::PlaybackContext;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{PlayerConfig, PlayerError, StreamRenderer, SyncError};

/// Control messages handled between two batches.
#[derive(Debug)]
pub enum DriverCommand {
    /// Seeks the demuxer and flushes the renderer
    Seek {
        position: Duration,
        reply: oneshot::Sender<Result<(), PlayerError>>,
    },
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub batch_size: usize,
    /// Queued packets per stream type before reading pauses
    pub max_queued_packets: usize,
    /// Forward encrypted packets without decrypting them
    pub pass_through_encrypted: bool,
}

impl DriverSettings {
    pub fn from_config(config: &PlayerConfig) -> Self {
        Self {
            batch_size: config.demux_batch_size,
            max_queued_packets: config.max_queued_packets,
            pass_through_encrypted: false,
        }
    }
}

/// What a driver found in its input after stream selection.
#[derive(Debug, Clone, Default)]
pub struct PreparedStreams {
    pub configs: Vec<StreamConfig>,
    pub drm_init_data: Option<DrmInitData>,
    pub duration: Option<Duration>,
    /// Earliest first timestamp of the selected streams, on the container
    /// timeline
    pub start_time: Option<Duration>,
}

struct Batch {
    packets: Vec<MediaPacket>,
    end_of_input: bool,
}

/// Exclusive owner of one [`Demuxer`].
///
/// Every engine call runs on the blocking pool behind the mutex, so calls
/// are serialized even when a cancelled read is still finishing.
pub struct DemuxDriver<E: ContainerEngine + 'static = AnyEngine> {
    demuxer: Arc<Mutex<Demuxer<E>>>,
    stream_types: Vec<StreamType>,
    settings: DriverSettings,
    context: Arc<PlaybackContext>,
}

impl<E: ContainerEngine + 'static> DemuxDriver<E> {
    pub fn new(demuxer: Demuxer<E>, settings: DriverSettings, context: Arc<PlaybackContext>) -> Self {
        Self {
            demuxer: Arc::new(Mutex::new(demuxer)),
            stream_types: Vec::new(),
            settings,
            context,
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PlayerError>
    where
        F: FnOnce(&mut Demuxer<E>) -> demux::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let demuxer = self.demuxer.clone();
        Ok(tokio::task::spawn_blocking(move || f(&mut demuxer.lock())).await??)
    }

    /// Opens the input. A blocked open is abandoned on cancellation; closing
    /// the source releases the blocking thread.
    pub async fn open(&self, source: DataSource, token: &CancellationToken) -> Result<ClipInfo, PlayerError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(PlayerError::Cancelled),
            result = self.blocking(move |demuxer| demuxer.open(source)) => result,
        }
    }

    /// Enables the best stream of each wanted type, preferring declared
    /// variant bandwidth, and reads their configs.
    pub fn select_streams(&mut self, wanted: &[StreamType]) -> Result<PreparedStreams, PlayerError> {
        let mut demuxer = self.demuxer.lock();
        let mut chosen = Vec::new();
        for &stream_type in wanted {
            let index = demuxer
                .find_best_bandwidth_stream(stream_type)
                .or_else(|| demuxer.find_best_stream(stream_type));
            if let Some(index) = index {
                chosen.push((stream_type, index));
            }
        }
        let indexes: Vec<usize> = chosen.iter().map(|(_, index)| *index).collect();
        demuxer.enable_streams(&indexes)?;

        let configs = indexes
            .iter()
            .map(|&index| demuxer.read_config(index))
            .collect::<demux::Result<Vec<_>>>()?;
        self.context.update_stats(|s| {
            for config in &configs {
                let codec = Some(format!("{:?}", config.codec()));
                match config {
                    StreamConfig::Video(_) => (s.has_video, s.video_codec) = (true, codec),
                    StreamConfig::Audio(_) => (s.has_audio, s.audio_codec) = (true, codec),
                }
            }
        });

        let start_time = indexes
            .iter()
            .filter_map(|&index| demuxer.streams().get(index))
            .filter_map(|s| s.first_dts.map(|dts| s.time_base.to_millis(dts).max(0) as u64))
            .min()
            .map(Duration::from_millis);

        self.stream_types = chosen.iter().map(|(stream_type, _)| *stream_type).collect();
        info!(streams = ?chosen, start_ms = start_time.map(|t| t.as_millis() as u64), "Streams selected");
        Ok(PreparedStreams {
            configs,
            drm_init_data: demuxer.drm_init_data(),
            duration: demuxer.duration(),
            start_time,
        })
    }

    pub fn stream_types(&self) -> &[StreamType] {
        &self.stream_types
    }

    pub fn set_pass_through_encrypted(&mut self, pass_through: bool) {
        self.settings.pass_through_encrypted = pass_through;
    }

    async fn read_batch(&self) -> Result<Batch, PlayerError> {
        let batch_size = self.settings.batch_size;
        self.blocking(move |demuxer| {
            let mut packets = Vec::with_capacity(batch_size);
            while packets.len() < batch_size {
                match demuxer.next_packet()? {
                    Some(packet) => packets.push(packet),
                    None => {
                        return Ok(Batch {
                            packets,
                            end_of_input: true,
                        });
                    }
                }
            }
            Ok(Batch {
                packets,
                end_of_input: false,
            })
        })
        .await
    }

    async fn wait_for_space(&self, renderer: &StreamRenderer, token: &CancellationToken) -> Result<(), SyncError> {
        for &stream_type in &self.stream_types {
            renderer
                .synchronizer()
                .wait_for_space(stream_type, self.settings.max_queued_packets, token)
                .await?;
        }
        Ok(())
    }

    async fn handle(&self, command: DriverCommand, renderer: &StreamRenderer) {
        match command {
            DriverCommand::Seek { position, reply } => {
                let result = self.blocking(move |demuxer| demuxer.seek(position)).await;
                // Nothing demuxed before the seek may reach the sink after it
                if result.is_ok() {
                    renderer.flush();
                }
                debug!(position_ms = position.as_millis() as u64, ok = result.is_ok(), "Demuxer seek handled");
                let _ = reply.send(result);
            }
        }
    }

    fn forward(&self, renderer: &StreamRenderer, packets: Vec<MediaPacket>, warned: &mut bool) {
        let count = packets.len() as u64;
        for packet in packets {
            let packet = match packet {
                MediaPacket::Encrypted(encrypted) if self.settings.pass_through_encrypted => {
                    if !*warned {
                        warn!("Input is encrypted but no DRM is configured, passing packets through");
                        *warned = true;
                    }
                    MediaPacket::Clear(encrypted.packet)
                }
                other => other,
            };
            renderer.handle_packet(packet);
        }
        self.context.update_stats(|s| s.packets_demuxed += count);
    }

    /// Demuxes until cancelled, one batch per blocking call, honoring the
    /// synchronizer's queue limit. At end of input every selected stream
    /// gets its end of stream and the driver waits for a seek.
    pub async fn run(
        &self,
        renderer: Arc<StreamRenderer>,
        commands: mpsc::Receiver<DriverCommand>,
        token: CancellationToken,
    ) -> Result<(), PlayerError> {
        let mut commands = Some(commands);
        let mut ended = false;
        let mut warned = false;

        loop {
            if ended {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(()),
                    command = next_command(&mut commands) => match command {
                        Some(command) => {
                            self.handle(command, &renderer).await;
                            ended = false;
                        }
                        None => return Ok(()),
                    },
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                Some(command) = next_command(&mut commands) => {
                    self.handle(command, &renderer).await;
                    continue;
                }
                result = self.wait_for_space(&renderer, &token) => match result {
                    Ok(()) => {}
                    Err(SyncError::Cancelled) => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
            }

            let batch = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                batch = self.read_batch() => match batch {
                    Ok(batch) => batch,
                    // Stopping closes the source under a blocked read
                    Err(_) if token.is_cancelled() => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            self.forward(&renderer, batch.packets, &mut warned);
            if batch.end_of_input {
                for &stream_type in &self.stream_types {
                    renderer.synchronizer().add_eos(stream_type);
                }
                info!(streams = ?self.stream_types, "Demuxing finished");
                ended = true;
            }
        }
    }

    pub fn close(&self) {
        self.demuxer.lock().close();
    }
}

impl<E: ContainerEngine + 'static> std::fmt::Debug for DemuxDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemuxDriver")
            .field("stream_types", &self.stream_types)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Next command, or pending forever once the sender is gone.
async fn next_command(commands: &mut Option<mpsc::Receiver<DriverCommand>>) -> Option<DriverCommand> {
    let Some(receiver) = commands else {
        return std::future::pending().await;
    };
    let command = receiver.recv().await;
    if command.is_none() {
        *commands = None;
    }
    command
}
