use clap::Parser;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Adaptive streaming playback pipeline",
    long_about = "Plays a DASH manifest, an HLS playlist or a single container file through\n\
                  the playback pipeline into a logging sink.\n\
                  \n\
                  Packets are demuxed, ordered across streams, decrypted when a license\n\
                  server is given and logged as they would be handed to a decoder."
)]
pub struct CliArgs {
    /// Clip to play
    #[arg(required = true, help = "Manifest URL, media URL or local file path")]
    pub url: String,

    /// Clip kind, detected from the URL when omitted
    #[arg(
        long,
        value_parser = ["dash", "hls", "progressive", "stream"],
        help = "Clip kind (dash, hls, progressive, stream). Detected from the URL by default"
    )]
    pub kind: Option<String>,

    /// License server URL
    #[arg(long, help = "License server URL for protected content")]
    pub license_url: Option<String>,

    /// DRM scheme name
    #[arg(
        long,
        default_value = "org.w3.clearkey",
        requires = "license_url",
        help = "DRM scheme of the license server (e.g. \"org.w3.clearkey\", \"widevine\")"
    )]
    pub drm_scheme: String,

    /// Extra license request headers
    #[arg(
        long = "license-header",
        value_name = "KEY:VALUE",
        requires = "license_url",
        help = "Header sent with license requests, in 'Name: Value' form. Can be repeated"
    )]
    pub license_headers: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Split long log lines
    #[arg(
        long,
        value_name = "BYTES",
        help = "Split log messages longer than this many bytes into several lines"
    )]
    pub split_logs: Option<usize>,

    /// Maximum lead of released packets over the playback clock
    #[arg(
        long,
        value_name = "MS",
        help = "Maximum time in milliseconds packets may be released ahead of the playback clock"
    )]
    pub max_lead_ms: Option<u64>,

    /// Seek once playback started
    #[arg(
        long,
        value_name = "MS",
        help = "Seek to this position in milliseconds once playback started"
    )]
    pub seek_ms: Option<u64>,
}

/// Parses a `Name: Value` header.
pub fn parse_header(header: &str) -> Option<(String, String)> {
    let (name, value) = header.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
