use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use peercall::config::{DEFAULT_RELAY_URL, DEFAULT_STUN_SERVER};
use peercall::media::{LocalMedia, LocalTrack, WebRtcPeerFactory};
use peercall::transport::TokioWebSocketTransportFactory;
use peercall::{HandlerConfig, UserCode, spawn_call_handler};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

// A headless endpoint: registers a code with the relay, optionally calls
// another code, and logs every event until Ctrl-C.
//
// Usage:
//   cargo run -- --code ZZ99XX                     # wait for calls
//   cargo run -- --code AB12CD --call ZZ99XX       # call ZZ99XX
//   cargo run -- --code ZZ99XX --manual-answer     # log offers, never answer

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer call endpoint", long_about = None)]
struct Args {
    /// Own user code
    #[arg(short, long)]
    code: String,

    /// Relay base URL
    #[arg(short, long, default_value = DEFAULT_RELAY_URL)]
    relay: String,

    /// User code to call once connected
    #[arg(long)]
    call: Option<String>,

    /// Do not answer incoming calls automatically
    #[arg(long)]
    manual_answer: bool,

    /// STUN server, repeatable
    #[arg(long, default_value = DEFAULT_STUN_SERVER)]
    stun: Vec<String>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let identity: UserCode = match args.code.parse() {
        Ok(code) => code,
        Err(e) => {
            error!("Invalid --code {:?}: {}", args.code, e);
            return;
        }
    };
    let target: Option<UserCode> = match args.call.as_deref().map(str::parse::<UserCode>).transpose() {
        Ok(target) => target,
        Err(e) => {
            error!("Invalid --call: {}", e);
            return;
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let config = HandlerConfig::default()
            .with_relay_url(args.relay)
            .with_ice_servers(args.stun)
            .with_auto_answer(!args.manual_answer);

        let handle = spawn_call_handler(
            identity,
            config.clone(),
            Arc::new(TokioWebSocketTransportFactory::new()),
            Arc::new(WebRtcPeerFactory::new(config.ice_servers.clone())),
        );
        spawn_event_logger(&handle);

        if let Err(e) = handle.initialize(local_media()).await {
            error!("Could not reach relay: {}", e);
            return;
        }
        info!("Registered as {}", handle.identity());

        if let Some(target) = target
            && let Err(e) = handle.start_call(target).await
        {
            warn!("Call failed: {}", e);
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Hanging up");
        handle.shutdown().await;
    });
}

/// Silent Opus and VP8 tracks; nothing is captured in the demo.
fn local_media() -> LocalMedia {
    let tracks = [(MIME_TYPE_OPUS, "audio"), (MIME_TYPE_VP8, "video")]
        .into_iter()
        .filter_map(|(mime, id)| {
            let track = TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                "peercall".to_owned(),
            );
            LocalTrack::new(Arc::new(track))
        })
        .collect();
    LocalMedia::new(tracks)
}

fn spawn_event_logger(handle: &peercall::CallHandlerHandle) {
    let events = handle.events();
    let mut states = events.connection_state.subscribe();
    let mut errors = events.error.subscribe();
    let mut received = events.call_received.subscribe();
    let mut rejected = events.call_rejected.subscribe();
    let mut ended = events.call_ended.subscribe();
    let mut streams = events.remote_stream.subscribe();
    let mut texts = events.text_received.subscribe();
    let mut labels = events.translation_result.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(state) = states.recv() => info!("Connection state: {:?}", state),
                Ok(err) = errors.recv() => warn!("Error: {}", err),
                Ok(call) = received.recv() => info!("Incoming call from {}", call.caller),
                Ok(reject) = rejected.recv() => info!("{} rejected the call", reject.peer),
                Ok(end) = ended.recv() => info!("Call with {} ended ({:?})", end.peer, end.reason),
                Ok(stream) = streams.recv() => info!("Remote stream {} ({:?})", stream.stream_id, stream.kind),
                Ok(text) = texts.recv() => info!("Text: {}", text.text),
                Ok(label) = labels.recv() => info!("Translation: {}", label.label),
                else => break,
            }
        }
    });
}
