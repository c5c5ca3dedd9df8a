use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use clap::Parser;
use rtcpeer::{
    Error, MediaStream, Peer, PeerInit, SampleDevices, Signal, StreamOptions,
    config::{parse_ice_server, rtc_configuration},
    get_local_stream,
};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    time::{interval, timeout},
};
use tracing::{error, info, warn};
use webrtc::{
    ice_transport::ice_server::RTCIceServer,
    media::Sample,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp_transceiver::rtp_codec::RTPCodecType,
    track::track_local::TrackLocal,
};

/// Negotiates two peers inside this process and waits until media flows
/// both ways.
#[derive(Debug, Parser)]
struct Args {
    #[clap(env, long, short, value_parser = parse_ice_server, value_delimiter = ',')]
    ice_servers: Vec<RTCIceServer>,
    #[clap(env, long, default_value_t = false)]
    no_audio: bool,
    #[clap(env, long, default_value_t = false)]
    no_video: bool,
    #[clap(env, long, short, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,
    #[clap(env, long, short, default_value_t = false)]
    debug: bool,
    #[clap(env, long, default_value_t = false)]
    loopback: bool,
    /// Send descriptions only once ICE gathering is done, with every
    /// candidate inside, instead of trickling candidates.
    #[clap(env, long, default_value_t = false)]
    no_trickle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let offerer = Arc::new(create_peer(&args, true).await?);
    let answerer = Arc::new(create_peer(&args, false).await?);

    // subscribe before negotiating so no candidate is missed
    let (to_answerer, from_offerer) = mpsc::unbounded_channel();
    let (to_offerer, from_answerer) = mpsc::unbounded_channel();
    if !args.no_trickle {
        forward_candidates(&offerer, to_answerer);
        forward_candidates(&answerer, to_offerer);
    }

    let offer = offerer
        .produce_or_apply_offer(None)
        .await?
        .ok_or_else(|| anyhow!("initiator produced no offer"))?;
    let offer = outgoing(&offerer, offer, !args.no_trickle).await?;
    let offer = Signal::from_json(&Signal::Offer(offer).to_json()?)?;
    answerer.produce_or_apply_offer(offer.into_description()).await?;

    let answer = answerer
        .produce_or_apply_answer(None)
        .await?
        .ok_or_else(|| anyhow!("responder produced no answer"))?;
    let answer = outgoing(&answerer, answer, !args.no_trickle).await?;
    let answer = Signal::from_json(&Signal::Answer(answer).to_json()?)?;
    offerer.produce_or_apply_answer(answer.into_description()).await?;

    deliver_candidates(answerer.clone(), from_offerer);
    deliver_candidates(offerer.clone(), from_answerer);

    feed_silence(offerer.local_stream().clone());
    feed_silence(answerer.local_stream().clone());

    let expected = usize::from(!args.no_audio) + usize::from(!args.no_video);
    let result = timeout(args.timeout, async {
        tokio::try_join!(
            wait_ready(&offerer, expected),
            wait_ready(&answerer, expected),
        )
    })
    .await;
    let outcome = match result {
        Ok(Ok(_)) => {
            info!("Both peers connected and receiving media");
            Ok(())
        }
        Ok(Err(err)) => Err(anyhow!("Negotiation failed: {err}")),
        Err(_) => Err(anyhow!(
            "Timed out after {}",
            humantime::format_duration(args.timeout)
        )),
    };

    offerer.close().await?;
    answerer.close().await?;
    outcome
}

async fn outgoing(
    peer: &Peer,
    description: RTCSessionDescription,
    trickle: bool,
) -> Result<RTCSessionDescription> {
    if trickle {
        return Ok(description);
    }
    peer.gathering_complete().await;
    info!(initiator = peer.initiator(), "ICE gathering complete");
    peer.local_description()
        .await
        .ok_or_else(|| anyhow!("local description is gone"))
}

async fn create_peer(args: &Args, initiator: bool) -> Result<Peer> {
    let devices = SampleDevices::new(if initiator { "offerer" } else { "answerer" });
    let stream = get_local_stream(&devices, StreamOptions {
        audio: !args.no_audio,
        video: !args.no_video,
        on_error: Some(Box::new(|err: &Error| {
            error!("Failed to capture local media: {err}");
        })),
    })
    .await?;
    let init = PeerInit::new(initiator, stream, rtc_configuration(args.ice_servers.clone()))
        .on_connection_state_change(move |state| info!(initiator, "Connection state: {state}"))
        .debug(args.debug)
        .include_loopback_candidates(args.loopback);
    Ok(Peer::new(init).await?)
}

fn forward_candidates(peer: &Peer, tx: mpsc::UnboundedSender<String>) {
    let mut candidates = peer.subscribe_candidates();
    tokio::spawn(async move {
        loop {
            let candidate = match candidates.recv().await {
                Ok(candidate) => candidate,
                Err(RecvError::Lagged(n)) => {
                    warn!("Dropped {n} candidates");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match Signal::Candidate(candidate).to_json() {
                Ok(json) => {
                    if tx.send(json).is_err() {
                        break;
                    }
                }
                Err(err) => warn!("Failed to encode candidate: {err}"),
            }
        }
    });
}

fn deliver_candidates(peer: Arc<Peer>, mut rx: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            let candidate = match Signal::from_json(&json) {
                Ok(Signal::Candidate(candidate)) => candidate,
                Ok(other) => {
                    warn!("Unexpected signal on candidate channel: {other:?}");
                    continue;
                }
                Err(err) => {
                    warn!("Failed to decode candidate: {err}");
                    continue;
                }
            };
            for result in peer.add_ice_candidates(vec![candidate]).await {
                if let Err(Error::Closed) = result {
                    return;
                }
            }
        }
    });
}

fn feed_silence(stream: MediaStream) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            // the frame is Opus silence, video tracks stay idle
            for track in stream
                .sample_tracks()
                .filter(|track| track.kind() == RTPCodecType::Audio)
            {
                let sample = Sample {
                    data: Bytes::from_static(&[0xf8, 0xff, 0xfe]),
                    duration: Duration::from_millis(20),
                    ..Default::default()
                };
                if let Err(err) = track.write_sample(&sample).await {
                    warn!("Failed to write sample: {err}");
                    return;
                }
            }
        }
    });
}

async fn wait_ready(peer: &Peer, tracks: usize) -> Result<()> {
    let mut state = peer.subscribe_state();
    let mut new_tracks = peer.subscribe_tracks();
    let connected = state
        .wait_for(|state| {
            matches!(
                state,
                RTCPeerConnectionState::Connected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
            )
        })
        .await
        .map(|state| *state)?;
    if connected != RTCPeerConnectionState::Connected {
        return Err(anyhow!("connection ended in state {connected}"));
    }
    while peer.remote_stream().len().await < tracks {
        let track = new_tracks.recv().await?;
        info!(initiator = peer.initiator(), kind = ?track.kind(), "Remote track");
    }
    Ok(())
}
