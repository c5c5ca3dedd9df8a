use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::future::join_all;
use tokio::sync::{broadcast, watch};
use tracing::{Instrument, Span, info_span, warn};
use webrtc::{
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_gathering_state::RTCIceGatheringState,
    },
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    track::track_remote::TrackRemote,
};

use crate::{
    errors::{Error, Result, SdpKind, Step},
    media::{MediaStream, RemoteStream},
    rtc::create_rtc_connection,
};

pub type CandidateHandler = Arc<dyn Fn(Option<RTCIceCandidate>) + Send + Sync>;
pub type StateChangeHandler = Arc<dyn Fn(RTCPeerConnectionState) + Send + Sync>;

/// Everything a [`Peer`] is built from.
#[derive(derive_more::Debug)]
pub struct PeerInit {
    pub initiator: bool,
    pub local_stream: MediaStream,
    #[debug(skip)]
    pub config: RTCConfiguration,
    /// Called with every gathered candidate, and with `None` once gathering
    /// is complete.
    #[debug(skip)]
    pub on_ice_candidate: Option<CandidateHandler>,
    #[debug(skip)]
    pub on_connection_state_change: Option<StateChangeHandler>,
    /// Log negotiation steps at INFO instead of DEBUG.
    pub debug: bool,
    pub include_loopback_candidates: bool,
}

impl PeerInit {
    pub fn new(initiator: bool, local_stream: MediaStream, config: RTCConfiguration) -> Self {
        PeerInit {
            initiator,
            local_stream,
            config,
            on_ice_candidate: None,
            on_connection_state_change: None,
            debug: false,
            include_loopback_candidates: false,
        }
    }

    pub fn on_ice_candidate(
        mut self,
        handler: impl Fn(Option<RTCIceCandidate>) + Send + Sync + 'static,
    ) -> Self {
        self.on_ice_candidate = Some(Arc::new(handler));
        self
    }

    pub fn on_connection_state_change(
        mut self,
        handler: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_state_change = Some(Arc::new(handler));
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn include_loopback_candidates(mut self, include: bool) -> Self {
        self.include_loopback_candidates = include;
        self
    }
}

/// One peer connection, its local stream and the tracks received so far.
///
/// The initiator creates the offer and applies the answer; the other side
/// applies the offer and creates the answer. Offers, answers and candidates
/// have to be carried to the remote side by the caller.
#[derive(derive_more::Debug)]
pub struct Peer {
    initiator: bool,
    debug: bool,
    #[debug(skip)]
    connection: Arc<RTCPeerConnection>,
    local_stream: MediaStream,
    remote_stream: RemoteStream,
    closed: AtomicBool,
    #[debug(skip)]
    span: Span,

    #[debug(skip)]
    candidate_tx: broadcast::Sender<RTCIceCandidateInit>,
    #[debug(skip)]
    track_tx: broadcast::Sender<Arc<TrackRemote>>,
    #[debug(skip)]
    state_tx: watch::Sender<RTCPeerConnectionState>,
}

impl Peer {
    pub async fn new(init: PeerInit) -> Result<Peer> {
        let PeerInit {
            initiator,
            local_stream,
            config,
            on_ice_candidate,
            on_connection_state_change,
            debug,
            include_loopback_candidates,
        } = init;
        let span = info_span!("peer", initiator);
        let connection = create_rtc_connection(config, include_loopback_candidates)
            .instrument(span.clone())
            .await?;

        let peer = Peer {
            initiator,
            debug,
            connection: Arc::new(connection),
            local_stream,
            remote_stream: RemoteStream::new(),
            closed: AtomicBool::new(false),
            span,
            candidate_tx: broadcast::channel(64).0,
            track_tx: broadcast::channel(16).0,
            state_tx: watch::channel(RTCPeerConnectionState::New).0,
        };
        peer.add_tracks().instrument(peer.span.clone()).await?;
        peer.add_listeners(
            on_ice_candidate.unwrap_or_else(|| Arc::new(|_: Option<RTCIceCandidate>| {})),
            on_connection_state_change
                .unwrap_or_else(|| Arc::new(|_: RTCPeerConnectionState| {})),
        );
        Ok(peer)
    }

    async fn add_tracks(&self) -> Result<()> {
        for track in self.local_stream.tracks() {
            diag!(self.debug, kind = ?track.kind(), id = track.id(), "Adding local track");
            self.connection
                .add_track(track.clone())
                .await
                .map_err(Error::primitive(Step::AddTrack))?;
        }
        Ok(())
    }

    fn add_listeners(
        &self,
        on_ice_candidate: CandidateHandler,
        on_state_change: StateChangeHandler,
    ) {
        let debug = self.debug;

        let remote_stream = self.remote_stream.clone();
        let track_tx = self.track_tx.clone();
        let span = self.span.clone();
        self.connection.on_track(Box::new(move |track, _, _| {
            let remote_stream = remote_stream.clone();
            let track_tx = track_tx.clone();
            Box::pin(
                async move {
                    remote_stream.add_track(track.clone()).await;
                    diag!(
                        debug,
                        kind = ?track.kind(),
                        id = %track.id(),
                        "Track added to remote stream"
                    );
                    let _ = track_tx.send(track);
                }
                .instrument(span.clone()),
            )
        }));

        let candidate_tx = self.candidate_tx.clone();
        let span = self.span.clone();
        self.connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let _enter = span.enter();
            on_ice_candidate(candidate.clone());
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(candidate) => {
                        diag!(debug, candidate = %candidate.candidate, "ICE candidate gathered");
                        let _ = candidate_tx.send(candidate);
                    }
                    Err(err) => warn!("Failed to encode ICE candidate: {err}"),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = self.state_tx.clone();
        let span = self.span.clone();
        self.connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let _enter = span.enter();
                diag!(debug, %state, "Connection state changed");
                on_state_change(state);
                state_tx.send_replace(state);
                Box::pin(async {})
            },
        ));
    }

    /// Initiator: creates an offer, sets it as local description and returns
    /// it; `offer` is ignored. Otherwise applies `offer` as remote
    /// description and returns `None`.
    pub async fn produce_or_apply_offer(
        &self,
        offer: Option<RTCSessionDescription>,
    ) -> Result<Option<RTCSessionDescription>> {
        self.negotiate(SdpKind::Offer, offer)
            .instrument(self.span.clone())
            .await
            .inspect_err(|err| warn!("An error has occurred while handling the offer: {err}"))
    }

    /// Same as [`Peer::produce_or_apply_offer`] with the roles swapped: the
    /// non-initiator creates the answer, the initiator applies it.
    pub async fn produce_or_apply_answer(
        &self,
        answer: Option<RTCSessionDescription>,
    ) -> Result<Option<RTCSessionDescription>> {
        self.negotiate(SdpKind::Answer, answer)
            .instrument(self.span.clone())
            .await
            .inspect_err(|err| warn!("An error has occurred while handling the answer: {err}"))
    }

    async fn negotiate(
        &self,
        kind: SdpKind,
        remote: Option<RTCSessionDescription>,
    ) -> Result<Option<RTCSessionDescription>> {
        self.ensure_open()?;
        let produces = match kind {
            SdpKind::Offer => self.initiator,
            SdpKind::Answer => !self.initiator,
        };
        if produces {
            let local = match kind {
                SdpKind::Offer => self
                    .connection
                    .create_offer(None)
                    .await
                    .map_err(Error::primitive(Step::CreateOffer))?,
                SdpKind::Answer => self
                    .connection
                    .create_answer(None)
                    .await
                    .map_err(Error::primitive(Step::CreateAnswer))?,
            };
            self.connection
                .set_local_description(local.clone())
                .await
                .map_err(Error::primitive(Step::SetLocalDescription))?;
            diag!(self.debug, "{kind} created and set to local description");
            return Ok(Some(local));
        }

        let remote = remote.ok_or(Error::MissingDescription(kind))?;
        if !kind.accepts(remote.sdp_type) {
            return Err(Error::UnexpectedSdpType {
                expected: kind,
                got: remote.sdp_type,
            });
        }
        self.connection
            .set_remote_description(remote)
            .await
            .map_err(Error::primitive(Step::SetRemoteDescription))?;
        diag!(self.debug, "{kind} received and set to remote description");
        Ok(None)
    }

    /// Feeds every candidate to the connection concurrently. One result per
    /// candidate, in input order; a failure does not stop the others.
    pub async fn add_ice_candidates(
        &self,
        candidates: Vec<RTCIceCandidateInit>,
    ) -> Vec<Result<()>> {
        join_all(
            candidates
                .into_iter()
                .map(|candidate| self.add_ice_candidate(candidate)),
        )
        .await
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        async {
            self.ensure_open()?;
            let line = candidate.candidate.clone();
            match self.connection.add_ice_candidate(candidate).await {
                Ok(()) => {
                    diag!(self.debug, "ICE candidate added {line}");
                    Ok(())
                }
                Err(err) => {
                    warn!("An error has occurred while adding ICE candidate {line}: {err}");
                    Err(Error::Primitive {
                        step: Step::AddIceCandidate,
                        source: err,
                    })
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Detaches the event hooks and closes the connection. Calling it again
    /// is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connection.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.connection.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.connection
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        let result = self
            .connection
            .close()
            .instrument(self.span.clone())
            .await
            .map_err(Error::primitive(Step::Close));
        self.state_tx.send_replace(RTCPeerConnectionState::Closed);
        self.span.in_scope(|| diag!(self.debug, "Peer connection closed"));
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.connection
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        *self.state_tx.borrow()
    }

    pub async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.connection.local_description().await
    }

    pub async fn remote_description(&self) -> Option<RTCSessionDescription> {
        self.connection.remote_description().await
    }

    /// Gathered candidates, ready to be sent to the remote side.
    pub fn subscribe_candidates(&self) -> broadcast::Receiver<RTCIceCandidateInit> {
        self.candidate_tx.subscribe()
    }

    pub fn subscribe_tracks(&self) -> broadcast::Receiver<Arc<TrackRemote>> {
        self.track_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RTCPeerConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once ICE gathering for the current local description is
    /// done, after which [`Peer::local_description`] carries every candidate.
    /// Returns at once if no local description was set yet.
    pub async fn gathering_complete(&self) {
        if self.connection.ice_gathering_state() == RTCIceGatheringState::New {
            return;
        }
        let mut gather = self.connection.gathering_complete_promise().await;
        let _ = gather.recv().await;
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let connection = self.connection.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = connection.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex, time::Duration};

    use tokio::time::{sleep, timeout};
    use tracing::subscriber::DefaultGuard;
    use webrtc::{
        ice_transport::ice_server::RTCIceServer, peer_connection::sdp::sdp_type::RTCSdpType,
    };

    use super::*;
    use crate::{
        config::rtc_configuration,
        errors::FailureKind,
        media::{MediaDevices, SampleDevices},
    };

    async fn peer(initiator: bool) -> Peer {
        let stream = SampleDevices::new(format!("test-{initiator}"))
            .get_user_media(true, true)
            .await
            .unwrap();
        Peer::new(PeerInit::new(initiator, stream, rtc_configuration(vec![])))
            .await
            .unwrap()
    }

    /// Formatted log output of the current thread.
    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Logs {
        fn capture() -> (Logs, DefaultGuard) {
            let logs = Logs::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .finish();
            (logs, tracing::subscriber::set_default(subscriber))
        }

        fn contains(&self, needle: &str) -> bool {
            String::from_utf8_lossy(&self.0.lock().unwrap()).contains(needle)
        }
    }

    #[tokio::test]
    async fn attaches_every_local_track_once() {
        let peer = peer(true).await;
        assert_eq!(peer.local_stream().len(), 2);
        assert_eq!(peer.connection().get_senders().await.len(), 2);
        assert!(peer.remote_stream().is_empty().await);
    }

    #[tokio::test]
    async fn configuration_reaches_the_connection() {
        let ice_servers = vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        }];
        let peer = Peer::new(PeerInit::new(
            true,
            MediaStream::new("empty"),
            rtc_configuration(ice_servers.clone()),
        ))
        .await
        .unwrap();
        assert_eq!(peer.connection().get_configuration().await.ice_servers, ice_servers);
    }

    #[tokio::test]
    async fn initiator_produces_offer_and_ignores_argument() {
        let peer = peer(true).await;
        let offer = peer
            .produce_or_apply_offer(Some(RTCSessionDescription::default()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.sdp_type, RTCSdpType::Offer);
        let local = peer.local_description().await.unwrap();
        assert_eq!(local.sdp_type, RTCSdpType::Offer);
    }

    #[tokio::test]
    async fn offer_and_answer_roles() {
        let initiator = peer(true).await;
        let responder = peer(false).await;

        let offer = initiator.produce_or_apply_offer(None).await.unwrap();
        assert!(offer.is_some());
        assert!(responder.produce_or_apply_offer(offer).await.unwrap().is_none());
        assert_eq!(
            responder.remote_description().await.unwrap().sdp_type,
            RTCSdpType::Offer
        );

        let answer = responder.produce_or_apply_answer(None).await.unwrap();
        assert_eq!(answer.as_ref().unwrap().sdp_type, RTCSdpType::Answer);
        assert!(initiator.produce_or_apply_answer(answer).await.unwrap().is_none());
        assert_eq!(
            initiator.remote_description().await.unwrap().sdp_type,
            RTCSdpType::Answer
        );
    }

    #[tokio::test]
    async fn bad_descriptions_are_reported() {
        let (logs, _guard) = Logs::capture();
        let responder = peer(false).await;

        let err = responder.produce_or_apply_offer(None).await.unwrap_err();
        assert!(matches!(err, Error::MissingDescription(SdpKind::Offer)));

        let err = responder
            .produce_or_apply_offer(Some(RTCSessionDescription::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedSdpType { expected: SdpKind::Offer, .. }));
        assert_eq!(err.kind(), FailureKind::MalformedDescription);

        let initiator = peer(true).await;
        let err = initiator.produce_or_apply_answer(None).await.unwrap_err();
        assert!(matches!(err, Error::MissingDescription(SdpKind::Answer)));
        assert!(initiator.remote_description().await.is_none());

        assert!(logs.contains("An error has occurred while handling the offer"));
        assert!(logs.contains("An error has occurred while handling the answer"));
    }

    #[tokio::test]
    async fn empty_candidate_batch() {
        let peer = peer(true).await;
        assert!(peer.add_ice_candidates(vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn rejected_candidate_is_returned_not_raised() {
        let (logs, _guard) = Logs::capture();
        let peer = peer(true).await;
        let results = peer
            .add_ice_candidates(vec![RTCIceCandidateInit {
                candidate: "candidate:1 1 udp 2130706431 192.168.1.2 5000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                ..Default::default()
            }])
            .await;
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err, Error::Primitive { step: Step::AddIceCandidate, .. }));
        assert_eq!(err.kind(), FailureKind::InvalidState);
        assert!(logs.contains(
            "An error has occurred while adding ICE candidate candidate:1 1 udp 2130706431"
        ));
    }

    #[tokio::test]
    async fn gathering_complete_before_any_description() {
        let peer = peer(true).await;
        timeout(Duration::from_secs(1), peer.gathering_complete())
            .await
            .unwrap();
        assert!(peer.local_description().await.is_none());
    }

    #[tokio::test]
    async fn gathered_candidates_land_in_the_description() {
        let stream = SampleDevices::default().get_user_media(true, false).await.unwrap();
        let init = PeerInit::new(true, stream, rtc_configuration(vec![]))
            .include_loopback_candidates(true);
        let peer = Peer::new(init).await.unwrap();
        peer.produce_or_apply_offer(None).await.unwrap();
        timeout(Duration::from_secs(10), peer.gathering_complete())
            .await
            .unwrap();
        let offer = peer.local_description().await.unwrap();
        assert!(offer.sdp.contains("a=candidate"));
    }

    #[tokio::test]
    async fn dropping_an_open_peer_closes_the_connection() {
        let peer = peer(true).await;
        let connection = peer.connection().clone();
        drop(peer);
        timeout(Duration::from_secs(5), async {
            while connection.connection_state() != RTCPeerConnectionState::Closed {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let peer = peer(true).await;
        let state = peer.subscribe_state();
        peer.close().await.unwrap();
        peer.close().await.unwrap();
        assert!(peer.is_closed());
        assert_eq!(*state.borrow(), RTCPeerConnectionState::Closed);
        let err = peer.produce_or_apply_offer(None).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
        let results = peer.add_ice_candidates(vec![RTCIceCandidateInit::default()]).await;
        assert!(matches!(results[0], Err(Error::Closed)));
    }
}
