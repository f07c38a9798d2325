//! Client coordinator
//!
//! A single task owns the session and applies every side effect. It waits
//! on four sources at once:
//!
//! ```text
//! ClientCommand ----\
//! ControlEvent  -----+--> Coordinator --> ControlChannel (requests)
//! AudioEvent    -----+                --> receiver task (start / stop)
//! idle interval ----/                 --> PlaybackQueue / PlaybackEngine
//! ```
//!
//! The receiver task owns the buffer pipeline while a play phase runs and
//! returns it when it stops, so the pipeline is never shared. If a receiver
//! has to be aborted its pipeline is rebuilt from the session's segment
//! ledger, which also drives teardown cleanup.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::events::{
    ClientCommand, ClientCommandReceiver, ClientError, ClientEvent, ClientEventSender,
    SharedClientState, client_command_channel, client_event_channel,
};
use super::handle::{ClientHandle, ClientThreadHandle};
use crate::audio::{AudioEvent, AudioEventReceiver, PlaybackEngine, PlaybackQueue};
use crate::cache::{BufferPipeline, PipelineEvent, PurgeReport, SegmentLedger, SegmentStore};
use crate::config::Settings;
use crate::rtp::{DataChannel, ExitReason, ReceiverExit, ReceiverSignals, spawn_receiver};
use crate::rtsp::{
    ControlChannel, ControlEvent, ControlEventReceiver, ControlEventSender, ReplyOutcome,
    RequestKind, Session, SessionState, Transition, control_event_channel,
};

const STATUS_SETUP: &str = "Setting up connection...";
const STATUS_LOADING: &str = "Loading...";
const STATUS_PLAYING: &str = "Playing";
const STATUS_PAUSED: &str = "Paused";

/// Spawn the coordinator task
///
/// Must be called from within a tokio runtime. The coordinator connects the
/// control channel right away; a failure is reported and `setup()` retries.
pub fn spawn_client(
    settings: Settings,
    engine: Arc<dyn PlaybackEngine>,
    engine_events: AudioEventReceiver,
    store: Arc<dyn SegmentStore>,
) -> ClientThreadHandle {
    let (command_tx, command_rx) = client_command_channel();
    let (event_tx, event_rx) = client_event_channel();
    let (control_tx, control_rx) = control_event_channel();

    let state = SharedClientState::new();
    let handle = ClientHandle::new(command_tx, state.clone());

    let coordinator = Coordinator::new(settings, engine, store, control_tx, event_tx, state);
    let task = tokio::spawn(coordinator.run(command_rx, control_rx, engine_events));

    ClientThreadHandle::new(handle, event_rx, task)
}

struct Coordinator {
    settings: Settings,
    engine: Arc<dyn PlaybackEngine>,
    store: Arc<dyn SegmentStore>,
    queue: Arc<PlaybackQueue>,
    session: Session,
    signals: Arc<ReceiverSignals>,
    control: Option<ControlChannel>,
    control_tx: ControlEventSender,
    data: Option<Arc<DataChannel>>,
    /// Held here between play phases
    pipeline: Option<BufferPipeline>,
    /// Keys written this session, whoever holds the pipeline
    ledger: SegmentLedger,
    receiver: Option<JoinHandle<ReceiverExit>>,
    event_tx: ClientEventSender,
    state: SharedClientState,
}

impl Coordinator {
    fn new(
        settings: Settings,
        engine: Arc<dyn PlaybackEngine>,
        store: Arc<dyn SegmentStore>,
        control_tx: ControlEventSender,
        event_tx: ClientEventSender,
        state: SharedClientState,
    ) -> Self {
        Self {
            queue: Arc::new(PlaybackQueue::new(engine.clone())),
            session: Session::new(settings.resource.clone(), settings.rtp_port),
            signals: Arc::new(ReceiverSignals::default()),
            settings,
            engine,
            store,
            control: None,
            control_tx,
            data: None,
            pipeline: None,
            ledger: SegmentLedger::new(),
            receiver: None,
            event_tx,
            state,
        }
    }

    async fn run(
        mut self,
        mut commands: ClientCommandReceiver,
        mut control_rx: ControlEventReceiver,
        mut engine_events: AudioEventReceiver,
    ) {
        info!("Client coordinator started");
        self.connect().await;

        let mut idle = tokio::time::interval(self.settings.idle_poll_interval());
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(ClientCommand::Shutdown) => break,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            self.report(e);
                        }
                    }
                },
                Some(event) = control_rx.recv() => self.handle_control(event).await,
                Some(event) = engine_events.recv() => self.handle_audio(event),
                _ = idle.tick() => self.on_idle_tick().await,
            }
        }

        self.shutdown().await;
        info!("Client coordinator exiting");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    fn status(&self, text: &str) {
        self.emit(ClientEvent::Status(text.to_string()));
    }

    fn report(&self, error: ClientError) {
        warn!("{}", error);
        self.emit(ClientEvent::Error {
            message: error.to_string(),
        });
    }

    async fn connect(&mut self) -> bool {
        let addr = self.settings.server_addr();
        match ControlChannel::connect(&addr, self.control_tx.clone()).await {
            Ok(channel) => {
                let peer = channel.peer();
                self.control = Some(channel);
                self.state.update(|s| s.connected = true);
                self.emit(ClientEvent::Connected { peer });
                true
            }
            Err(e) => {
                self.report(e.into());
                false
            }
        }
    }

    async fn send(&mut self, kind: RequestKind) -> Result<(), ClientError> {
        let request = self.session.request(kind)?;
        let control = self.control.as_mut().ok_or(ClientError::NotConnected)?;
        control.send(&request).await?;
        debug!("{} sent with CSeq {}", kind, request.cseq);
        Ok(())
    }

    // ============ Commands ============

    async fn handle_command(&mut self, command: ClientCommand) -> Result<(), ClientError> {
        match command {
            ClientCommand::Setup => {
                if self.session.allows(RequestKind::Setup) && self.control.is_none() {
                    if !self.connect().await {
                        return Ok(());
                    }
                }
                self.send(RequestKind::Setup).await?;
                self.status(STATUS_SETUP);
            }

            ClientCommand::Play => {
                if self.session.allows(RequestKind::Play)
                    && (self.data.is_none() || self.pipeline.is_none())
                {
                    return Err(ClientError::DataChannelClosed);
                }
                let request = self.session.request(RequestKind::Play)?;

                if self.queue.has_started() {
                    self.engine.resume();
                }
                // Receive from the moment PLAY goes out so nothing is missed
                self.start_receiver();

                let sent = match self.control.as_mut() {
                    Some(control) => control.send(&request).await.map_err(ClientError::from),
                    None => Err(ClientError::NotConnected),
                };
                if let Err(e) = sent {
                    self.abandon_play().await;
                    return Err(e);
                }
                self.status(if self.queue.has_started() {
                    STATUS_PLAYING
                } else {
                    STATUS_LOADING
                });
            }

            ClientCommand::Pause => {
                if self.session.allows(RequestKind::Pause) {
                    self.engine.pause();
                    self.signals.set_receiving(false);
                }
                if let Err(e) = self.send(RequestKind::Pause).await {
                    if self.session.pending() == Some(RequestKind::Pause) {
                        self.undo_pause();
                    }
                    return Err(e);
                }
                self.status(STATUS_PAUSED);
            }

            ClientCommand::Teardown => self.send(RequestKind::Teardown).await?,

            ClientCommand::Shutdown => {}
        }
        Ok(())
    }

    fn start_receiver(&mut self) {
        let (Some(data), Some(pipeline)) = (self.data.clone(), self.pipeline.take()) else {
            return;
        };
        self.receiver = Some(spawn_receiver(
            data,
            pipeline,
            self.signals.clone(),
            self.settings.receive_timeout(),
        ));
    }

    /// PLAY could not be sent or was refused
    async fn abandon_play(&mut self) {
        self.signals.request_pause();
        self.stop_receiver().await;
        if self.queue.has_started() {
            self.engine.pause();
        }
    }

    /// PAUSE could not be sent or was refused
    fn undo_pause(&mut self) {
        self.signals.set_receiving(self.receiver.is_some());
        self.engine.resume();
    }

    /// Wait for the receiver to exit and take back the pipeline
    ///
    /// Bounded by twice the receive timeout. A receiver that does not stop
    /// by then is aborted; its buffered bytes are lost and a fresh pipeline
    /// continues the session's segment numbering.
    async fn stop_receiver(&mut self) -> Option<ExitReason> {
        let handle = self.receiver.take()?;
        let abort = handle.abort_handle();
        let limit = self.settings.receive_timeout() * 2;

        let error = match tokio::time::timeout(limit, handle).await {
            Ok(Ok(exit)) => return Some(self.on_receiver_exit(exit)),
            Ok(Err(e)) => ClientError::Receiver(e.to_string()),
            Err(_) => {
                abort.abort();
                ClientError::Receiver(format!("did not stop within {:?}", limit))
            }
        };
        self.signals.set_receiving(false);
        self.report(error);
        self.pipeline = Some(self.new_pipeline());
        None
    }

    fn on_receiver_exit(&mut self, exit: ReceiverExit) -> ExitReason {
        info!(
            "Receiver exited ({}) after {} packets; segment {} holds {} bytes",
            exit.reason,
            exit.packets,
            exit.pipeline.segment_index(),
            exit.pipeline.buffered()
        );
        let reason = exit.reason;
        self.pipeline = Some(exit.pipeline);
        self.state
            .update(|s| s.highest_sequence = self.signals.highest_sequence());
        self.emit(ClientEvent::ReceiverStopped { reason });

        if reason == ExitReason::TransportFailed {
            // Assume the socket is gone
            self.data = None;
            self.state.update(|s| s.data_port = None);
            self.report(ClientError::DataChannelClosed);
        }
        reason
    }

    // ============ Control replies ============

    async fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Reply(reply) => {
                let old = self.session.state();
                match self.session.on_reply(&reply) {
                    ReplyOutcome::Stale { expected, got } => {
                        debug!("Ignoring stale reply: CSeq {} (expected {})", got, expected)
                    }
                    ReplyOutcome::ForeignSession { expected, got } => {
                        warn!("Ignoring reply for session {} (ours is {})", got, expected)
                    }
                    ReplyOutcome::Unsolicited => debug!("Ignoring unsolicited reply {:?}", reply),
                    ReplyOutcome::Rejected {
                        request,
                        status,
                        reason,
                    } => self.on_rejected(request, status, &reason).await,
                    ReplyOutcome::Accepted(transition) => {
                        let new = self.session.state();
                        self.state.update(|s| {
                            s.state = new;
                            s.session_id = self.session.session_id();
                        });
                        self.emit(ClientEvent::StateChanged { old, new });
                        self.apply(transition).await;
                    }
                }
            }
            ControlEvent::Malformed(message) => {
                warn!("Malformed reply: {}", message);
                self.emit(ClientEvent::Error {
                    message: format!("Malformed reply: {}", message),
                });
            }
            ControlEvent::Closed => {
                // Expected after teardown, when the channel is already gone
                if let Some(control) = self.control.take() {
                    control.close().await;
                    self.state.update(|s| s.connected = false);
                    self.report(ClientError::NotConnected);
                }
            }
        }
    }

    async fn on_rejected(&mut self, request: RequestKind, status: u16, reason: &str) {
        self.emit(ClientEvent::Error {
            message: format!("{} rejected: {} {}", request, status, reason),
        });
        match request {
            RequestKind::Play => self.abandon_play().await,
            RequestKind::Pause => self.undo_pause(),
            _ => {}
        }
    }

    async fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Ready => self.open_data_channel().await,
            Transition::Playing => {
                if self.queue.has_started() {
                    self.status(STATUS_PLAYING);
                }
            }
            Transition::Paused => {
                self.signals.request_pause();
                self.stop_receiver().await;
            }
            Transition::TornDown => self.finish_session().await,
        }
    }

    async fn open_data_channel(&mut self) {
        if self.data.is_none() {
            match DataChannel::bind(self.settings.rtp_port).await {
                Ok(channel) => self.data = Some(Arc::new(channel)),
                Err(e) => {
                    self.report(ClientError::DataChannel(e));
                    return;
                }
            }
        }
        let port = self.data.as_ref().map(|d| d.local_addr().port());
        self.state.update(|s| s.data_port = port);

        if self.pipeline.is_none() {
            self.pipeline = Some(self.new_pipeline());
        }
    }

    fn new_pipeline(&self) -> BufferPipeline {
        let mut pipeline = BufferPipeline::new(
            self.session.session_id(),
            self.settings.segment_threshold_bytes,
            self.store.clone(),
            self.queue.clone(),
            self.signals.clone(),
            self.ledger.clone(),
        );

        let events = self.event_tx.clone();
        let shared = self.state.clone();
        pipeline.set_callback(move |event| match event {
            PipelineEvent::Buffered { bytes, .. } => shared.update(|s| s.buffered_bytes = bytes),
            PipelineEvent::SegmentReady { index, bytes } => {
                shared.update(|s| s.segments_ready += 1);
                let _ = events.send(ClientEvent::SegmentReady { index, bytes });
            }
            PipelineEvent::StorageFailed { message } => {
                let _ = events.send(ClientEvent::Error { message });
            }
        });
        pipeline
    }

    /// Teardown confirmed: release everything and start a fresh session
    async fn finish_session(&mut self) {
        let report = self.release().await;
        self.session = Session::new(self.settings.resource.clone(), self.settings.rtp_port);
        self.signals = Arc::new(ReceiverSignals::default());
        self.ledger = SegmentLedger::new();
        self.state.reset_session();
        self.state.update(|s| s.connected = false);

        info!(
            "Session torn down: {} segments deleted, {} failed",
            report.deleted, report.failed
        );
        self.emit(ClientEvent::TornDown {
            deleted: report.deleted,
            failed: report.failed,
        });
    }

    async fn release(&mut self) -> PurgeReport {
        self.signals.acknowledge_teardown();
        self.stop_receiver().await;
        self.engine.stop();

        let report = match self.pipeline.take() {
            Some(mut pipeline) => {
                pipeline.finish();
                pipeline.purge()
            }
            None if self.ledger.is_empty() => PurgeReport::default(),
            None => self.ledger.purge(self.store.as_ref(), |e| {
                self.emit(ClientEvent::Error {
                    message: e.to_string(),
                })
            }),
        };
        self.queue.reset();
        self.data = None;
        if let Some(control) = self.control.take() {
            control.close().await;
        }
        report
    }

    // ============ Playback ============

    fn handle_audio(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::TrackEnded { path } => {
                debug!("Track ended: {:?}", path);
                self.queue.on_track_ended(&path);
            }
            AudioEvent::Started { path } => {
                debug!("Track started: {:?}", path);
                if self.session.state() == SessionState::Playing {
                    self.status(STATUS_PLAYING);
                }
            }
            AudioEvent::Error { message } => self.emit(ClientEvent::Error { message }),
            AudioEvent::Paused | AudioEvent::Resumed | AudioEvent::Stopped => {
                debug!("Audio event: {:?}", event)
            }
        }
    }

    async fn on_idle_tick(&mut self) {
        self.engine.tick();

        if self.receiver.as_ref().is_some_and(|h| h.is_finished()) {
            self.stop_receiver().await;
        }

        // A paused engine is never busy; only poll while audio should be playing
        if self.session.state() == SessionState::Playing
            && self.session.pending() != Some(RequestKind::Pause)
        {
            self.queue.poll_idle();
        }

        let highest = self.signals.highest_sequence();
        self.state.update(|s| s.highest_sequence = highest);
    }

    async fn shutdown(&mut self) {
        let report = self.release().await;
        if report.deleted + report.failed > 0 {
            info!(
                "Shutdown removed {} segments ({} failed)",
                report.deleted, report.failed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, UdpSocket};

    use super::*;
    use crate::audio::audio_event_channel;
    use crate::audio::engine::fake::{EngineCall, RecordingEngine};
    use crate::audio::events::AudioEventSender;
    use crate::cache::{DiskStore, FailingStore, MemoryStore};
    use crate::client::ClientEventReceiver;
    use crate::rtp::RtpHeader;

    const WAIT: Duration = Duration::from_secs(5);

    type Script = Arc<dyn Fn(&str, u32) -> Vec<String> + Send + Sync>;

    fn reply(status: u16, cseq: u32, session: u64) -> String {
        let reason = if status == 200 { "OK" } else { "Not Found" };
        format!(
            "RTSP/1.0 {} {}\nCSeq: {}\nSession: {}\n",
            status, reason, cseq, session
        )
    }

    /// Loopback control server answering each three-line request via `script`
    async fn scripted_server(script: Script) -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                let mut current = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    current.push(line);
                    if current.len() < 3 {
                        continue;
                    }
                    let method = current[0].split(' ').next().unwrap_or_default().to_string();
                    let cseq = current[1]
                        .trim_start_matches("CSeq:")
                        .trim()
                        .parse::<u32>()
                        .unwrap();
                    log.lock().push(current.join("\n"));
                    for text in script(&method, cseq) {
                        write.write_all(text.as_bytes()).await.unwrap();
                    }
                    current.clear();
                }
            }
        });
        (port, requests)
    }

    struct Harness {
        client: ClientThreadHandle,
        events: ClientEventReceiver,
        engine: Arc<RecordingEngine>,
        _audio_tx: AudioEventSender,
        dir: tempfile::TempDir,
    }

    fn start(server_port: u16, threshold: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            server_host: "127.0.0.1".to_string(),
            server_port,
            rtp_port: 0,
            resource: "movie.mp3".to_string(),
            segment_threshold_bytes: threshold,
            receive_timeout_ms: 100,
            idle_poll_ms: 20,
            cache_dir: Some(dir.path().to_path_buf()),
            ..Settings::default()
        };
        let engine = Arc::new(RecordingEngine::new());
        let store = Arc::new(DiskStore::open(dir.path()).unwrap());
        let (audio_tx, audio_rx) = audio_event_channel();

        let mut client = spawn_client(settings, engine.clone(), audio_rx, store);
        let events = client.take_event_rx().unwrap();
        Harness {
            client,
            events,
            engine,
            _audio_tx: audio_tx,
            dir,
        }
    }

    async fn wait_for<F>(events: &mut ClientEventReceiver, mut matches: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for_state(events: &mut ClientEventReceiver, state: SessionState) {
        wait_for(events, |e| matches!(e, ClientEvent::StateChanged { new, .. } if *new == state))
            .await;
    }

    async fn send_payload(port: u16, packets: u16, size: usize) {
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        for seq in 0..packets {
            let datagram = RtpHeader::new(seq, 0, 1).encode_with(&vec![seq as u8; size]);
            sender
                .send_to(&datagram, (Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap();
            if seq % 10 == 9 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    }

    fn always_ok() -> Script {
        Arc::new(|_, cseq| vec![reply(200, cseq, 9987)])
    }

    #[tokio::test]
    async fn test_full_session_streams_and_cleans_up() {
        let (port, requests) = scripted_server(always_ok()).await;
        let mut h = start(port, 150_000);

        wait_for(&mut h.events, |e| matches!(e, ClientEvent::Connected { .. })).await;
        h.client.handle.setup();
        wait_for_state(&mut h.events, SessionState::Ready).await;
        let snapshot = h.client.handle.snapshot();
        assert_eq!(snapshot.session_id, 9987);
        let data_port = snapshot.data_port.unwrap();

        h.client.handle.play();
        wait_for_state(&mut h.events, SessionState::Playing).await;

        send_payload(data_port, 50, 4000).await;
        let ready = wait_for(&mut h.events, |e| matches!(e, ClientEvent::SegmentReady { .. })).await;
        assert_eq!(
            ready,
            ClientEvent::SegmentReady {
                index: 0,
                bytes: 150_000
            }
        );
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = h.client.handle.snapshot();
                if snapshot.buffered_bytes == 50_000 && snapshot.highest_sequence == 49 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("remaining bytes never buffered");

        let first = h.dir.path().join("cache-9987-0.mp3");
        assert_eq!(std::fs::metadata(&first).unwrap().len(), 150_000);
        assert_eq!(
            &h.engine.calls()[..2],
            &[EngineCall::Load(first.clone()), EngineCall::PlayImmediately]
        );

        h.client.handle.pause();
        wait_for_state(&mut h.events, SessionState::Ready).await;
        let stopped = tokio::time::timeout(
            Duration::from_millis(500),
            wait_for(&mut h.events, |e| matches!(e, ClientEvent::ReceiverStopped { .. })),
        )
        .await
        .expect("receiver did not stop within one tick");
        assert_eq!(
            stopped,
            ClientEvent::ReceiverStopped {
                reason: ExitReason::Paused
            }
        );

        h.client.handle.teardown();
        let torn = wait_for(&mut h.events, |e| matches!(e, ClientEvent::TornDown { .. })).await;
        // The full segment plus the partial one persisted on teardown
        assert_eq!(torn, ClientEvent::TornDown { deleted: 2, failed: 0 });
        assert_eq!(h.client.handle.snapshot().state, SessionState::Init);
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);

        let calls = h.engine.calls();
        assert!(calls.contains(&EngineCall::Pause));
        assert_eq!(calls.last(), Some(&EngineCall::Stop));

        let requests = requests.lock().clone();
        assert_eq!(
            requests,
            vec![
                "SETUP movie.mp3 RTSP/1.0\nCSeq: 1\nTransport: RTP/UDP; client_port= 0",
                "PLAY movie.mp3 RTSP/1.0\nCSeq: 2\nSession: 9987",
                "PAUSE movie.mp3 RTSP/1.0\nCSeq: 3\nSession: 9987",
                "TEARDOWN movie.mp3 RTSP/1.0\nCSeq: 4\nSession: 9987",
            ]
        );

        h.client.join().await;
    }

    #[tokio::test]
    async fn test_play_rejected_with_404() {
        let script: Script = Arc::new(|method, cseq| {
            let status = if method == "PLAY" { 404 } else { 200 };
            vec![reply(status, cseq, 9987)]
        });
        let (port, _requests) = scripted_server(script).await;
        let mut h = start(port, 1000);

        h.client.handle.setup();
        wait_for_state(&mut h.events, SessionState::Ready).await;

        h.client.handle.play();
        let error = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Error { .. })).await;
        assert_eq!(
            error,
            ClientEvent::Error {
                message: "PLAY rejected: 404 Not Found".to_string()
            }
        );
        wait_for(&mut h.events, |e| matches!(e, ClientEvent::ReceiverStopped { .. })).await;

        assert_eq!(h.client.handle.snapshot().state, SessionState::Ready);
        assert!(h.engine.calls().is_empty());

        h.client.join().await;
    }

    #[tokio::test]
    async fn test_stale_and_foreign_replies_are_ignored() {
        let script: Script = Arc::new(|method, cseq| match method {
            // A late duplicate of an older reply, then the real one
            "SETUP" => vec![reply(200, cseq + 7, 9987), reply(200, cseq, 9987)],
            // Only a reply for some other session
            _ => vec![reply(200, cseq, 1234)],
        });
        let (port, requests) = scripted_server(script).await;
        let mut h = start(port, 1000);

        h.client.handle.setup();
        wait_for_state(&mut h.events, SessionState::Ready).await;
        assert_eq!(h.client.handle.snapshot().session_id, 9987);

        h.client.handle.play();
        tokio::time::timeout(WAIT, async {
            while requests.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = h.client.handle.snapshot();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.session_id, 9987);
        while let Ok(event) = h.events.try_recv() {
            assert!(
                !matches!(event, ClientEvent::StateChanged { .. }),
                "unexpected {:?}",
                event
            );
        }

        h.client.join().await;
    }

    #[tokio::test]
    async fn test_wrong_state_commands_are_reported() {
        let (port, requests) = scripted_server(always_ok()).await;
        let mut h = start(port, 1000);

        h.client.handle.pause();
        let error = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Error { .. })).await;
        assert_eq!(
            error,
            ClientEvent::Error {
                message: "PAUSE is not allowed in state INIT".to_string()
            }
        );
        h.client.handle.setup();
        wait_for_state(&mut h.events, SessionState::Ready).await;

        // First request still carries CSeq 1
        assert!(requests.lock()[0].contains("CSeq: 1"));
        assert!(h.engine.calls().is_empty());

        h.client.join().await;
    }

    #[tokio::test]
    async fn test_connect_failure_then_setup_retries() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut h = start(port, 1000);

        wait_for(&mut h.events, |e| matches!(e, ClientEvent::Error { .. })).await;
        h.client.handle.setup();
        wait_for(&mut h.events, |e| matches!(e, ClientEvent::Error { .. })).await;

        let snapshot = h.client.handle.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(snapshot.state, SessionState::Init);

        h.client.join().await;
    }

    #[tokio::test]
    async fn test_setup_after_teardown_starts_fresh_session() {
        let (port, requests) = scripted_server(always_ok()).await;
        let mut h = start(port, 1000);

        h.client.handle.setup();
        wait_for_state(&mut h.events, SessionState::Ready).await;
        h.client.handle.teardown();
        wait_for(&mut h.events, |e| matches!(e, ClientEvent::TornDown { .. })).await;

        h.client.handle.setup();
        wait_for(&mut h.events, |e| matches!(e, ClientEvent::Connected { .. })).await;
        wait_for_state(&mut h.events, SessionState::Ready).await;

        let requests = requests.lock().clone();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].starts_with("SETUP movie.mp3 RTSP/1.0\nCSeq: 1\n"));

        h.client.join().await;
    }

    /// Coordinator driven directly, without a control server
    fn bare_coordinator(
        store: Arc<dyn SegmentStore>,
    ) -> (Coordinator, ClientEventReceiver, SharedClientState) {
        let settings = Settings {
            rtp_port: 0,
            resource: "movie.mp3".to_string(),
            segment_threshold_bytes: 10,
            receive_timeout_ms: 50,
            ..Settings::default()
        };
        let (event_tx, events) = client_event_channel();
        let (control_tx, _control_rx) = control_event_channel();
        let state = SharedClientState::new();
        let coordinator = Coordinator::new(
            settings,
            Arc::new(RecordingEngine::new()),
            store,
            control_tx,
            event_tx,
            state.clone(),
        );
        (coordinator, events, state)
    }

    fn drain(events: &mut ClientEventReceiver) -> Vec<ClientEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test]
    async fn test_transport_failure_closes_data_channel() {
        let (mut coordinator, mut events, state) =
            bare_coordinator(Arc::new(MemoryStore::new()));
        coordinator.open_data_channel().await;
        assert!(coordinator.data.is_some());
        assert!(state.snapshot().data_port.is_some());

        let pipeline = coordinator.pipeline.take().unwrap();
        let reason = coordinator.on_receiver_exit(ReceiverExit {
            pipeline,
            reason: ExitReason::TransportFailed,
            packets: 3,
        });

        assert_eq!(reason, ExitReason::TransportFailed);
        assert!(coordinator.data.is_none());
        assert!(coordinator.pipeline.is_some());
        assert_eq!(state.snapshot().data_port, None);
        assert_eq!(
            drain(&mut events),
            vec![
                ClientEvent::ReceiverStopped {
                    reason: ExitReason::TransportFailed
                },
                ClientEvent::Error {
                    message: "Data channel is not open".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_segments_of_aborted_receiver_are_purged() {
        let store = Arc::new(MemoryStore::new());
        let (mut coordinator, mut events, _state) = bare_coordinator(store.clone());
        coordinator.open_data_channel().await;

        // A receiver that wrote two segments and then never stops
        let mut pipeline = coordinator.pipeline.take().unwrap();
        coordinator.signals.set_receiving(true);
        pipeline.append(&[0; 25]);
        assert_eq!(store.len(), 2);
        coordinator.receiver = Some(tokio::spawn(async move {
            let _pipeline = pipeline;
            std::future::pending::<ReceiverExit>().await
        }));

        assert_eq!(coordinator.stop_receiver().await, None);
        let replacement = coordinator.pipeline.as_ref().unwrap();
        assert_eq!(replacement.segment_index(), 2);
        assert!(!coordinator.signals.is_receiving());

        coordinator.finish_session().await;
        assert!(store.is_empty());
        let drained = drain(&mut events);
        assert!(drained.iter().any(|e| matches!(
            e,
            ClientEvent::Error { message } if message.contains("did not stop")
        )));
        assert_eq!(
            drained.last(),
            Some(&ClientEvent::TornDown {
                deleted: 2,
                failed: 0
            })
        );
    }

    #[tokio::test]
    async fn test_teardown_reports_segments_left_behind() {
        let store = Arc::new(FailingStore::new());
        let (mut coordinator, mut events, _state) = bare_coordinator(store.clone());
        coordinator.open_data_channel().await;
        coordinator.signals.set_receiving(true);
        coordinator.pipeline.as_mut().unwrap().append(&[0; 20]);

        store.fail_deletes(true);
        coordinator.finish_session().await;

        let drained = drain(&mut events);
        let failures = drained
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ClientEvent::Error { message } if message.starts_with("Failed to delete")
                )
            })
            .count();
        assert_eq!(failures, 2);
        assert_eq!(
            drained.last(),
            Some(&ClientEvent::TornDown {
                deleted: 0,
                failed: 2
            })
        );
        assert_eq!(store.len(), 2);
    }
}
