use driftwood_proto::{
    ClientMessage, IceCandidate, Mode, ProtoError, ServerMessage, SessionDescription,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    engine::PeerEngine,
    negotiation::{Action, Input, NegotiationState, Negotiator, Step},
};

/// Runs the negotiation for one client. All inputs for a pairing are
/// serialized through a single driver task; engine work runs on a separate
/// worker task in the order the negotiator emitted it, so relayed messages
/// can arrive while an engine step is still in flight.
pub struct Negotiation {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<NegotiationState>,
    driver: JoinHandle<()>,
    worker: Option<JoinHandle<()>>,
}

impl Negotiation {
    pub fn spawn<E: PeerEngine>(
        engine: E,
        mode: Mode,
        signals: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);

        let worker = tokio::spawn(run_engine(engine, mode, jobs_rx, inputs_tx.clone()));
        let driver = tokio::spawn(drive(inputs_rx, jobs_tx, signals, state_tx));

        Self {
            inputs: inputs_tx,
            state: state_rx,
            driver,
            worker: Some(worker),
        }
    }

    /// Feeds a relayed server message. Returns false for messages that do
    /// not concern negotiation.
    pub fn handle_server_message(&self, message: &ServerMessage) -> bool {
        let input = match message {
            ServerMessage::Paired { initiator } => Input::Paired {
                initiator: *initiator,
            },
            ServerMessage::Offer { offer } => match SessionDescription::from_value(offer) {
                Ok(offer) => Input::RemoteOffer(offer),
                Err(err) => {
                    debug!(error = %err, "dropping unreadable offer");
                    return true;
                }
            },
            ServerMessage::Answer { answer } => match SessionDescription::from_value(answer) {
                Ok(answer) => Input::RemoteAnswer(answer),
                Err(err) => {
                    debug!(error = %err, "dropping unreadable answer");
                    return true;
                }
            },
            ServerMessage::Ice { candidate } => match IceCandidate::from_value(candidate) {
                Ok(candidate) => Input::RemoteCandidate(candidate),
                Err(err) => {
                    debug!(error = %err, "dropping unreadable candidate");
                    return true;
                }
            },
            ServerMessage::PartnerLeft => Input::Reset,
            ServerMessage::Waiting | ServerMessage::Chat { .. } => return false,
        };
        self.submit(input);
        true
    }

    /// Starts a new offer from a resting state.
    pub fn renegotiate(&self) {
        self.submit(Input::NegotiationNeeded);
    }

    /// Releases the peer connection; used on skip, leave and signaling loss.
    pub fn reset(&self) {
        self.submit(Input::Reset);
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Stops the driver and waits for the worker to release the engine.
    pub async fn close(mut self) {
        self.driver.abort();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    fn submit(&self, input: Input) {
        if self.inputs.send(input).is_err() {
            debug!("negotiation driver stopped; input dropped");
        }
    }
}

impl Drop for Negotiation {
    fn drop(&mut self) {
        // Dropping the driver closes the job queue, which ends the worker.
        self.driver.abort();
    }
}

async fn drive(
    mut inputs: mpsc::UnboundedReceiver<Input>,
    jobs: mpsc::UnboundedSender<Action>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    state: watch::Sender<NegotiationState>,
) {
    let mut negotiator = Negotiator::new();
    while let Some(input) = inputs.recv().await {
        for action in negotiator.handle(input) {
            let outgoing = match action {
                Action::SendOffer(offer) => ClientMessage::offer(&offer),
                Action::SendAnswer(answer) => ClientMessage::answer(&answer),
                Action::SendCandidate(candidate) => ClientMessage::ice(&candidate),
                job => {
                    if jobs.send(job).is_err() {
                        warn!("peer engine worker stopped");
                    }
                    continue;
                }
            };
            send_signal(&signals, outgoing);
        }
        state.send_replace(negotiator.state());
    }
}

fn send_signal(
    signals: &mpsc::UnboundedSender<ClientMessage>,
    message: Result<ClientMessage, ProtoError>,
) {
    match message {
        Ok(message) => {
            if signals.send(message).is_err() {
                debug!("signaling channel closed; negotiation message dropped");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode negotiation message"),
    }
}

async fn run_engine<E: PeerEngine>(
    mut engine: E,
    mode: Mode,
    mut jobs: mpsc::UnboundedReceiver<Action>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let mut forwarder: Option<JoinHandle<()>> = None;

    while let Some(job) = jobs.recv().await {
        let completion = match job {
            Action::Prepare { generation } => {
                if let Some(task) = forwarder.take() {
                    task.abort();
                }
                let (candidates_tx, mut candidates_rx) = mpsc::unbounded_channel();
                if let Err(err) = engine.prepare(mode, candidates_tx).await {
                    warn!(error = %err, "failed to prepare peer connection");
                }
                let inputs = inputs.clone();
                forwarder = Some(tokio::spawn(async move {
                    while let Some(candidate) = candidates_rx.recv().await {
                        let input = Input::LocalCandidate {
                            generation,
                            candidate,
                        };
                        if inputs.send(input).is_err() {
                            break;
                        }
                    }
                }));
                None
            }
            Action::CreateOffer { attempt } => Some(match engine.create_offer().await {
                Ok(offer) => Input::OfferCreated { attempt, offer },
                Err(err) => failed(attempt, Step::CreateOffer, err),
            }),
            Action::Rollback => {
                if let Err(err) = engine.rollback().await {
                    warn!(error = %err, "rollback failed");
                }
                None
            }
            Action::ApplyRemote {
                attempt,
                description,
            } => Some(match engine.set_remote_description(description).await {
                Ok(()) => Input::RemoteApplied { attempt },
                Err(err) => failed(attempt, Step::ApplyRemote, err),
            }),
            Action::CreateAnswer { attempt } => Some(match engine.create_answer().await {
                Ok(answer) => Input::AnswerCreated { attempt, answer },
                Err(err) => failed(attempt, Step::CreateAnswer, err),
            }),
            Action::AddCandidate(candidate) => {
                if let Err(err) = engine.add_ice_candidate(candidate).await {
                    warn!(error = %err, "failed to add remote ice candidate");
                }
                None
            }
            Action::Release => {
                if let Some(task) = forwarder.take() {
                    task.abort();
                }
                engine.release().await;
                None
            }
            Action::SendOffer(_) | Action::SendAnswer(_) | Action::SendCandidate(_) => None,
        };

        if let Some(input) = completion {
            if inputs.send(input).is_err() {
                break;
            }
        }
    }

    if let Some(task) = forwarder.take() {
        task.abort();
    }
    engine.release().await;
}

fn failed(attempt: u64, step: Step, err: impl std::fmt::Display) -> Input {
    Input::Failed {
        attempt,
        step,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use async_trait::async_trait;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct ScriptedEngine {
        recorder: Recorder,
        remote_failures: usize,
        candidates: Option<mpsc::UnboundedSender<IceCandidate>>,
    }

    #[async_trait]
    impl PeerEngine for ScriptedEngine {
        async fn prepare(
            &mut self,
            mode: Mode,
            candidates: mpsc::UnboundedSender<IceCandidate>,
        ) -> Result<(), EngineError> {
            self.recorder.calls.lock().unwrap().push(format!("prepare {mode}"));
            let _ = candidates.send(IceCandidate {
                candidate: "candidate:local".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            });
            self.candidates = Some(candidates);
            Ok(())
        }

        async fn create_offer(&mut self) -> Result<SessionDescription, EngineError> {
            self.recorder.calls.lock().unwrap().push("offer".into());
            Ok(SessionDescription::offer("local-offer"))
        }

        async fn rollback(&mut self) -> Result<(), EngineError> {
            self.recorder.calls.lock().unwrap().push("rollback".into());
            Ok(())
        }

        async fn set_remote_description(
            &mut self,
            description: SessionDescription,
        ) -> Result<(), EngineError> {
            self.recorder
                .calls
                .lock()
                .unwrap()
                .push(format!("remote {}", description.sdp));
            if self.remote_failures > 0 {
                self.remote_failures -= 1;
                return Err(EngineError::operation("set remote description", "bad sdp"));
            }
            Ok(())
        }

        async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
            self.recorder.calls.lock().unwrap().push("answer".into());
            Ok(SessionDescription::answer("local-answer"))
        }

        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError> {
            self.recorder
                .calls
                .lock()
                .unwrap()
                .push(format!("candidate {}", candidate.candidate));
            Ok(())
        }

        async fn release(&mut self) {
            if self.candidates.take().is_some() {
                self.recorder.calls.lock().unwrap().push("release".into());
            }
        }
    }

    fn spawn(
        remote_failures: usize,
    ) -> (Negotiation, Recorder, mpsc::UnboundedReceiver<ClientMessage>) {
        let recorder = Recorder::default();
        let engine = ScriptedEngine {
            recorder: recorder.clone(),
            remote_failures,
            candidates: None,
        };
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let negotiation = Negotiation::spawn(engine, Mode::Video, signals_tx);
        (negotiation, recorder, signals_rx)
    }

    async fn wait_for(negotiation: &Negotiation, state: NegotiationState) {
        let mut watch = negotiation.subscribe();
        tokio::time::timeout(Duration::from_secs(2), watch.wait_for(|s| *s == state))
            .await
            .expect("state reached in time")
            .expect("driver alive");
    }

    async fn next_signal(signals: &mut mpsc::UnboundedReceiver<ClientMessage>) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("signal in time")
            .expect("signal channel open")
    }

    #[tokio::test]
    async fn responder_answers_relayed_offer() {
        let (negotiation, recorder, mut signals) = spawn(0);
        negotiation.handle_server_message(&ServerMessage::Paired { initiator: false });
        wait_for(&negotiation, NegotiationState::AwaitingOffer).await;

        // Local candidates gathered during prepare are trickled out.
        assert!(matches!(
            next_signal(&mut signals).await,
            ClientMessage::Ice { .. }
        ));

        let candidate = IceCandidate {
            candidate: "candidate:remote".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        negotiation.handle_server_message(&ServerMessage::Ice {
            candidate: candidate.to_value().unwrap(),
        });
        negotiation.handle_server_message(&ServerMessage::Offer {
            offer: SessionDescription::offer("remote-offer").to_value().unwrap(),
        });
        wait_for(&negotiation, NegotiationState::Stable).await;

        assert_eq!(
            next_signal(&mut signals).await,
            ClientMessage::answer(&SessionDescription::answer("local-answer")).unwrap()
        );
        assert_eq!(
            recorder.calls(),
            vec![
                "prepare video",
                "remote remote-offer",
                "candidate candidate:remote",
                "answer"
            ]
        );
    }

    #[tokio::test]
    async fn failed_remote_description_leaves_session_usable() {
        let (negotiation, recorder, mut signals) = spawn(1);
        negotiation.handle_server_message(&ServerMessage::Paired { initiator: false });
        negotiation.handle_server_message(&ServerMessage::Offer {
            offer: SessionDescription::offer("garbled").to_value().unwrap(),
        });
        negotiation.handle_server_message(&ServerMessage::Offer {
            offer: SessionDescription::offer("retry").to_value().unwrap(),
        });
        wait_for(&negotiation, NegotiationState::Stable).await;

        let mut answers = 0;
        while let Ok(message) = signals.try_recv() {
            if matches!(message, ClientMessage::Answer { .. }) {
                answers += 1;
            }
        }
        assert_eq!(answers, 1);
        let calls = recorder.calls();
        assert!(calls.contains(&"remote garbled".to_string()));
        assert!(calls.contains(&"remote retry".to_string()));
    }

    #[tokio::test]
    async fn partner_left_releases_engine() {
        let (negotiation, recorder, mut signals) = spawn(0);
        negotiation.handle_server_message(&ServerMessage::Paired { initiator: true });
        assert!(matches!(
            next_signal(&mut signals).await,
            ClientMessage::Ice { .. } | ClientMessage::Offer { .. }
        ));
        wait_for(&negotiation, NegotiationState::Offering).await;

        assert!(negotiation.handle_server_message(&ServerMessage::PartnerLeft));
        wait_for(&negotiation, NegotiationState::Idle).await;
        negotiation.close().await;
        assert_eq!(recorder.calls().last().map(String::as_str), Some("release"));
    }

    #[tokio::test]
    async fn chat_traffic_is_not_consumed() {
        let (negotiation, _recorder, _signals) = spawn(0);
        assert!(!negotiation.handle_server_message(&ServerMessage::Waiting));
        assert!(!negotiation.handle_server_message(&ServerMessage::Chat { text: "hi".into() }));
    }
}
