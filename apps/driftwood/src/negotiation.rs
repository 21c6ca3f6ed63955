//! Offer/answer negotiation for one pairing, with glare resolution.
//!
//! [`Negotiator`] performs no I/O. It consumes [`Input`]s (relayed messages,
//! local triggers and completions of engine work) and returns the
//! [`Action`]s the caller must perform. Engine work is tagged with an attempt
//! number; completions carrying an older attempt are discarded, which is how
//! a rolled-back offer is kept off the wire.
//!
//! The side the server marked as initiator is impolite: it ignores an offer
//! that collides with its own. The responder is polite: it rolls its own
//! offer back and answers the remote one.

use std::{collections::VecDeque, fmt};

use driftwood_proto::{IceCandidate, SessionDescription};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    Offering,
    AwaitingOffer,
    Answering,
    Stable,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingOffer => "awaiting-offer",
            NegotiationState::Answering => "answering",
            NegotiationState::Stable => "stable",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn from_initiator(initiator: bool) -> Self {
        if initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn is_polite(self) -> bool {
        matches!(self, Role::Responder)
    }

    fn label(self) -> &'static str {
        if self.is_polite() {
            "polite"
        } else {
            "impolite"
        }
    }
}

/// Engine steps whose failure changes negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateOffer,
    ApplyRemote,
    CreateAnswer,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::CreateOffer => "create-offer",
            Step::ApplyRemote => "apply-remote",
            Step::CreateAnswer => "create-answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Paired { initiator: bool },
    NegotiationNeeded,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    /// Gathered by the peer connection built for `generation`.
    LocalCandidate {
        generation: u64,
        candidate: IceCandidate,
    },
    /// Offer created and installed as the local description.
    OfferCreated { attempt: u64, offer: SessionDescription },
    RemoteApplied { attempt: u64 },
    /// Answer created and installed as the local description.
    AnswerCreated { attempt: u64, answer: SessionDescription },
    Failed { attempt: u64, step: Step, reason: String },
    /// Partner left, local leave, or signaling lost.
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create the peer connection and attach local media. Its candidates
    /// come back tagged with `generation`.
    Prepare { generation: u64 },
    CreateOffer { attempt: u64 },
    Rollback,
    ApplyRemote {
        attempt: u64,
        description: SessionDescription,
    },
    CreateAnswer { attempt: u64 },
    AddCandidate(IceCandidate),
    SendOffer(SessionDescription),
    SendAnswer(SessionDescription),
    SendCandidate(IceCandidate),
    /// Close the peer connection and drop local media.
    Release,
}

impl Action {
    /// True for actions that go out over signaling rather than to the engine.
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            Action::SendOffer(_) | Action::SendAnswer(_) | Action::SendCandidate(_)
        )
    }
}

#[derive(Debug, Default)]
pub struct Negotiator {
    role: Option<Role>,
    state: NegotiationState,
    attempt: u64,
    generation: u64,
    making_offer: bool,
    ignore_offer: bool,
    applying_remote: bool,
    remote_established: bool,
    negotiated: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Peer connection generation; bumped on every pairing.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::Paired { initiator } => self.on_paired(initiator),
            Input::NegotiationNeeded => self.on_negotiation_needed(),
            Input::RemoteOffer(offer) => self.on_remote_offer(offer),
            Input::RemoteAnswer(answer) => self.on_remote_answer(answer),
            Input::RemoteCandidate(candidate) => self.on_remote_candidate(candidate),
            Input::LocalCandidate {
                generation,
                candidate,
            } => {
                if self.role.is_none() || generation != self.generation {
                    debug!(generation, current = self.generation, "dropping stale local candidate");
                    return Vec::new();
                }
                vec![Action::SendCandidate(candidate)]
            }
            Input::OfferCreated { attempt, offer } => self.on_offer_created(attempt, offer),
            Input::RemoteApplied { attempt } => self.on_remote_applied(attempt),
            Input::AnswerCreated { attempt, answer } => self.on_answer_created(attempt, answer),
            Input::Failed {
                attempt,
                step,
                reason,
            } => self.on_failed(attempt, step, reason),
            Input::Reset => self.reset(),
        }
    }

    fn on_paired(&mut self, initiator: bool) -> Vec<Action> {
        let mut actions = self.reset();
        let role = Role::from_initiator(initiator);
        self.role = Some(role);
        self.generation += 1;
        actions.push(Action::Prepare {
            generation: self.generation,
        });
        match role {
            Role::Initiator => actions.push(self.begin_offer()),
            Role::Responder => self.state = NegotiationState::AwaitingOffer,
        }
        debug!(role = role.label(), state = %self.state, "negotiation started");
        actions
    }

    fn on_negotiation_needed(&mut self) -> Vec<Action> {
        let resting = matches!(
            self.state,
            NegotiationState::AwaitingOffer | NegotiationState::Stable
        );
        if !resting || self.making_offer || self.applying_remote {
            debug!(state = %self.state, "negotiation already in progress");
            return Vec::new();
        }
        vec![self.begin_offer()]
    }

    fn begin_offer(&mut self) -> Action {
        self.attempt += 1;
        self.making_offer = true;
        self.state = NegotiationState::Offering;
        Action::CreateOffer {
            attempt: self.attempt,
        }
    }

    fn on_offer_created(&mut self, attempt: u64, offer: SessionDescription) -> Vec<Action> {
        if attempt != self.attempt || self.state != NegotiationState::Offering {
            debug!(attempt, current = self.attempt, "discarding superseded local offer");
            return Vec::new();
        }
        self.making_offer = false;
        vec![Action::SendOffer(offer)]
    }

    fn on_remote_offer(&mut self, offer: SessionDescription) -> Vec<Action> {
        let Some(role) = self.role else {
            debug!("offer received while unpaired");
            return Vec::new();
        };
        let local_offer = self.making_offer || self.state == NegotiationState::Offering;
        let collision =
            local_offer || self.applying_remote || self.state == NegotiationState::Answering;

        self.ignore_offer = !role.is_polite() && collision;
        if self.ignore_offer {
            debug!(role = role.label(), state = %self.state, "ignoring colliding offer");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if local_offer {
            debug!(role = role.label(), "rolling back local offer");
            self.making_offer = false;
            actions.push(Action::Rollback);
        }
        self.attempt += 1;
        self.state = NegotiationState::Answering;
        self.applying_remote = true;
        actions.push(Action::ApplyRemote {
            attempt: self.attempt,
            description: offer,
        });
        actions
    }

    fn on_remote_answer(&mut self, answer: SessionDescription) -> Vec<Action> {
        if self.state != NegotiationState::Offering || self.making_offer || self.applying_remote {
            debug!(state = %self.state, "ignoring stale answer");
            return Vec::new();
        }
        self.applying_remote = true;
        vec![Action::ApplyRemote {
            attempt: self.attempt,
            description: answer,
        }]
    }

    fn on_remote_applied(&mut self, attempt: u64) -> Vec<Action> {
        if attempt != self.attempt || !self.applying_remote {
            debug!(attempt, current = self.attempt, "discarding superseded remote description");
            return Vec::new();
        }
        self.applying_remote = false;
        self.remote_established = true;

        let mut actions: Vec<Action> = self
            .pending_candidates
            .drain(..)
            .map(Action::AddCandidate)
            .collect();
        match self.state {
            NegotiationState::Answering => actions.push(Action::CreateAnswer { attempt }),
            NegotiationState::Offering => {
                self.state = NegotiationState::Stable;
                self.negotiated = true;
            }
            _ => {}
        }
        actions
    }

    fn on_answer_created(&mut self, attempt: u64, answer: SessionDescription) -> Vec<Action> {
        if attempt != self.attempt || self.state != NegotiationState::Answering {
            debug!(attempt, current = self.attempt, "discarding superseded local answer");
            return Vec::new();
        }
        self.state = NegotiationState::Stable;
        self.negotiated = true;
        self.ignore_offer = false;
        vec![Action::SendAnswer(answer)]
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        if self.role.is_none() {
            return Vec::new();
        }
        if self.remote_established {
            vec![Action::AddCandidate(candidate)]
        } else {
            self.pending_candidates.push_back(candidate);
            Vec::new()
        }
    }

    fn on_failed(&mut self, attempt: u64, step: Step, reason: String) -> Vec<Action> {
        if attempt != self.attempt || self.role.is_none() {
            debug!(attempt, step = step.as_str(), %reason, "superseded step failed");
            return Vec::new();
        }
        self.making_offer = false;
        self.applying_remote = false;
        self.state = if self.negotiated {
            NegotiationState::Stable
        } else {
            NegotiationState::AwaitingOffer
        };
        warn!(
            step = step.as_str(),
            %reason,
            state = %self.state,
            "negotiation step failed"
        );
        Vec::new()
    }

    fn reset(&mut self) -> Vec<Action> {
        if self.role.is_none() && self.state == NegotiationState::Idle {
            return Vec::new();
        }
        *self = Negotiator {
            attempt: self.attempt + 1,
            generation: self.generation,
            ..Negotiator::default()
        };
        vec![Action::Release]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn local(generation: u64, candidate: IceCandidate) -> Input {
        Input::LocalCandidate {
            generation,
            candidate,
        }
    }

    fn responder_with_remote_offer() -> (Negotiator, u64) {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: false });
        let actions = n.handle(Input::RemoteOffer(SessionDescription::offer("remote")));
        let Some(Action::ApplyRemote { attempt, .. }) = actions.last() else {
            panic!("expected apply, got {actions:?}");
        };
        (n, *attempt)
    }

    #[test]
    fn initiator_prepares_then_offers() {
        let mut n = Negotiator::new();
        let actions = n.handle(Input::Paired { initiator: true });
        assert_eq!(
            actions,
            vec![
                Action::Prepare { generation: 1 },
                Action::CreateOffer { attempt: 1 }
            ]
        );
        assert_eq!(n.state(), NegotiationState::Offering);
        assert_eq!(n.role(), Some(Role::Initiator));

        let actions = n.handle(Input::OfferCreated {
            attempt: 1,
            offer: SessionDescription::offer("local"),
        });
        assert_eq!(actions, vec![Action::SendOffer(SessionDescription::offer("local"))]);

        let actions = n.handle(Input::RemoteAnswer(SessionDescription::answer("remote")));
        assert_eq!(
            actions,
            vec![Action::ApplyRemote {
                attempt: 1,
                description: SessionDescription::answer("remote"),
            }]
        );
        assert!(n.handle(Input::RemoteApplied { attempt: 1 }).is_empty());
        assert_eq!(n.state(), NegotiationState::Stable);
    }

    #[test]
    fn responder_answers_once_remote_offer_is_applied() {
        let (mut n, attempt) = responder_with_remote_offer();
        assert_eq!(n.state(), NegotiationState::Answering);

        assert_eq!(
            n.handle(Input::RemoteApplied { attempt }),
            vec![Action::CreateAnswer { attempt }]
        );
        assert_eq!(
            n.handle(Input::AnswerCreated {
                attempt,
                answer: SessionDescription::answer("local"),
            }),
            vec![Action::SendAnswer(SessionDescription::answer("local"))]
        );
        assert_eq!(n.state(), NegotiationState::Stable);
    }

    #[test]
    fn impolite_side_ignores_colliding_offer() {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: true });

        // Still creating its own offer.
        assert!(n
            .handle(Input::RemoteOffer(SessionDescription::offer("remote")))
            .is_empty());

        n.handle(Input::OfferCreated {
            attempt: 1,
            offer: SessionDescription::offer("local"),
        });
        // Offer outstanding.
        assert!(n
            .handle(Input::RemoteOffer(SessionDescription::offer("remote")))
            .is_empty());
        assert_eq!(n.state(), NegotiationState::Offering);
    }

    #[test]
    fn polite_side_rolls_back_and_never_sends_its_offer() {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: false });
        assert_eq!(
            n.handle(Input::NegotiationNeeded),
            vec![Action::CreateOffer { attempt: 1 }]
        );

        let actions = n.handle(Input::RemoteOffer(SessionDescription::offer("remote")));
        assert_eq!(
            actions,
            vec![
                Action::Rollback,
                Action::ApplyRemote {
                    attempt: 2,
                    description: SessionDescription::offer("remote"),
                },
            ]
        );

        // The engine finishes the superseded offer after the collision.
        assert!(n
            .handle(Input::OfferCreated {
                attempt: 1,
                offer: SessionDescription::offer("local"),
            })
            .is_empty());
        assert_eq!(n.state(), NegotiationState::Answering);
    }

    #[test]
    fn polite_side_rolls_back_an_offer_already_sent() {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: false });
        n.handle(Input::NegotiationNeeded);
        n.handle(Input::OfferCreated {
            attempt: 1,
            offer: SessionDescription::offer("local"),
        });

        let actions = n.handle(Input::RemoteOffer(SessionDescription::offer("remote")));
        assert_eq!(actions.first(), Some(&Action::Rollback));
        // A late answer to the rolled-back offer is stale.
        assert!(n
            .handle(Input::RemoteAnswer(SessionDescription::answer("late")))
            .is_empty());
    }

    #[test]
    fn answer_without_outstanding_offer_is_ignored() {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: false });
        assert!(n
            .handle(Input::RemoteAnswer(SessionDescription::answer("stray")))
            .is_empty());
        assert_eq!(n.state(), NegotiationState::AwaitingOffer);

        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: true });
        n.handle(Input::OfferCreated {
            attempt: 1,
            offer: SessionDescription::offer("local"),
        });
        n.handle(Input::RemoteAnswer(SessionDescription::answer("first")));
        // Second answer while the first is still being applied.
        assert!(n
            .handle(Input::RemoteAnswer(SessionDescription::answer("second")))
            .is_empty());
    }

    #[test]
    fn candidates_wait_for_remote_description_and_keep_order() {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: false });
        assert!(n.handle(Input::RemoteCandidate(candidate(1))).is_empty());
        assert!(n.handle(Input::RemoteCandidate(candidate(2))).is_empty());

        let actions = n.handle(Input::RemoteOffer(SessionDescription::offer("remote")));
        assert_eq!(actions.len(), 1);
        assert!(n.handle(Input::RemoteCandidate(candidate(3))).is_empty());
        assert_eq!(n.pending_candidates(), 3);

        let attempt = n.attempt();
        assert_eq!(
            n.handle(Input::RemoteApplied { attempt }),
            vec![
                Action::AddCandidate(candidate(1)),
                Action::AddCandidate(candidate(2)),
                Action::AddCandidate(candidate(3)),
                Action::CreateAnswer { attempt },
            ]
        );
        assert_eq!(n.pending_candidates(), 0);
        assert_eq!(
            n.handle(Input::RemoteCandidate(candidate(4))),
            vec![Action::AddCandidate(candidate(4))]
        );
    }

    #[test]
    fn local_candidates_are_signalled_only_while_paired() {
        let mut n = Negotiator::new();
        assert!(n.handle(local(0, candidate(1))).is_empty());
        n.handle(Input::Paired { initiator: true });
        assert_eq!(
            n.handle(local(1, candidate(1))),
            vec![Action::SendCandidate(candidate(1))]
        );
    }

    #[test]
    fn candidates_from_a_released_peer_never_reach_the_next_partner() {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: true });
        let first = n.generation();
        n.handle(Input::Reset);
        // Still queued from the old peer connection when the next pairing lands.
        assert!(n.handle(local(first, candidate(1))).is_empty());
        n.handle(Input::Paired { initiator: false });
        assert!(n.handle(local(first, candidate(2))).is_empty());
        assert_eq!(
            n.handle(local(n.generation(), candidate(3))),
            vec![Action::SendCandidate(candidate(3))]
        );
    }

    #[test]
    fn failure_returns_to_resting_state() {
        let (mut n, attempt) = responder_with_remote_offer();
        assert!(n
            .handle(Input::Failed {
                attempt,
                step: Step::ApplyRemote,
                reason: "bad sdp".into(),
            })
            .is_empty());
        assert_eq!(n.state(), NegotiationState::AwaitingOffer);

        // A fresh offer is still accepted afterwards.
        let actions = n.handle(Input::RemoteOffer(SessionDescription::offer("retry")));
        assert!(matches!(actions.as_slice(), [Action::ApplyRemote { .. }]));
    }

    #[test]
    fn failure_after_negotiation_keeps_stable() {
        let (mut n, attempt) = responder_with_remote_offer();
        n.handle(Input::RemoteApplied { attempt });
        n.handle(Input::AnswerCreated {
            attempt,
            answer: SessionDescription::answer("a"),
        });
        n.handle(Input::NegotiationNeeded);
        n.handle(Input::Failed {
            attempt: n.attempt(),
            step: Step::CreateOffer,
            reason: "no tracks".into(),
        });
        assert_eq!(n.state(), NegotiationState::Stable);
    }

    #[test]
    fn reset_releases_and_discards_late_completions() {
        let (mut n, attempt) = responder_with_remote_offer();
        assert_eq!(n.handle(Input::Reset), vec![Action::Release]);
        assert_eq!(n.state(), NegotiationState::Idle);
        assert!(n.handle(Input::Reset).is_empty());

        assert!(n.handle(Input::RemoteApplied { attempt }).is_empty());
        assert!(n
            .handle(Input::AnswerCreated {
                attempt,
                answer: SessionDescription::answer("late"),
            })
            .is_empty());
        assert!(n.handle(Input::RemoteCandidate(candidate(1))).is_empty());
        assert_eq!(n.pending_candidates(), 0);
    }

    #[test]
    fn pairing_again_releases_the_previous_peer() {
        let mut n = Negotiator::new();
        n.handle(Input::Paired { initiator: true });
        let actions = n.handle(Input::Paired { initiator: false });
        assert_eq!(
            actions,
            vec![Action::Release, Action::Prepare { generation: 2 }]
        );
        assert_eq!(n.role(), Some(Role::Responder));
        assert_eq!(n.state(), NegotiationState::AwaitingOffer);
    }

    /// Two negotiators wired through in-memory signaling and an engine that
    /// completes every step successfully, in FIFO order.
    struct SimPeer {
        negotiator: Negotiator,
        label: &'static str,
        engine_queue: VecDeque<Action>,
        engine_log: Vec<Action>,
        outbox: VecDeque<Action>,
        sent: Vec<Action>,
    }

    impl SimPeer {
        fn new(label: &'static str) -> Self {
            Self {
                negotiator: Negotiator::new(),
                label,
                engine_queue: VecDeque::new(),
                engine_log: Vec::new(),
                outbox: VecDeque::new(),
                sent: Vec::new(),
            }
        }

        fn feed(&mut self, input: Input) {
            for action in self.negotiator.handle(input) {
                if action.is_signal() {
                    self.sent.push(action.clone());
                    self.outbox.push_back(action);
                } else {
                    self.engine_queue.push_back(action);
                }
            }
        }

        fn run_engine(&mut self) {
            while let Some(action) = self.engine_queue.pop_front() {
                self.engine_log.push(action.clone());
                let completion = match action {
                    Action::CreateOffer { attempt } => Some(Input::OfferCreated {
                        attempt,
                        offer: SessionDescription::offer(format!("{}-{attempt}", self.label)),
                    }),
                    Action::ApplyRemote { attempt, .. } => Some(Input::RemoteApplied { attempt }),
                    Action::CreateAnswer { attempt } => Some(Input::AnswerCreated {
                        attempt,
                        answer: SessionDescription::answer(format!("{}-{attempt}", self.label)),
                    }),
                    _ => None,
                };
                if let Some(input) = completion {
                    self.feed(input);
                }
            }
        }

        fn offers_sent(&self) -> usize {
            self.sent
                .iter()
                .filter(|a| matches!(a, Action::SendOffer(_)))
                .count()
        }

        fn answers_sent(&self) -> usize {
            self.sent
                .iter()
                .filter(|a| matches!(a, Action::SendAnswer(_)))
                .count()
        }
    }

    fn deliver(from: &mut SimPeer, to: &mut SimPeer) {
        while let Some(action) = from.outbox.pop_front() {
            let input = match action {
                Action::SendOffer(offer) => Input::RemoteOffer(offer),
                Action::SendAnswer(answer) => Input::RemoteAnswer(answer),
                Action::SendCandidate(candidate) => Input::RemoteCandidate(candidate),
                _ => continue,
            };
            to.feed(input);
        }
    }

    fn settle(a: &mut SimPeer, b: &mut SimPeer) {
        for _ in 0..8 {
            a.run_engine();
            b.run_engine();
            deliver(a, b);
            deliver(b, a);
        }
    }

    fn paired_and_stable() -> (SimPeer, SimPeer) {
        let mut impolite = SimPeer::new("impolite");
        let mut polite = SimPeer::new("polite");
        polite.feed(Input::Paired { initiator: false });
        impolite.feed(Input::Paired { initiator: true });
        settle(&mut impolite, &mut polite);
        assert_eq!(impolite.negotiator.state(), NegotiationState::Stable);
        assert_eq!(polite.negotiator.state(), NegotiationState::Stable);
        (impolite, polite)
    }

    #[test]
    fn simultaneous_renegotiation_converges_with_one_answer() {
        let (mut impolite, mut polite) = paired_and_stable();
        let (imp_answers, pol_answers) = (impolite.answers_sent(), polite.answers_sent());

        impolite.feed(Input::NegotiationNeeded);
        polite.feed(Input::NegotiationNeeded);
        impolite.run_engine();
        polite.run_engine();
        // Both offers are on the wire before either side sees the other's.
        assert_eq!(impolite.outbox.len(), 1);
        assert_eq!(polite.outbox.len(), 1);
        deliver(&mut impolite, &mut polite);
        deliver(&mut polite, &mut impolite);
        settle(&mut impolite, &mut polite);

        assert_eq!(impolite.negotiator.state(), NegotiationState::Stable);
        assert_eq!(polite.negotiator.state(), NegotiationState::Stable);
        assert_eq!(polite.answers_sent(), pol_answers + 1);
        assert_eq!(impolite.answers_sent(), imp_answers);

        let rollback = polite
            .engine_log
            .iter()
            .rposition(|a| *a == Action::Rollback)
            .expect("polite side rolled back");
        assert!(matches!(
            polite.engine_log[rollback + 1],
            Action::ApplyRemote { .. }
        ));
        assert!(!impolite.engine_log.contains(&Action::Rollback));
    }

    #[test]
    fn offer_superseded_before_creation_never_leaves_polite_side() {
        let (mut impolite, mut polite) = paired_and_stable();
        let polite_offers = polite.offers_sent();

        polite.feed(Input::NegotiationNeeded);
        impolite.feed(Input::NegotiationNeeded);
        impolite.run_engine();
        // The impolite offer lands while the polite offer is still being created.
        deliver(&mut impolite, &mut polite);
        settle(&mut impolite, &mut polite);

        assert_eq!(polite.offers_sent(), polite_offers);
        assert_eq!(impolite.negotiator.state(), NegotiationState::Stable);
        assert_eq!(polite.negotiator.state(), NegotiationState::Stable);
    }

    #[test]
    fn candidates_trickled_before_offer_survive_the_exchange() {
        let mut impolite = SimPeer::new("impolite");
        let mut polite = SimPeer::new("polite");
        polite.feed(Input::Paired { initiator: false });
        impolite.feed(Input::Paired { initiator: true });
        let generation = impolite.negotiator.generation();
        impolite.feed(local(generation, candidate(7)));
        impolite.feed(local(generation, candidate(8)));
        // Candidates overtake the offer on the wire.
        deliver(&mut impolite, &mut polite);
        settle(&mut impolite, &mut polite);

        let added: Vec<_> = polite
            .engine_log
            .iter()
            .filter_map(|a| match a {
                Action::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec![candidate(7), candidate(8)]);
        assert_eq!(polite.negotiator.state(), NegotiationState::Stable);
    }
}
