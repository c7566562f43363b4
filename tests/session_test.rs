// Integration tests for the proctor and candidate roles
// Both roles run against an in-process coordination server with synthetic media

mod common;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

use common::{eventually, MockServer, STEP};
use proctor_session::config::IceConfig;
use proctor_session::identity::Role;
use proctor_session::media::SyntheticDevices;
use proctor_session::peer::{NegotiationState, PeerSessionManager};
use proctor_session::session::{
    CandidateRole, CandidateSession, ExamState, ProctorRole, ProctorSession, SessionEvent,
};
use proctor_session::signaling::{
    ConnectionState, ExamResult, ReconnectPolicy, SignalPayload, SignalingChannel,
};
use proctor_session::SessionError;

const PROCTOR_ID: i64 = 1;
const CANDIDATE_ID: i64 = 7;

fn peers() -> Arc<PeerSessionManager> {
    Arc::new(
        PeerSessionManager::from_ice_config(&IceConfig::default(), Arc::new(SyntheticDevices::new()))
            .unwrap(),
    )
}

fn channel(server: &MockServer, role: Role, id: i64) -> Arc<SignalingChannel> {
    Arc::new(SignalingChannel::new(
        server.endpoint(role, id, "test-token"),
        ReconnectPolicy::fixed(Duration::from_millis(100)),
    ))
}

async fn start_proctor(
    server: &MockServer,
) -> (Arc<ProctorSession>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (session, events) = ProctorSession::new(
        channel(server, Role::Proctor, PROCTOR_ID),
        peers(),
        ProctorRole::new(2),
    );
    session.initialize_media(true, true).await.unwrap();
    session.start().await;
    (session, events)
}

async fn start_candidate(
    server: &MockServer,
) -> (Arc<CandidateSession>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (session, events) = CandidateSession::new(
        channel(server, Role::Candidate, CANDIDATE_ID),
        peers(),
        CandidateRole::new(),
    );
    session.initialize_media(true, false).await.unwrap();
    session.start().await;
    (session, events)
}

async fn next_matching<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, mut wanted: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = timeout(STEP, events.recv())
            .await
            .expect("no session event in time")
            .expect("event stream closed");
        if wanted(&event) {
            return event;
        }
    }
}

/// A joining candidate gets an offer addressed to it, and nothing about the
/// connection reaches it before that offer
#[tokio::test]
async fn test_proctor_offers_to_joining_candidate() {
    let mut server = MockServer::start().await;
    let (proctor, mut events) = start_proctor(&server).await;

    let mut conn = server.accept().await;
    let join = conn.recv().await;
    assert_eq!(join.event, "join-request");
    assert_eq!(join.participant, PROCTOR_ID);

    conn.send_payload(&SignalPayload::JoinRequest, CANDIDATE_ID, CANDIDATE_ID).await;

    let offer = conn.recv().await;
    assert_eq!(offer.event, "webrtc-offer");
    assert_eq!(offer.participant, CANDIDATE_ID);
    assert_eq!(offer.sender_id.as_deref(), Some("1"));
    match offer.payload().unwrap() {
        SignalPayload::Offer(description) => {
            assert_eq!(description.sdp_type, RTCSdpType::Offer);
            assert!(description.sdp.contains("m=video"));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    next_matching(&mut events, |e| matches!(e, SessionEvent::ParticipantJoined(CANDIDATE_ID))).await;
    assert_eq!(proctor.participants().len(), 1);
    assert_eq!(
        proctor.peers().session_state(CANDIDATE_ID).await,
        Some(NegotiationState::LocalOfferCreated)
    );

    // Announcing again re-sends the pending offer instead of starting over
    conn.send_payload(&SignalPayload::JoinRequest, CANDIDATE_ID, CANDIDATE_ID).await;
    let again = conn.recv_event("webrtc-offer").await;
    assert_eq!(again.participant, CANDIDATE_ID);
    assert!(matches!(again.payload().unwrap(), SignalPayload::Offer(_)));
    assert_eq!(proctor.participants().len(), 1);
    assert_eq!(proctor.peers().participants().await, vec![CANDIDATE_ID]);

    proctor.shutdown().await;
}

/// The candidate answers the proctor's offer, unlocks on start-exam, and
/// reports its result
#[tokio::test]
async fn test_candidate_answers_and_completes_exam() {
    let mut server = MockServer::start().await;
    let (candidate, mut events) = start_candidate(&server).await;

    let mut conn = server.accept().await;
    let join = conn.recv().await;
    assert_eq!(join.event, "join-request");
    assert_eq!(join.participant, CANDIDATE_ID);

    // The test plays the proctor's peer side
    let proctor_peers = peers();
    proctor_peers.initialize_local_stream(true, true).await.unwrap();
    proctor_peers.create_peer_session(CANDIDATE_ID).await.unwrap();
    let offer = proctor_peers.create_offer(CANDIDATE_ID).await.unwrap();
    conn.send_payload(&SignalPayload::Offer(offer), CANDIDATE_ID, PROCTOR_ID).await;

    let answer = conn.recv_event("webrtc-answer").await;
    assert_eq!(answer.participant, CANDIDATE_ID);
    assert_eq!(answer.sender_id.as_deref(), Some("7"));
    let SignalPayload::Answer(description) = answer.payload().unwrap() else {
        panic!("answer payload expected");
    };
    proctor_peers.handle_answer(CANDIDATE_ID, description).await.unwrap();
    assert_eq!(candidate.role().proctor_id(), Some(PROCTOR_ID));
    assert!(candidate
        .peers()
        .session_state(PROCTOR_ID)
        .await
        .unwrap()
        .accepts_candidates());

    // Submitting before the exam is unlocked is refused
    let early = candidate
        .submit_result(ExamResult {
            score: 1,
            answers: vec![],
        })
        .await;
    assert!(matches!(early, Err(SessionError::ExamNotInProgress { .. })));

    conn.send_payload(&SignalPayload::StartExam, CANDIDATE_ID, PROCTOR_ID).await;
    next_matching(&mut events, |e| matches!(e, SessionEvent::ExamStarted)).await;
    assert_eq!(candidate.exam_state(), ExamState::InProgress);

    let result = ExamResult {
        score: 5,
        answers: vec![Some(1), Some(0), None],
    };
    candidate.submit_result(result.clone()).await.unwrap();
    assert_eq!(candidate.exam_state(), ExamState::Finished);

    let completed = conn.recv_event("exam-completed").await;
    assert_eq!(completed.participant, CANDIDATE_ID);
    match completed.payload().unwrap() {
        SignalPayload::ExamCompleted(decoded) => assert_eq!(decoded, result),
        other => panic!("unexpected payload {:?}", other),
    }

    candidate.shutdown().await;
    proctor_peers.cleanup().await;
}

/// A departed candidate's session is closed and late candidates for it are
/// dropped without disturbing the proctor
#[tokio::test]
async fn test_student_left_closes_session() {
    let mut server = MockServer::start().await;
    let (proctor, mut events) = start_proctor(&server).await;

    let mut conn = server.accept().await;
    conn.recv_event("join-request").await;
    conn.send_payload(&SignalPayload::JoinRequest, CANDIDATE_ID, CANDIDATE_ID).await;
    conn.recv_event("webrtc-offer").await;

    conn.send_payload(&SignalPayload::StudentLeft, CANDIDATE_ID, CANDIDATE_ID).await;
    next_matching(&mut events, |e| matches!(e, SessionEvent::ParticipantLeft(CANDIDATE_ID))).await;
    assert!(proctor.participants().is_empty());
    assert!(proctor.peers().participants().await.is_empty());

    conn.send_raw(
        r#"{"event":"ice-candidate","message":"{\"candidate\":\"candidate:1 1 udp 2130706431 10.0.0.7 50000 typ host\",\"sdpMid\":\"0\",\"sdpMLineIndex\":0}","participant":7,"sender_id":"7"}"#,
    )
    .await;

    // Still serving: a new join gets a fresh offer
    conn.send_payload(&SignalPayload::JoinRequest, 8, 8).await;
    let offer = conn.recv_event("webrtc-offer").await;
    assert_eq!(offer.participant, 8);
    assert!(proctor.peers().session(CANDIDATE_ID).await.is_none());
    assert_eq!(proctor.channel().state(), ConnectionState::Open);

    proctor.shutdown().await;
}

/// A candidate that rejoins after a reconnect keeps its negotiated session
#[tokio::test]
async fn test_rejoin_keeps_negotiated_session() {
    let mut server = MockServer::start().await;
    let (proctor, _events) = start_proctor(&server).await;

    let mut conn = server.accept().await;
    conn.recv_event("join-request").await;
    conn.send_payload(&SignalPayload::JoinRequest, CANDIDATE_ID, CANDIDATE_ID).await;
    let offer = conn.recv_event("webrtc-offer").await;
    let SignalPayload::Offer(description) = offer.payload().unwrap() else {
        panic!("offer payload expected");
    };

    // The test plays the candidate's peer side
    let candidate_peers = peers();
    candidate_peers.initialize_local_stream(true, false).await.unwrap();
    let answer = candidate_peers
        .handle_remote_offer(PROCTOR_ID, description)
        .await
        .unwrap();
    conn.send_payload(&SignalPayload::Answer(answer), CANDIDATE_ID, CANDIDATE_ID).await;

    let exchanged = eventually(|| {
        let proctor = proctor.clone();
        async move {
            proctor
                .peers()
                .session_state(CANDIDATE_ID)
                .await
                .is_some_and(|s| s.accepts_candidates())
        }
    })
    .await;
    assert!(exchanged, "answer was not applied");
    let before = proctor.peers().session(CANDIDATE_ID).await.unwrap();

    conn.send_payload(&SignalPayload::JoinRequest, CANDIDATE_ID, CANDIDATE_ID).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = proctor.peers().session(CANDIDATE_ID).await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(proctor.peers().participants().await, vec![CANDIDATE_ID]);
    assert_eq!(proctor.participants().len(), 1);

    proctor.shutdown().await;
    candidate_peers.cleanup().await;
}

/// Exam controls go to roster members only, and results land on the roster
#[tokio::test]
async fn test_proctor_exam_controls() {
    let mut server = MockServer::start().await;
    let (proctor, mut events) = start_proctor(&server).await;

    let mut conn = server.accept().await;
    conn.recv_event("join-request").await;

    assert!(matches!(
        proctor.start_exam(CANDIDATE_ID).await,
        Err(SessionError::NoSession(CANDIDATE_ID))
    ));

    conn.send_payload(&SignalPayload::JoinRequest, CANDIDATE_ID, CANDIDATE_ID).await;
    conn.recv_event("webrtc-offer").await;

    proctor.start_exam(CANDIDATE_ID).await.unwrap();
    let start = conn.recv_event("start-exam").await;
    assert_eq!(start.participant, CANDIDATE_ID);

    let result = ExamResult {
        score: 2,
        answers: vec![Some(3), None],
    };
    conn.send_payload(&SignalPayload::ExamCompleted(result.clone()), CANDIDATE_ID, CANDIDATE_ID)
        .await;
    next_matching(&mut events, |e| matches!(e, SessionEvent::ExamCompleted { .. })).await;
    assert_eq!(proctor.participants()[0].result, Some(result));

    proctor.end_exam(CANDIDATE_ID).await.unwrap();
    conn.recv_event("exam-end").await;

    let snapshot = proctor.snapshot().await;
    assert_eq!(snapshot.role, Role::Proctor);
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.role_state["participants"][0]["result"]["score"], 2);

    proctor.shutdown().await;
}

/// Proctor and candidate negotiate through a relaying server
#[tokio::test]
async fn test_roles_negotiate_through_relay() {
    let mut server = MockServer::start().await;
    let (proctor, _proctor_events) = start_proctor(&server).await;
    let proctor_conn = server.accept().await;

    let (candidate, _candidate_events) = start_candidate(&server).await;
    let candidate_conn = server.accept().await;
    proctor_conn.bridge(candidate_conn);

    // Both transports come up over loopback host candidates
    let connected = eventually(|| {
        let proctor = proctor.clone();
        let candidate = candidate.clone();
        async move {
            let proctor_side = proctor.peers().session_state(CANDIDATE_ID).await;
            let candidate_side = candidate.peers().session_state(PROCTOR_ID).await;
            proctor_side == Some(NegotiationState::Connected)
                && candidate_side == Some(NegotiationState::Connected)
        }
    })
    .await;
    assert!(connected, "peers did not reach Connected");

    assert_eq!(candidate.role().proctor_id(), Some(PROCTOR_ID));
    assert!(proctor.peers().queued_candidates(CANDIDATE_ID).await.is_empty());
    assert!(candidate.peers().queued_candidates(PROCTOR_ID).await.is_empty());

    candidate.shutdown().await;
    proctor.shutdown().await;
}
