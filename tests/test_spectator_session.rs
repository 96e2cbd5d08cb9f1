//! Spectator and replay scenarios: a host pair plus a spectator fed from
//! confirmed inputs only, and a replay session reproducing the recording.

mod stubs;

use netplay::{
    Frame, NetplayError, P2PSession, PlayerHandle, PlayerType, ReplaySession, SessionBuilder,
    SessionState, SpectatorSession,
};
use stubs::{GameStub, MemoryNetwork, StubConfig, StubInput};

struct Setup {
    session_a: P2PSession<StubConfig>,
    session_b: P2PSession<StubConfig>,
    spectator: SpectatorSession<StubConfig>,
}

fn setup(network: &MemoryNetwork) -> Setup {
    let socket_a = network.add_socket(); // address 0
    let socket_b = network.add_socket(); // address 1
    let socket_s = network.add_socket(); // address 2

    let session_a = SessionBuilder::<StubConfig>::new()
        .with_input_delay(0)
        .add_player(PlayerType::Local, PlayerHandle::new(0))
        .unwrap()
        .add_player(PlayerType::Remote(1), PlayerHandle::new(1))
        .unwrap()
        .add_player(PlayerType::Spectator(2), PlayerHandle::new(2))
        .unwrap()
        .start_p2p_session(socket_a)
        .unwrap();
    let session_b = SessionBuilder::<StubConfig>::new()
        .with_input_delay(0)
        .add_player(PlayerType::Remote(0), PlayerHandle::new(0))
        .unwrap()
        .add_player(PlayerType::Local, PlayerHandle::new(1))
        .unwrap()
        .start_p2p_session(socket_b)
        .unwrap();
    let spectator = SessionBuilder::<StubConfig>::new()
        .start_spectator_session(0, socket_s)
        .unwrap();

    Setup {
        session_a,
        session_b,
        spectator,
    }
}

#[test]
fn test_spectator_replays_the_confirmed_stream() {
    let network = MemoryNetwork::new();
    let Setup {
        mut session_a,
        mut session_b,
        mut spectator,
    } = setup(&network);

    let mut game_a = GameStub::new();
    let mut game_b = GameStub::new();
    let mut game_s = GameStub::new();

    // drive all three handshakes
    for _ in 0..64 {
        session_a.begin_frame(&mut game_a).unwrap();
        session_b.begin_frame(&mut game_b).unwrap();
        spectator.begin_frame(&mut game_s).unwrap();
        if session_a.current_state() == SessionState::Running
            && session_b.current_state() == SessionState::Running
            && spectator.current_state() == SessionState::Running
        {
            break;
        }
    }
    assert_eq!(spectator.current_state(), SessionState::Running);
    assert!(game_s.started);

    // play, while the spectator consumes whatever has been broadcast
    for frame in 0..120u32 {
        for (session, game, handle, input) in [
            (&mut session_a, &mut game_a, 0, frame * 7),
            (&mut session_b, &mut game_b, 1, frame * 11),
        ] {
            session.begin_frame(game).unwrap();
            match session.add_local_input(PlayerHandle::new(handle), StubInput { inp: input }) {
                Ok(()) | Err(NetplayError::InputDropped) => {
                    let inputs = session.synchronize_inputs().unwrap();
                    game.apply(&inputs);
                    session.advance_frame(game).unwrap();
                },
                Err(NetplayError::PredictionThreshold) => (),
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        spectator.begin_frame(&mut game_s).unwrap();
        loop {
            match spectator.synchronize_inputs() {
                Ok(inputs) => {
                    game_s.apply(&inputs);
                    spectator.advance_frame().unwrap();
                },
                Err(NetplayError::PredictionThreshold) => break,
                Err(e) => panic!("unexpected spectator error: {}", e),
            }
        }
    }

    // the spectator observed a prefix of the confirmed timeline, in order
    // and without gaps
    let watched = spectator.current_frame();
    assert!(watched > Frame::new(60), "spectator fell too far behind");

    // replaying the host's recorded confirmed inputs must reproduce the
    // spectator's state exactly
    let mut replay = ReplaySession::<StubConfig>::new(game_a.confirmed_frames.clone());
    let mut game_r = GameStub::new();
    for _ in 0..=watched.as_i32() {
        let inputs = replay.synchronize_inputs().unwrap();
        game_r.apply(&inputs);
        replay.advance_frame();
    }
    assert_eq!(game_r.frame, game_s.frame);
    assert_eq!(game_r.accum, game_s.accum);
}

#[test]
fn test_replay_exhaustion_after_recording_ends() {
    let recording: Vec<_> = (0..5)
        .map(|f| {
            netplay::ConfirmedInputs::new(
                Frame::new(f),
                [StubInput { inp: f as u32 }, StubInput { inp: 0 }],
            )
        })
        .collect();

    let mut replay = ReplaySession::<StubConfig>::new(recording);
    let mut game = GameStub::new();

    let mut played = 0;
    loop {
        match replay.synchronize_inputs() {
            Ok(inputs) => {
                game.apply(&inputs);
                replay.advance_frame();
                played += 1;
            },
            Err(NetplayError::NotSynchronized) => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(played, 5);
    assert_eq!(game.frame, 5);
}
