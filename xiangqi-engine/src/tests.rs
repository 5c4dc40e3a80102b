//! Driver-level scenarios against a scripted engine.

use std::time::Duration;

use crate::board::testing::TestBoard;
use crate::board::{Color, EngineMove};
use crate::engine::{AnalysisOptions, PlayOptions};
use crate::score::{PovScore, Score};
use crate::transport::{MockController, MockTransport};
use crate::{blocking, Engine, EngineError, InfoSelector, Limit, Opponent, OptionKind, OptionValue};

async fn uci_engine(init_responses: &[&str]) -> (Engine<TestBoard>, MockController) {
    let (transport, mock) = MockTransport::new();
    mock.expect("uci", init_responses);
    let engine = Engine::<TestBoard>::new_uci(transport).await;
    engine.initialize().await.expect("uci initialization");
    (engine, mock)
}

async fn xboard_engine(features: &[&str]) -> (Engine<TestBoard>, MockController) {
    let (transport, mock) = MockTransport::new();
    mock.expect("xboard", &[]);
    mock.expect("protover 2", features);
    let engine = Engine::<TestBoard>::new_xboard(transport).await;
    engine.initialize().await.expect("xboard initialization");
    (engine, mock)
}

#[tokio::test]
async fn uci_initialize_collects_options_and_id() {
    let (engine, mock) = uci_engine(&[
        "id name StubEngine",
        "id author Tester",
        "option name Hash type spin default 16 min 1 max 1024",
        "option name MultiPV type spin default 1 min 1 max 500",
        "uciok",
    ])
    .await;

    let options = engine.options().await.unwrap();
    let hash = options.get("Hash").unwrap();
    assert_eq!(hash.kind, OptionKind::Spin);
    assert_eq!(hash.default, OptionValue::Int(16));
    assert_eq!(hash.min, Some(1));
    assert_eq!(hash.max, Some(1024));
    assert!(options.get("MultiPV").unwrap().is_managed());
    assert!(!hash.is_managed());

    let id = engine.id().await.unwrap();
    assert_eq!(id.get("name").map(String::as_str), Some("StubEngine"));
    assert_eq!(id.get("author").map(String::as_str), Some("Tester"));
    mock.assert_done();
}

#[tokio::test]
async fn uci_initialize_twice_fails() {
    let (engine, mock) = uci_engine(&["uciok"]).await;
    assert!(matches!(
        engine.initialize().await,
        Err(EngineError::AlreadyInitialized)
    ));
    mock.assert_done();
}

#[tokio::test]
async fn uci_play_mate_in_one() {
    let (engine, mock) = uci_engine(&[
        "option name Hash type spin default 16 min 1 max 1024",
        "option name MultiPV type spin default 1 min 1 max 500",
        "uciok",
    ])
    .await;

    mock.expect("ucinewgame", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect(
        "go movetime 100",
        &["info depth 2 score mate 1 pv h2e2", "bestmove h2e2"],
    );

    let board = TestBoard::new();
    let result = engine
        .play(
            &board,
            Limit::move_time(Duration::from_millis(100)),
            PlayOptions {
                selector: InfoSelector::ALL,
                ..PlayOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("h2e2"));
    assert!(result.ponder.is_none());
    assert_eq!(result.info.depth, Some(2));
    assert_eq!(result.info.score, Some(PovScore::new(Score::Mate(1), Color::Red)));
    let pv: Vec<String> = result.info.pv.unwrap().iter().map(|mv| mv.uci()).collect();
    assert_eq!(pv, vec!["h2e2"]);
    assert!(!result.draw_offered);
    assert!(!result.resigned);
    mock.assert_done();
}

#[tokio::test]
async fn uci_ponderhit_short_circuit() {
    let (engine, mock) = uci_engine(&["uciok"]).await;

    mock.expect("ucinewgame", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect("go movetime 100", &["bestmove h2e2 ponder h9g7"]);
    mock.expect("position startpos moves h2e2 h9g7", &[]);
    mock.expect("go ponder movetime 100", &[]);

    let board = TestBoard::new();
    let first = engine
        .play(
            &board,
            Limit::move_time(Duration::from_millis(100)),
            PlayOptions {
                ponder: true,
                ..PlayOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("h2e2"));
    assert_eq!(first.ponder.as_ref().map(|mv| mv.uci()).as_deref(), Some("h9g7"));

    // The opponent answers with the predicted reply: the running ponder
    // search is converted instead of restarted.
    mock.expect("ponderhit", &["bestmove b2e2"]);

    let continuation = TestBoard::with_moves(&["h2e2", "h9g7"]);
    let second = engine
        .play(
            &continuation,
            Limit::move_time(Duration::from_millis(100)),
            PlayOptions {
                ponder: true,
                ..PlayOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(second.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("b2e2"));
    mock.assert_done();
}

#[tokio::test]
async fn uci_opponent_is_sent_after_ucinewgame() {
    let (engine, mock) = uci_engine(&[
        "option name UCI_Opponent type string default",
        "uciok",
    ])
    .await;

    engine
        .send_opponent_information(
            Some(Opponent {
                name: Some("Alice".to_string()),
                title: None,
                rating: Some(2000),
                is_engine: false,
            }),
            None,
        )
        .await
        .unwrap();

    mock.expect("ucinewgame", &[]);
    mock.expect("setoption name UCI_Opponent value none 2000 human Alice", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect("go movetime 100", &["bestmove h2e2"]);

    let board = TestBoard::new();
    engine
        .play(
            &board,
            Limit::move_time(Duration::from_millis(100)),
            PlayOptions::default(),
        )
        .await
        .unwrap();
    mock.assert_done();
}

#[tokio::test]
async fn uci_configure_rejects_managed_options() {
    let (engine, mock) = uci_engine(&[
        "option name MultiPV type spin default 1 min 1 max 500",
        "uciok",
    ])
    .await;
    let result = engine
        .configure([("MultiPV".to_string(), OptionValue::Int(3))])
        .await;
    assert!(matches!(result, Err(EngineError::ManagedOption(name)) if name == "MultiPV"));

    let result = engine
        .configure([("Threads".to_string(), OptionValue::Int(2))])
        .await;
    assert!(matches!(result, Err(EngineError::UnknownOption { name, .. }) if name == "Threads"));
    mock.assert_done();
}

#[tokio::test]
async fn uci_configure_emits_changed_options() {
    let (engine, mock) = uci_engine(&[
        "option name Hash type spin default 16 min 1 max 1024",
        "uciok",
    ])
    .await;

    mock.expect("setoption name Hash value 32", &[]);
    engine
        .configure([("Hash".to_string(), OptionValue::Int(32))])
        .await
        .unwrap();

    // Unchanged values are not retransmitted.
    engine
        .configure([("Hash".to_string(), OptionValue::Int(32))])
        .await
        .unwrap();

    assert!(matches!(
        engine.configure([("Hash".to_string(), OptionValue::Int(4096))]).await,
        Err(EngineError::InvalidValue(_))
    ));
    mock.assert_done();
}

#[tokio::test]
async fn uci_analysis_streams_until_stopped() {
    let (engine, mock) = uci_engine(&["uciok"]).await;

    mock.expect("ucinewgame", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect("go infinite", &["info depth 1 score cp 13 pv h2e2"]);

    let board = TestBoard::new();
    let mut analysis = engine
        .analysis(&board, None, AnalysisOptions::default())
        .await
        .unwrap();

    let first = analysis.get().await.unwrap();
    assert_eq!(first.depth, Some(1));
    assert_eq!(first.score, Some(PovScore::new(Score::Cp(13), Color::Red)));

    // The stream only terminates once the engine acknowledges the stop.
    mock.expect("stop", &["bestmove h2e2"]);
    analysis.stop();

    assert!(matches!(analysis.get().await, Err(EngineError::AnalysisComplete)));
    let best = analysis.wait().await.unwrap();
    assert_eq!(best.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("h2e2"));
    mock.assert_done();
}

#[tokio::test]
async fn uci_analysis_sets_multipv() {
    let (engine, mock) = uci_engine(&[
        "option name MultiPV type spin default 1 min 1 max 500",
        "uciok",
    ])
    .await;

    mock.expect("setoption name MultiPV value 3", &[]);
    mock.expect("ucinewgame", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect(
        "go movetime 50",
        &[
            "info multipv 1 depth 3 score cp 40 pv h2e2",
            "info multipv 2 depth 3 score cp 12 pv b2e2",
            "info multipv 3 depth 3 score cp -5 pv a0a1",
            "bestmove h2e2",
        ],
    );

    let board = TestBoard::new();
    let infos = engine
        .analyse(
            &board,
            Limit::move_time(Duration::from_millis(50)),
            AnalysisOptions {
                multipv: Some(3),
                ..AnalysisOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(infos.len(), 3);
    assert_eq!(infos[0].score, Some(PovScore::new(Score::Cp(40), Color::Red)));
    assert_eq!(infos[2].score, Some(PovScore::new(Score::Cp(-5), Color::Red)));
    mock.assert_done();
}

#[tokio::test]
async fn pending_commands_coalesce_and_preempt() {
    let (engine, mock) = uci_engine(&["uciok"]).await;

    mock.expect("isready", &["readyok"]);
    mock.expect("isready", &["readyok"]);

    let (first, second, third) =
        tokio::join!(engine.ping(), engine.ping(), engine.ping());

    // The running ping is cancelled, the queued one displaced; only the
    // newest pending command survives.
    assert!(matches!(first, Err(EngineError::Cancelled)));
    assert!(matches!(second, Err(EngineError::Cancelled)));
    assert!(matches!(third, Ok(())));
    mock.assert_done();
}

#[tokio::test]
async fn engine_termination_fails_commands() {
    let (engine, mock) = uci_engine(&["uciok"]).await;

    mock.expect("ucinewgame", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect("go movetime 100", &[]);

    let engine2 = engine.clone();
    let play = tokio::spawn(async move {
        engine2
            .play(
                &TestBoard::new(),
                Limit::move_time(Duration::from_millis(100)),
                PlayOptions::default(),
            )
            .await
    });

    // Give the play command time to reach the engine, then kill it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    mock.exit(1);

    let result = play.await.unwrap();
    assert!(matches!(
        result,
        Err(EngineError::EngineTerminated { code: 1, .. })
    ));
    assert_eq!(engine.wait_exit().await, Ok(1));
    assert_eq!(engine.returncode(), Some(1));

    assert!(matches!(
        engine.ping().await,
        Err(EngineError::EngineTerminated { code: 1, .. })
    ));
    mock.assert_done();
}

#[tokio::test]
async fn quit_waits_for_exit() {
    let (engine, mock) = uci_engine(&["uciok"]).await;
    mock.expect("quit", &[]);
    mock.exit(0);
    engine.quit().await.unwrap();
    assert_eq!(engine.returncode(), Some(0));
    mock.assert_done();
}

#[tokio::test]
async fn xboard_initialize_rejects_reuse() {
    let (transport, mock) = MockTransport::new();
    mock.expect("xboard", &[]);
    mock.expect("protover 2", &["feature ping=1 setboard=1 reuse=0 done=1"]);
    mock.expect("rejected reuse", &[]);
    let engine = Engine::<TestBoard>::new_xboard(transport).await;
    engine.initialize().await.unwrap();
    mock.assert_done();
}

#[tokio::test]
async fn xboard_initialize_requires_ping() {
    let (transport, mock) = MockTransport::new();
    mock.expect("xboard", &[]);
    mock.expect("protover 2", &["feature setboard=1 done=1"]);
    let engine = Engine::<TestBoard>::new_xboard(transport).await;
    assert!(matches!(
        engine.initialize().await,
        Err(EngineError::MissingFeature("ping"))
    ));
    mock.assert_done();
}

#[tokio::test]
async fn xboard_initialize_collects_features() {
    let (transport, mock) = MockTransport::new();
    mock.expect("xboard", &[]);
    mock.expect(
        "protover 2",
        &["feature ping=1 setboard=1 myname=\"Stub 1.0\" memory=1 option=\"Resign -check 0\" done=1"],
    );
    mock.expect("accepted memory", &[]);
    let engine = Engine::<TestBoard>::new_xboard(transport).await;
    engine.initialize().await.unwrap();

    let id = engine.id().await.unwrap();
    assert_eq!(id.get("name").map(String::as_str), Some("Stub 1.0"));

    let options = engine.options().await.unwrap();
    assert_eq!(options.get("Resign").unwrap().kind, OptionKind::Check);
    assert_eq!(options.get("memory").unwrap().default, OptionValue::Int(16));
    assert!(options.contains("random"));
    mock.assert_done();
}

#[tokio::test]
async fn xboard_play_and_resync() {
    let (engine, mock) = xboard_engine(&["feature ping=1 setboard=1 usermove=1 done=1"]).await;

    mock.expect("new", &[]);
    mock.expect("force", &[]);
    mock.expect("usermove h2e2", &[]);
    mock.expect("usermove h9g7", &[]);
    mock.expect("sd 3", &[]);
    mock.expect("nopost", &[]);
    mock.expect("easy", &[]);
    mock.expect("go", &["move b2e2"]);
    mock.expect_ping();

    let board = TestBoard::with_moves(&["h2e2", "h9g7"]);
    let result = engine
        .play(&board, Limit::depth(3), PlayOptions::default())
        .await
        .unwrap();
    assert_eq!(result.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("b2e2"));

    // The host took moves back: the engine is rewound with remove, not
    // restarted.
    mock.expect("force", &[]);
    mock.expect("remove", &[]);
    mock.expect("sd 3", &[]);
    mock.expect("nopost", &[]);
    mock.expect("easy", &[]);
    mock.expect("go", &["move d9e8"]);
    mock.expect_ping();

    let rewound = TestBoard::with_moves(&["h2e2"]);
    let result = engine
        .play(&rewound, Limit::depth(3), PlayOptions::default())
        .await
        .unwrap();
    assert_eq!(result.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("d9e8"));
    mock.assert_done();
}

#[tokio::test]
async fn xboard_play_records_draw_offer() {
    let (engine, mock) = xboard_engine(&["feature ping=1 setboard=1 done=1"]).await;

    mock.expect("new", &[]);
    mock.expect("force", &[]);
    mock.expect("st 5", &[]);
    mock.expect("nopost", &[]);
    mock.expect("easy", &[]);
    mock.expect("go", &["move h2e2", "offer draw"]);
    mock.expect_ping();

    let board = TestBoard::new();
    let result = engine
        .play(
            &board,
            Limit::move_time(Duration::from_secs(5)),
            PlayOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("h2e2"));
    assert!(result.draw_offered);
    mock.assert_done();
}

#[tokio::test]
async fn xboard_play_rejects_root_moves_and_mixed_limits() {
    let (engine, mock) = xboard_engine(&["feature ping=1 setboard=1 done=1"]).await;

    let board = TestBoard::new();
    let result = engine
        .play(
            &board,
            Limit::depth(3),
            PlayOptions {
                root_moves: Some(vec![]),
                ..PlayOptions::default()
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::Unsupported(_))));

    let mixed = Limit {
        nodes: Some(1000),
        time: Some(Duration::from_secs(1)),
        ..Limit::default()
    };
    mock.expect("new", &[]);
    mock.expect("force", &[]);
    mock.expect("st 1", &[]);
    let result = engine.play(&board, mixed, PlayOptions::default()).await;
    assert!(matches!(result, Err(EngineError::Unsupported(_))));
    mock.assert_done();
}

#[tokio::test]
async fn xboard_analysis_stop_sequence() {
    let (engine, mock) = xboard_engine(&["feature ping=1 setboard=1 done=1"]).await;

    mock.expect("new", &[]);
    mock.expect("force", &[]);
    mock.expect("post", &[]);
    mock.expect("analyze", &["4 105 12 3456 h2e2"]);

    let board = TestBoard::new();
    let mut analysis = engine
        .analysis(&board, None, AnalysisOptions::default())
        .await
        .unwrap();

    let first = analysis.get().await.unwrap();
    assert_eq!(first.depth, Some(4));

    mock.expect(".", &[]);
    mock.expect("exit", &[]);
    mock.expect_ping();
    analysis.stop();

    assert!(matches!(analysis.get().await, Err(EngineError::AnalysisComplete)));
    let best = analysis.wait().await.unwrap();
    assert_eq!(best.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("h2e2"));
    mock.assert_done();
}

#[tokio::test]
async fn xboard_game_result_replays_final_moves() {
    let (engine, mock) = xboard_engine(&["feature ping=1 setboard=1 done=1"]).await;

    mock.expect("new", &[]);
    mock.expect("force", &[]);
    mock.expect("h2e2", &[]);
    mock.expect("h9g7", &[]);
    mock.expect("result 1-0 {Time forfeiture}", &[]);

    let board = TestBoard::with_moves(&["h2e2", "h9g7"]);
    engine
        .send_game_result(&board, Some(Color::Red), Some("Time forfeiture".to_string()), true)
        .await
        .unwrap();
    mock.assert_done();
}

#[tokio::test]
async fn xboard_debug_is_unsupported() {
    let (engine, mock) = xboard_engine(&["feature ping=1 setboard=1 done=1"]).await;
    assert!(matches!(
        engine.set_debug(true).await,
        Err(EngineError::Unsupported(_))
    ));
    mock.assert_done();
}

#[test]
fn blocking_facade_round_trip() {
    let (transport, mock) = MockTransport::new();
    mock.expect("uci", &["uciok"]);
    let engine = blocking::BlockingEngine::<TestBoard>::new_uci(
        transport,
        Some(Duration::from_secs(5)),
    )
    .unwrap();

    mock.expect("isready", &["readyok"]);
    engine.ping().unwrap();

    mock.expect("ucinewgame", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect("go movetime 100", &["bestmove h2e2"]);
    let board = TestBoard::new();
    let result = engine
        .play(
            &board,
            Limit::move_time(Duration::from_millis(100)),
            PlayOptions::default(),
        )
        .unwrap();
    assert_eq!(result.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("h2e2"));

    engine.close();
    assert!(matches!(engine.ping(), Err(EngineError::Shutdown)));
    mock.assert_done();
}

#[test]
fn blocking_facade_times_out() {
    let (transport, mock) = MockTransport::new();
    mock.expect("uci", &["uciok"]);
    let engine = blocking::BlockingEngine::<TestBoard>::new_uci(
        transport,
        Some(Duration::from_millis(50)),
    )
    .unwrap();

    mock.expect("isready", &[]);
    assert!(matches!(engine.ping(), Err(EngineError::Timeout)));
}

#[test]
fn blocking_analysis_iterates() {
    let (transport, mock) = MockTransport::new();
    mock.expect("uci", &["uciok"]);
    let engine = blocking::BlockingEngine::<TestBoard>::new_uci(
        transport,
        Some(Duration::from_secs(5)),
    )
    .unwrap();

    mock.expect("ucinewgame", &[]);
    mock.expect("isready", &["readyok"]);
    mock.expect("position startpos", &[]);
    mock.expect(
        "go movetime 50",
        &[
            "info depth 1 score cp 5 pv h2e2",
            "info depth 2 score cp 9 pv h2e2",
            "bestmove h2e2",
        ],
    );

    let board = TestBoard::new();
    let mut analysis = engine
        .analysis(
            &board,
            Some(Limit::move_time(Duration::from_millis(50))),
            AnalysisOptions::default(),
        )
        .unwrap();

    let depths: Vec<Option<u32>> = analysis.by_ref().map(|info| info.depth).collect();
    assert_eq!(depths, vec![Some(1), Some(2)]);
    let best = analysis.wait().unwrap();
    assert_eq!(best.mov.as_ref().map(|mv| mv.uci()).as_deref(), Some("h2e2"));
    mock.assert_done();
}
