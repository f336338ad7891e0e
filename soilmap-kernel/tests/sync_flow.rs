use serde_json::{json, Value};
use soilmap_devkit::{readings, MapOp, MockStore, SnapshotBuilder, TestHarness, TEST_ADMIN};
use soilmap_kernel::advisory::{AdvisoryError, AdvisoryState};
use soilmap_kernel::health::HealthTracker;
use soilmap_kernel::map::{compute_position, AdvisoryPosition, ViewMap, Viewport, ViewportChange};
use soilmap_kernel::markers::{BarColor, MarkerColor, PanelBody, NO_DATA_TEXT};
use soilmap_kernel::models::{Coordinates, Parameter};
use soilmap_kernel::ranges::Direction;
use soilmap_kernel::store::{admin_path, USERS_ROOT};
use soilmap_kernel::sync::{Command, SnapshotOutcome, SyncError, SyncSettings, TelemetrySyncController};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

const ALICE_PH_DONE: &str = "Users/alice/Farm/Nodes/n1/Packets/k1/Disabled_pH_done";

fn farm() -> Value {
    SnapshotBuilder::new()
        .node("alice", "n1", 121.0, 14.5)
        .packet(
            "alice",
            "n1",
            "k1",
            readings(&[
                (Parameter::Ph, 5.0),
                (Parameter::Moisture, 40.0),
                (Parameter::Temperature, 21.0),
                (Parameter::Salinity, 1.0),
                (Parameter::Ec, 1.0),
                (Parameter::Nitrogen, 100.0),
                (Parameter::Phosphorus, 30.0),
                (Parameter::Potassium, 150.0),
            ]),
        )
        .node("bob", "n1", -3.7, 40.4)
        .node_without_coordinates("carol", "lost")
        .tenant_without_farm("dave")
        .build()
}

async fn started() -> (TestHarness, soilmap_kernel::store::Subscription) {
    let mut h = TestHarness::new().with_admin().with_users(farm());
    let mut sub = h.start().await.unwrap();
    let outcome = h.deliver_next(&mut sub).await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Applied(_)));
    (h, sub)
}

#[tokio::test]
async fn test_unknown_admin_aborts_startup() {
    let mut h = TestHarness::new().with_users(farm());

    let err = h.controller.validate_identity("bacofa").await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownIdentity(_)));
    assert_eq!(h.controller.identity(), None);

    // rien n'est rendu tant que l'identité n'est pas validée
    assert_eq!(h.controller.apply_snapshot(&farm()), SnapshotOutcome::Unvalidated);
    assert!(h.map.ops().is_empty());
}

#[tokio::test]
async fn test_falsy_admin_value_is_rejected() {
    let mut h = TestHarness::new().with_users(farm());
    h.store.set("Admin/bacofa", json!(false));
    assert!(h.controller.validate_identity("bacofa").await.is_err());
}

#[tokio::test]
async fn test_initial_reconcile() {
    let (h, _sub) = started().await;

    assert_eq!(h.controller.identity(), Some(TEST_ADMIN));
    assert_eq!(h.store.subscriptions(), vec![admin_path(TEST_ADMIN), USERS_ROOT.to_string()]);
    assert_eq!(h.map.marker_keys(), vec!["alice_n1".to_string(), "bob_n1".to_string()]);
    let rendered: Vec<&str> = h.controller.markers().iter().map(|m| m.key.as_str()).collect();
    assert_eq!(rendered, vec!["alice_n1", "bob_n1"]);

    let alice = h.map.marker("alice_n1").unwrap();
    assert_eq!(alice.color, MarkerColor::Red);
    assert_eq!(alice.panel.title, "n1 (alice)");
    assert_eq!(alice.latest_packet.as_deref(), Some("k1"));

    let ph = alice.row(Parameter::Ph).unwrap();
    assert!(!ph.in_range);
    assert_eq!(ph.direction, Some(Direction::Low));
    assert!(ph.affordance_enabled);

    let moisture = alice.row(Parameter::Moisture).unwrap();
    assert!(moisture.in_range);
    assert_eq!(moisture.bar_color, BarColor::DarkGreen);
    assert!(!moisture.affordance_enabled);
    assert_eq!(moisture.percent, 40.0);

    let bob = h.map.marker("bob_n1").unwrap();
    assert_eq!(bob.color, MarkerColor::Grey);
    assert_eq!(bob.panel.body, PanelBody::NoData { text: NO_DATA_TEXT });
    assert!(bob.rows().is_empty());

    assert_eq!(h.health.get_health().markers_rendered, 2);
}

#[tokio::test]
async fn test_open_positions_advisory_below_panel() {
    let (mut h, _sub) = started().await;

    let state = h.controller.request_open("alice_n1", Parameter::Ph).unwrap();
    let AdvisoryState::Open(open) = state else {
        panic!("advisory should be open");
    };
    assert_eq!(open.direction, Direction::Low);
    assert!(open.message.starts_with("Soil pH is too low"));

    // pin (121, 14.5), panneau 260x320 décalé de (15, -15), advisory 280 de large
    let panel = h.map.advisory().unwrap();
    assert_eq!(panel.position, Some(AdvisoryPosition { top: 167.5, left: 126.0 }));

    // même paire -> toggle off
    let state = h.controller.request_open("alice_n1", Parameter::Ph).unwrap();
    assert_eq!(state, AdvisoryState::Closed);
    assert!(h.map.advisory().is_none());
}

#[tokio::test]
async fn test_rejected_requests_change_nothing() {
    let (mut h, _sub) = started().await;

    assert!(matches!(
        h.controller.request_open("alice_n1", Parameter::Moisture),
        Err(AdvisoryError::AffordanceDisabled { .. })
    ));
    assert!(matches!(
        h.controller.request_open("zed_n9", Parameter::Ph),
        Err(AdvisoryError::UnknownMarker(_))
    ));
    assert!(matches!(h.controller.acknowledge().await, Err(AdvisoryError::NotOpen)));
    assert_eq!(h.controller.advisory_state(), &AdvisoryState::Closed);
    assert!(h.store.writes().is_empty());
}

#[tokio::test]
async fn test_acknowledge_then_echo_is_suppressed() {
    let (mut h, mut sub) = started().await;

    h.controller.request_open("alice_n1", Parameter::Ph).unwrap();
    h.controller.acknowledge().await.unwrap();

    let writes = h.store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, ALICE_PH_DONE);
    assert!(writes[0].1.as_i64().is_some());

    assert_eq!(h.controller.advisory_state(), &AdvisoryState::Closed);
    assert!(h.map.advisory().is_none());
    assert!(!h.map.marker("alice_n1").unwrap().row(Parameter::Ph).unwrap().affordance_enabled);
    assert!(h.controller.gate().is_engaged(Instant::now()));

    // l'écho de notre propre écriture ne touche pas aux markers
    h.map.clear_ops();
    assert_eq!(h.deliver_next(&mut sub).await.unwrap(), SnapshotOutcome::Suppressed);
    assert_eq!(h.map.marker_mutations(), 0);
    assert_eq!(h.health.get_health().snapshots_suppressed, 1);

    // après le cooldown, le packet acquitté reste désactivé malgré la valeur hors plage
    tokio::time::sleep(Duration::from_millis(250)).await;
    h.store.set("Users/alice/Farm/Nodes/n1/Coordinates/X", json!(121.5));
    assert!(matches!(h.deliver_next(&mut sub).await.unwrap(), SnapshotOutcome::Applied(_)));

    let ph = h.map.marker("alice_n1").unwrap().row(Parameter::Ph).cloned().unwrap();
    assert!(!ph.in_range);
    assert!(!ph.affordance_enabled);
    assert_eq!(h.health.get_health().acknowledgments_written, 1);
}

#[tokio::test]
async fn test_newer_packet_reenables_affordance() {
    let (mut h, mut sub) = started().await;
    h.controller.request_open("alice_n1", Parameter::Ph).unwrap();
    h.controller.acknowledge().await.unwrap();
    h.deliver_next(&mut sub).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    h.store.set(
        "Users/alice/Farm/Nodes/n1/Packets/k2",
        readings(&[(Parameter::Ph, 4.8)]),
    );
    h.deliver_next(&mut sub).await.unwrap();

    let alice = h.map.marker("alice_n1").unwrap();
    assert_eq!(alice.latest_packet.as_deref(), Some("k2"));
    assert!(alice.row(Parameter::Ph).unwrap().affordance_enabled);
}

#[tokio::test]
async fn test_failed_write_closes_without_disabling() {
    let (mut h, _sub) = started().await;
    h.store.fail_writes_with("permission denied");

    h.controller.request_open("alice_n1", Parameter::Ph).unwrap();
    let err = h.controller.acknowledge().await.unwrap_err();
    assert!(matches!(err, AdvisoryError::Write(_)));

    assert_eq!(h.controller.advisory_state(), &AdvisoryState::Closed);
    assert!(!h.controller.gate().is_engaged(Instant::now()));
    assert!(h.map.marker("alice_n1").unwrap().row(Parameter::Ph).unwrap().affordance_enabled);
    assert_eq!(h.store.get(ALICE_PH_DONE), Value::Null);
    assert_eq!(h.health.get_health().acknowledgments_failed, 1);

    // retry possible
    h.store.accept_writes();
    h.controller.request_open("alice_n1", Parameter::Ph).unwrap();
    h.controller.acknowledge().await.unwrap();
    assert!(h.store.get(ALICE_PH_DONE).is_i64());
}

#[tokio::test]
async fn test_resync_closes_advisory_of_vanished_marker() {
    let (mut h, mut sub) = started().await;
    h.controller.request_open("alice_n1", Parameter::Ph).unwrap();

    h.store.set("Users/alice", Value::Null);
    h.deliver_next(&mut sub).await.unwrap();

    assert_eq!(h.map.marker_keys(), vec!["bob_n1".to_string()]);
    assert_eq!(h.controller.advisory_state(), &AdvisoryState::Closed);
    assert!(h.map.advisory().is_none());
}

#[tokio::test]
async fn test_null_users_tree_clears_markers() {
    let (mut h, mut sub) = started().await;

    h.store.set("Users", Value::Null);
    let outcome = h.deliver_next(&mut sub).await.unwrap();

    let SnapshotOutcome::Applied(report) = outcome else {
        panic!("snapshot should apply");
    };
    assert_eq!(report.removed, 2);
    assert_eq!(report.rendered, 0);
    assert!(h.map.marker_keys().is_empty());
}

#[tokio::test]
async fn test_viewport_and_map_click() {
    let (mut h, _sub) = started().await;
    h.controller.request_open("alice_n1", Parameter::Ph).unwrap();
    h.map.clear_ops();

    h.controller.on_viewport_change(ViewportChange::Zoom);
    assert!(matches!(h.map.ops().as_slice(), [MapOp::ShowAdvisory(_)]));

    assert!(h.controller.dismiss());
    assert!(!h.controller.dismiss());
    assert!(h.map.advisory().is_none());
}

#[tokio::test]
async fn test_viewport_move_repositions_advisory_on_view_map() {
    let store = MockStore::new();
    store.set(&admin_path(TEST_ADMIN), json!(true));
    store.set(USERS_ROOT, farm());
    let settings = SyncSettings::default();
    let mut controller = TelemetrySyncController::new(
        Arc::new(store),
        ViewMap::new(Viewport::default()),
        settings,
        HealthTracker::new(),
    );
    controller.validate_identity(TEST_ADMIN).await.unwrap();
    assert!(matches!(controller.apply_snapshot(&farm()), SnapshotOutcome::Applied(_)));
    controller.request_open("alice_n1", Parameter::Ph).unwrap();

    let alice = Coordinates { x: 121.0, y: 14.5 };
    let expected = |viewport: &Viewport| {
        let anchor = settings.panel.anchor_rect(viewport.project(alice));
        compute_position(&anchor, &settings.advisory)
    };
    let before = controller.map().advisory().unwrap().position.unwrap();
    assert_eq!(before, expected(&Viewport::default()));

    // vue centrée sur le pin, qui tombe au milieu de l'écran (400, 300)
    let moved = Viewport {
        center: alice,
        zoom: 10.0,
        width: 800.0,
        height: 600.0,
    };
    controller.map().set_viewport(moved);
    controller.on_viewport_change(ViewportChange::Move);

    let after = controller.map().advisory().unwrap().position.unwrap();
    assert_eq!(after, AdvisoryPosition { top: 453.0, left: 405.0 });
    assert_eq!(after, expected(&moved));
    assert_ne!(after, before);
}

#[tokio::test]
async fn test_toggle_extra_rows() {
    let (mut h, _sub) = started().await;

    assert_eq!(h.controller.toggle_extra("alice_n1"), Some(true));
    assert!(h.map.marker("alice_n1").unwrap().panel.extras_expanded);
    assert_eq!(h.controller.toggle_extra("alice_n1"), Some(false));
    assert_eq!(h.controller.toggle_extra("nobody_n0"), None);

    let extras: Vec<Parameter> = h
        .map
        .marker("alice_n1")
        .unwrap()
        .rows()
        .iter()
        .filter(|row| row.extra)
        .map(|row| row.parameter)
        .collect();
    assert_eq!(extras.len(), 4);
}

#[tokio::test]
async fn test_run_loop_serves_commands() {
    let mut h = TestHarness::new().with_admin().with_users(farm());
    let sub = h.start().await.unwrap();
    let TestHarness {
        store,
        map,
        health,
        controller,
    } = h;
    store.delay_writes(Duration::from_millis(100));

    let (commands, command_rx) = mpsc::channel(8);

    let client = async {
        // premier snapshot traité par la boucle
        for _ in 0..100 {
            if map.marker("alice_n1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::OpenAdvisory {
                marker: "alice_n1".into(),
                parameter: Parameter::Ph,
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Ok(AdvisoryState::Open(_))));

        let (first, first_rx) = oneshot::channel();
        let (second, second_rx) = oneshot::channel();
        commands.send(Command::Acknowledge { reply: first }).await.unwrap();
        commands.send(Command::Acknowledge { reply: second }).await.unwrap();

        assert!(matches!(second_rx.await.unwrap(), Err(AdvisoryError::WriteInFlight)));
        first_rx.await.unwrap().unwrap();

        assert_eq!(store.writes().len(), 1);
        assert!(!map.marker("alice_n1").unwrap().row(Parameter::Ph).unwrap().affordance_enabled);

        // l'écho de l'écriture passe par la boucle et tombe dans le cooldown
        for _ in 0..100 {
            if health.get_health().snapshots_suppressed >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(health.get_health().snapshots_suppressed >= 1);
        assert_eq!(health.get_health().acknowledgments_written, 1);

        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::ToggleExtra {
                marker: "bob_n1".into(),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Some(true));
    };

    tokio::select! {
        result = controller.run(sub, command_rx) => panic!("sync loop ended early: {result:?}"),
        _ = client => {}
    }
}
