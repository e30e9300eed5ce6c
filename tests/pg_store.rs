use generation_backend::credits::{CreditLedger, PgCreditLedger};
use generation_backend::tasks::models::{
    InFlightFilter, MediaType, NewGenerationTask, Platform, RerouteUpdate, ReservationOutcome,
    TaskPayload, TaskStatus, TerminalUpdate,
};
use generation_backend::tasks::store::{PgTaskStore, StoreError, TaskStore};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

fn new_task(user_id: Uuid, external_task_id: &str) -> NewGenerationTask {
    NewGenerationTask {
        user_id,
        platform: Platform::Hedra,
        model: "hedra-character-3".into(),
        external_task_id: external_task_id.into(),
        status: TaskStatus::Pending,
        payload: TaskPayload {
            prompt: Some("hello".into()),
            ..TaskPayload::default()
        },
        quoted_cost: 600,
        media_type: MediaType::Video,
        tool: "talking-head".into(),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn terminal_write_is_conditional(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgTaskStore::new(pool.clone());
    let user_id = Uuid::new_v4();
    store.create_task(new_task(user_id, "gen-1"), None).await.unwrap();

    assert!(store
        .record_progress(Platform::Hedra, "gen-1", Some(30))
        .await
        .unwrap());
    let won = store
        .complete_task(
            Platform::Hedra,
            "gen-1",
            TerminalUpdate::Succeeded {
                output: "https://cdn.example/out.mp4".into(),
            },
        )
        .await
        .unwrap()
        .expect("first terminal write wins");
    assert_eq!(won.status, TaskStatus::Succeeded);
    assert_eq!(won.cost, Some(600));

    let lost = store
        .complete_task(
            Platform::Hedra,
            "gen-1",
            TerminalUpdate::Failed {
                failure: Some("late".into()),
                failure_code: None,
            },
        )
        .await
        .unwrap();
    assert!(lost.is_none());
    assert!(!store
        .record_progress(Platform::Hedra, "gen-1", Some(50))
        .await
        .unwrap());
    assert_eq!(store.outstanding_cost(user_id).await.unwrap(), 0);

    let record = store.record_generation(&won).await.unwrap();
    let ids = store
        .generation_ids(
            user_id,
            MediaType::Video,
            &["https://cdn.example/out.mp4".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(ids.get("https://cdn.example/out.mp4"), Some(&record.id));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_external_id_is_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgTaskStore::new(pool.clone());
    let user_id = Uuid::new_v4();
    store.create_task(new_task(user_id, "gen-1"), None).await.unwrap();
    let err = store
        .create_task(new_task(user_id, "gen-1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateExternalId { .. }));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reservation_is_created_with_task_and_closed_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgTaskStore::new(pool.clone());
    let user_id = Uuid::new_v4();
    let task = store
        .create_task(
            new_task(user_id, "gen-1"),
            Some((600, json!({"model": "hedra-character-3", "duration": 10}))),
        )
        .await
        .unwrap();

    let reservation = store.reservation("gen-1").await.unwrap().unwrap();
    assert_eq!(reservation.task_id, task.id);
    assert_eq!(reservation.reserved_credits, 600);
    assert_eq!(reservation.outcome, None);

    store
        .close_reservation("gen-1", ReservationOutcome::Released, None)
        .await
        .unwrap();
    store
        .close_reservation(
            "gen-1",
            ReservationOutcome::Committed,
            Some("https://cdn.example/out.mp4"),
        )
        .await
        .unwrap();
    let reservation = store.reservation("gen-1").await.unwrap().unwrap();
    assert_eq!(reservation.outcome, Some(ReservationOutcome::Released));
    assert_eq!(reservation.output_locator, None);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn commit_is_compare_and_decrement(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ledger = PgCreditLedger::new(pool.clone());
    let user_id = Uuid::new_v4();
    assert_eq!(ledger.grant(user_id, 500).await.unwrap(), 500);
    assert_eq!(ledger.grant(user_id, 100).await.unwrap(), 600);

    assert!(ledger.reserve_check(user_id, 600).await.unwrap());
    assert!(ledger.commit(user_id, 400).await.unwrap());
    assert!(!ledger.commit(user_id, 400).await.unwrap());
    assert_eq!(ledger.balance(user_id).await.unwrap(), 200);
    assert!(!ledger.commit(Uuid::new_v4(), 1).await.unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reroute_is_single_shot_and_restarts_the_clock(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgTaskStore::new(pool.clone());
    let user_id = Uuid::new_v4();
    let task = store.create_task(new_task(user_id, "gen-1"), None).await.unwrap();
    sqlx::query(
        "UPDATE generation_tasks SET submitted_at = NOW() - INTERVAL '1 hour' WHERE id = $1",
    )
    .bind(task.id)
    .execute(&pool)
    .await
    .unwrap();
    let update = |external_task_id: &str| RerouteUpdate {
        expected_external_task_id: "gen-1".into(),
        platform: Platform::Ark,
        model: "seedance-pro".into(),
        external_task_id: external_task_id.into(),
        payload: TaskPayload {
            prompt: Some("hello".into()),
            resolution: Some("720p".into()),
            duration: Some(5),
            ..TaskPayload::default()
        },
    };

    assert!(store.reroute_task(task.id, update("ark-1")).await.unwrap());
    assert!(!store.reroute_task(task.id, update("ark-2")).await.unwrap());

    let rerouted = store.find_task(Platform::Ark, "ark-1").await.unwrap().unwrap();
    assert_eq!(rerouted.previous_external_task_id.as_deref(), Some("gen-1"));
    assert_eq!(rerouted.payload.resolution.as_deref(), Some("720p"));
    assert!(rerouted.submitted_at > rerouted.created_at);
    let stale = store
        .list_in_flight(&InFlightFilter {
            platform: Platform::Ark,
            user_id: None,
            submitted_before: Some(chrono::Utc::now() - chrono::Duration::minutes(15)),
            limit: 10,
        })
        .await
        .unwrap();
    assert!(stale.is_empty());
    assert_eq!(
        store
            .count_in_flight(user_id, MediaType::Video)
            .await
            .unwrap(),
        1
    );
}
