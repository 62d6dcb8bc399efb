use sqlx::PgPool;
use time::macros::datetime;
use tokio_util::sync::CancellationToken;
use tracker::{
    infra::{
        db::{POSTGRES_SOURCE_ID, PostgresVersionSource},
        ticks,
    },
    tracker::{SourceError, VersionSource},
};

async fn source_with_posts(pool: PgPool) -> PostgresVersionSource {
    sqlx::query("CREATE TABLE posts (id serial PRIMARY KEY, title text NOT NULL)")
        .execute(&pool)
        .await
        .expect("create posts");
    PostgresVersionSource::new(POSTGRES_SOURCE_ID, pool)
}

async fn trigger_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar(
        "SELECT count(*) FROM pg_trigger WHERE tgname = 'tracker_touch' AND tgrelid = 'posts'::regclass",
    )
    .fetch_one(pool)
    .await
    .expect("count triggers")
}

#[sqlx::test(migrations = "./migrations")]
async fn writes_advance_the_table_version(pool: PgPool) {
    let source = source_with_posts(pool.clone()).await;
    let token = CancellationToken::new();

    assert!(source.enable_tracking("posts", &token).await.expect("enable"));
    assert!(!source.enable_tracking("posts", &token).await.expect("enable again"));
    assert!(source.is_tracking("posts", &token).await.expect("is tracking"));
    assert_eq!(trigger_count(&pool).await, 1);

    let before = source.last_version("posts", &token).await.expect("version");
    sqlx::query("INSERT INTO posts (title) VALUES ('hello')")
        .execute(&pool)
        .await
        .expect("insert");
    let after = source.last_version("posts", &token).await.expect("version");

    assert!(after > before, "{after} should be past {before}");
}

#[sqlx::test(migrations = "./migrations")]
async fn disabling_drops_the_trigger(pool: PgPool) {
    let source = source_with_posts(pool.clone()).await;
    let token = CancellationToken::new();

    source.enable_tracking("posts", &token).await.expect("enable");
    assert!(source.disable_tracking("posts", &token).await.expect("disable"));
    assert!(!source.disable_tracking("posts", &token).await.expect("disable again"));

    assert_eq!(trigger_count(&pool).await, 0);
    assert!(!source.is_tracking("posts", &token).await.expect("is tracking"));

    sqlx::query("INSERT INTO posts (title) VALUES ('untracked')")
        .execute(&pool)
        .await
        .expect("insert without trigger");
}

#[sqlx::test(migrations = "./migrations")]
async fn untracked_table_has_no_version(pool: PgPool) {
    let source = source_with_posts(pool).await;
    let token = CancellationToken::new();

    let err = source.last_version("posts", &token).await.unwrap_err();
    assert!(matches!(err, SourceError::KeyNotFound { ref key } if key == "posts"));
    assert_eq!(source.bump_version("posts", &token).await.expect("bump"), None);
    assert!(!source.set_last_version("posts", ticks::now(), &token).await.expect("set"));
}

#[sqlx::test(migrations = "./migrations")]
async fn enabling_a_missing_table_fails(pool: PgPool) {
    let source = PostgresVersionSource::new(POSTGRES_SOURCE_ID, pool);
    let err = source
        .enable_tracking("ghosts", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Database(_)));
}

#[sqlx::test(migrations = "./migrations")]
async fn set_version_round_trips(pool: PgPool) {
    let source = source_with_posts(pool).await;
    let token = CancellationToken::new();
    source.enable_tracking("posts", &token).await.expect("enable");

    let version = ticks::from_datetime(datetime!(2030-06-01 08:30:15.123456 UTC));
    assert!(source.set_last_version("posts", version, &token).await.expect("set"));
    assert_eq!(source.last_version("posts", &token).await.expect("version"), version);

    let err = source
        .set_last_version("posts", i64::MIN, &token)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Backend { .. }));
}

#[sqlx::test(migrations = "./migrations")]
async fn bumps_move_past_a_future_version(pool: PgPool) {
    let source = source_with_posts(pool).await;
    let token = CancellationToken::new();
    source.enable_tracking("posts", &token).await.expect("enable");

    let future = ticks::from_datetime(datetime!(2100-01-01 0:00 UTC));
    source
        .set_last_version("posts", future, &token)
        .await
        .expect("set");

    let first = source
        .bump_version("posts", &token)
        .await
        .expect("bump")
        .expect("tracked");
    let second = source
        .bump_version("posts", &token)
        .await
        .expect("bump")
        .expect("tracked");

    // One microsecond per bump while the clock is behind.
    assert_eq!(first, future + 10);
    assert_eq!(second, first + 10);
    assert_eq!(source.last_version("posts", &token).await.expect("version"), second);
}
