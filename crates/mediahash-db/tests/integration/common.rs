use mediahash_core::traits::WorkStore;
use mediahash_core::work::{Handler, NewWork, UpdateGuard, WorkStatus, WorkUpdate};
use mediahash_db::{Database, WorkRepository};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Spins up a PostgreSQL container, applies the workspace migrations and
/// returns a connected pool.
///
/// The `ContainerAsync` must stay in scope for the whole test; dropping it
/// stops the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "mediahash_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/mediahash_test");

    // The ready message appears once during init and once after restart.
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    Database::from_pool(pool.clone())
        .migrate()
        .await
        .expect("Failed to run migrations");

    (pool, container)
}

/// Seed `count` items named `File:Sample <n>.jpg` and move them to `status`.
pub async fn seed(repo: &WorkRepository, count: usize, status: WorkStatus) -> Vec<i64> {
    for n in 0..count {
        let work = NewWork::new(Handler::Wmc, format!("File:Sample {n}.jpg"));
        assert!(repo.insert_if_absent(&work).await.unwrap());
    }
    let ids = repo.select_batch(WorkStatus::Idle, count).await.unwrap();
    if status != WorkStatus::Idle {
        let moved = repo
            .conditional_update(
                &ids,
                UpdateGuard::unclaimed(WorkStatus::Idle),
                &WorkUpdate::new().status(status),
            )
            .await
            .unwrap();
        assert_eq!(moved as usize, ids.len());
    }
    ids
}
