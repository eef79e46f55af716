//! PostgreSQL fixtures for mnemo's integration tests.
//!
//! One server is shared per test binary: an external one when
//! `MNEMO_TEST_PG_URL` points at a running instance (nextest setup
//! script), otherwise a testcontainers instance started on first use. The
//! broker schema is migrated once into a template database; every test
//! then clones the template into a database of its own, so tests stay
//! isolated and teardown is a single DROP.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use mnemo_db::pool;

/// Database holding the migrated schema that test databases are cloned
/// from. Nothing ever connects to it outside [`prepare_template`], which
/// is what lets `CREATE DATABASE ... TEMPLATE` copy it.
const TEMPLATE_DB: &str = "mnemo_test_template";

struct PgServer {
    /// Server root URL, no database name.
    url: String,
    /// Keeps the container alive; `None` for an external server.
    _keepalive: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn server() -> &'static PgServer {
    SERVER
        .get_or_init(|| async {
            let server = match std::env::var("MNEMO_TEST_PG_URL") {
                Ok(url) => PgServer {
                    url,
                    _keepalive: None,
                },
                Err(_) => {
                    let container = Postgres::default()
                        .with_tag("18")
                        .start()
                        .await
                        .expect("postgres test container failed to start");
                    let host = container.get_host().await.expect("container host");
                    let port = container
                        .get_host_port_ipv4(5432)
                        .await
                        .expect("container port");
                    PgServer {
                        url: format!("postgresql://postgres:postgres@{host}:{port}"),
                        _keepalive: Some(container),
                    }
                }
            };
            prepare_template(&server.url).await;
            server
        })
        .await
}

/// One-off connection to the server's `postgres` database for CREATE/DROP
/// DATABASE statements, which cannot run inside a pooled transaction.
async fn admin(url: &str) -> PgConnection {
    PgConnection::connect(&format!("{url}/postgres"))
        .await
        .expect("postgres admin connection failed")
}

/// Create the template database if missing and bring its schema up to
/// date. Runs once per server; an external server reused across binaries
/// just gets an idempotent migration pass.
async fn prepare_template(url: &str) {
    let mut conn = admin(url).await;
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(TEMPLATE_DB)
            .fetch_one(&mut conn)
            .await
            .expect("pg_database lookup failed");
    if !exists {
        // Another test binary may race this on an external server; losing
        // the race is fine as long as the template ends up present.
        if let Err(e) = conn
            .execute(format!("CREATE DATABASE {TEMPLATE_DB}").as_str())
            .await
        {
            let still_missing: bool = !sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)",
            )
            .bind(TEMPLATE_DB)
            .fetch_one(&mut conn)
            .await
            .unwrap_or(false);
            if still_missing {
                panic!("creating the template database failed: {e}");
            }
        }
    }
    let _ = conn.close().await;

    let template_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&format!("{url}/{TEMPLATE_DB}"))
        .await
        .expect("connecting to the template database failed");
    pool::run_migrations(&template_pool, pool::default_migrations_path())
        .await
        .expect("migrating the template database failed");
    template_pool.close().await;
}

/// A fresh, fully-migrated database cloned from the template.
///
/// Returns the pool and the database name; pass the name to
/// [`drop_test_db`] when the test finishes.
pub async fn create_test_db() -> (PgPool, String) {
    let server = server().await;
    let name = format!("mnemo_test_{}", Uuid::new_v4().simple());

    let mut conn = admin(&server.url).await;
    let clone_stmt = format!("CREATE DATABASE {name} TEMPLATE {TEMPLATE_DB}");
    // The template is briefly busy while another binary migrates it;
    // cloning just needs a short retry, not a failure.
    let mut attempts = 0;
    loop {
        match conn.execute(clone_stmt.as_str()).await {
            Ok(_) => break,
            Err(_) if attempts < 10 => {
                attempts += 1;
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            Err(e) => panic!("cloning {TEMPLATE_DB} into {name} failed: {e}"),
        }
    }
    let _ = conn.close().await;

    let test_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&format!("{}/{name}", server.url))
        .await
        .unwrap_or_else(|e| panic!("connecting to {name} failed: {e}"));

    (test_pool, name)
}

/// Drop a database created by [`create_test_db`]. `WITH (FORCE)` severs
/// any connection a failed test left behind.
pub async fn drop_test_db(name: &str) {
    let server = server().await;
    let mut conn = admin(&server.url).await;
    conn.execute(format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)").as_str())
        .await
        .unwrap_or_else(|e| panic!("dropping {name} failed: {e}"));
    let _ = conn.close().await;
}
