//! PostgreSQL fixture tests. Skipped when `pg_ctl` is not installed.

use db_fixtures::{config::Settings, ports::PortAllocator, postgres::PostgresProc};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn postgres_available() -> bool {
    if which::which("pg_ctl").is_err() {
        eprintln!("skipping: pg_ctl not found in PATH");
        return false;
    }
    true
}

#[tokio::test]
async fn server_starts_on_a_free_port_and_cleans_up_on_stop() {
    init_tracing();
    if !postgres_available() {
        return;
    }

    //* Given
    let settings = Settings::default();
    let ports = PortAllocator::default();
    let pg = PostgresProc::new(settings.postgresql);

    //* When
    let server = pg.server(&ports).await.expect("server should start");

    //* Then
    assert!(server.running().await);
    assert!(server.data_dir().exists());
    assert!(server.log_file().exists());
    tokio::net::TcpStream::connect((server.host(), server.port()))
        .await
        .expect("server should accept TCP connections");

    //* When
    let data_dir = server.data_dir().to_path_buf();
    pg.stop().await;

    //* Then the data directory is gone with the server
    assert!(!data_dir.exists());
}

#[tokio::test]
async fn one_declaration_starts_at_most_one_server() {
    init_tracing();
    if !postgres_available() {
        return;
    }

    //* Given
    let settings = Settings::default();
    let ports = PortAllocator::default();
    let pg = PostgresProc::new(settings.postgresql);

    //* When
    let first = pg.server(&ports).await.expect("server should start");
    let second = pg.server(&ports).await.expect("cached server");

    //* Then both calls observe the same instance
    assert!(std::ptr::eq(first, second));
    assert_eq!(first.port(), second.port());

    pg.stop().await;
}

#[cfg(feature = "postgres")]
#[tokio::test]
async fn logical_databases_are_isolated_and_dropped_on_teardown() {
    use sqlx::{Connection as _, PgConnection, Row as _};

    init_tracing();
    if !postgres_available() {
        return;
    }

    //* Given one server and two logical databases on it
    let settings = Settings::default();
    let ports = PortAllocator::default();
    let pg = PostgresProc::new(settings.postgresql);

    let mut first = pg.database(&ports).await.expect("first database");
    let mut second = pg.database(&ports).await.expect("second database");
    assert_ne!(first.name(), second.name());

    //* When a table is created in the first database only
    sqlx::query("CREATE TABLE widgets (id INT PRIMARY KEY)")
        .execute(&mut *first)
        .await
        .expect("create table");

    //* Then the second database does not see it
    let count: i64 = sqlx::query("SELECT count(*) FROM pg_tables WHERE tablename = 'widgets'")
        .fetch_one(&mut *second)
        .await
        .expect("catalog query")
        .get(0);
    assert_eq!(count, 0);

    //* When both are torn down
    let server = pg.server(&ports).await.expect("cached server");
    let gone = first.name().to_owned();
    let admin_url = server.connection_url("postgres");
    first.teardown().await;
    second.teardown().await;

    //* Then the databases no longer exist but the server still runs
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .expect("admin connection");
    let remaining: i64 =
        sqlx::query("SELECT count(*) FROM pg_database WHERE datname = $1")
            .bind(&gone)
            .fetch_one(&mut admin)
            .await
            .expect("catalog query")
            .get(0);
    assert_eq!(remaining, 0);
    let _ = admin.close().await;
    assert!(server.running().await);

    pg.stop().await;
}
