use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Open a connection pool to the catalog database.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
