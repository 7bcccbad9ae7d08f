pub mod bootstrap;
pub mod store;

#[cfg(test)]
pub(crate) async fn memory_pool() -> sqlx::SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool")
}

#[cfg(test)]
pub(crate) async fn bootstrapped_store() -> store::SqlStore {
    let pool = memory_pool().await;
    bootstrap::run(&pool).await.expect("bootstrap in-memory schema");
    store::SqlStore::new(pool)
}
