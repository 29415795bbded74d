use anyhow::{Context, Result};
use clickhouse_rs::{ClientHandle, Pool};

/// Tracking table of applied migration versions.
const VERSION_TABLE: &str = "rollwheel_schema_migrations";

/// Embedded SQL migration.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
///
/// SQL text uses `{database}` and `{table}` placeholders for the configured
/// slot state table.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_slot_states.up.sql"),
        down_sql: include_str!("sql/001_slot_states.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_slot_states_ttl.up.sql"),
        down_sql: include_str!("sql/002_slot_states_ttl.down.sql"),
    },
];

/// Schema migrations of the slot state store.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// Applies the embedded migrations to `database.table`.
///
/// The applied version is kept as a single row with a dirty flag that is set
/// while a migration runs; a dirty version blocks further migrations.
pub struct ClickHouseMigrator {
    pool: Pool,
    database: String,
    table: String,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool, database: String, table: String) -> Self {
        Self {
            pool,
            database,
            table,
        }
    }

    async fn handle(&self, purpose: &'static str) -> Result<ClientHandle> {
        self.pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {purpose}"))
    }

    async fn ensure_version_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {}.{VERSION_TABLE} (version Int64, dirty UInt8) ENGINE = TinyLog",
            self.database
        );
        self.handle("version table")
            .await?
            .execute(sql.as_str())
            .await
            .context("creating migration version table")?;
        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let sql = format!(
            "SELECT version, dirty FROM {}.{VERSION_TABLE} LIMIT 1",
            self.database
        );
        let block = self
            .handle("version check")
            .await?
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, false));
        };
        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
        let version = u32::try_from(version).context("migration version out of range")?;
        Ok((version, dirty != 0))
    }

    /// Replaces the tracked version. `None` clears it.
    async fn set_version(&self, version: Option<(u32, bool)>) -> Result<()> {
        let mut handle = self.handle("version update").await?;
        let truncate = format!("TRUNCATE TABLE {}.{VERSION_TABLE}", self.database);
        handle
            .execute(truncate.as_str())
            .await
            .context("clearing migration version")?;

        if let Some((version, dirty)) = version {
            let insert = format!(
                "INSERT INTO {}.{VERSION_TABLE} (version, dirty) VALUES ({version}, {})",
                self.database,
                u8::from(dirty)
            );
            handle
                .execute(insert.as_str())
                .await
                .context("recording migration version")?;
        }
        Ok(())
    }

    async fn execute_migration(&self, sql: &str) -> Result<()> {
        let rendered = render_sql(sql, &self.database, &self.table);
        let mut handle = self.handle("migration").await?;
        for statement in split_statements(&rendered) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }
        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_version_table().await?;

        let (current, dirty) = self.current_version().await?;
        if dirty {
            anyhow::bail!("migration version {current} is dirty, manual intervention required");
        }

        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
        if pending.is_empty() {
            tracing::info!(version = current, "slot state schema up to date");
            return Ok(());
        }

        for migration in &pending {
            tracing::info!(version = migration.version, "applying migration");
            self.set_version(Some((migration.version, true))).await?;
            self.execute_migration(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;
            self.set_version(Some((migration.version, false))).await?;
        }

        tracing::info!(
            from = current,
            applied = pending.len(),
            "slot state migrations completed"
        );
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_version_table().await?;

        let (current, _) = self.current_version().await?;
        if current == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("migration version {current} not found"))?;

        tracing::info!(version = current, "rolling back migration");
        self.set_version(Some((current, true))).await?;
        self.execute_migration(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current}"))?;

        let previous = previous_version(current);
        self.set_version(previous.map(|v| (v, false))).await?;

        tracing::info!(version = previous.unwrap_or(0), "rollback completed");
        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_version_table().await?;
        self.current_version().await
    }
}

/// The embedded version preceding `version`, if any.
fn previous_version(version: u32) -> Option<u32> {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < version)
        .max()
}

/// Substitutes the table placeholders of an embedded migration.
fn render_sql(sql: &str, database: &str, table: &str) -> String {
    sql.replace("{database}", database).replace("{table}", table)
}

/// Splits SQL text into statements on semicolons, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
