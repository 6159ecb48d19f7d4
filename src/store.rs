use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use sqlx::query_builder::Separated;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::records::{
    ASSET_PRICES_TABLE, AssetPriceRecord, CORRELATION_TABLE, CorrelationPivot,
    CorrelationRecord, RELATIVE_STRENGTH_TABLE, RelativeStrengthRecord,
};

// keeps every INSERT well below SQLite's bound-parameter limit
const MAX_BINDS_PER_STATEMENT: usize = 16_000;
const STAGING_SUFFIX: &str = "__staging";
// SQLite's default SQLITE_MAX_COLUMN, Date included
const MAX_COLUMNS: usize = 2_000;
const WIDE_INDEXES: &[&[&str]] = &[&["Date"]];

/// A row type persisted as one long-format table.
pub trait TableRow: Send + Sync {
    const TABLE: &'static str;
    /// `(column, SQL type)` in insert order.
    const COLUMNS: &'static [(&'static str, &'static str)];
    const INDEXES: &'static [&'static [&'static str]];

    /// Push one bind per column, in `COLUMNS` order.
    fn bind_row<'args>(&'args self, row: &mut Separated<'_, 'args, Sqlite, &'static str>);
}

impl TableRow for CorrelationRecord {
    const TABLE: &'static str = CORRELATION_TABLE;
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("Date", "TEXT NOT NULL"),
        ("Pair", "TEXT NOT NULL"),
        ("RollingCorrelation", "REAL"),
        ("Window", "INTEGER NOT NULL"),
    ];
    const INDEXES: &'static [&'static [&'static str]] = &[&["Pair", "Window"], &["Date"]];

    fn bind_row<'args>(&'args self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.date)
            .push_bind(self.pair.as_str())
            .push_bind(self.rolling_correlation)
            .push_bind(self.window);
    }
}

impl TableRow for RelativeStrengthRecord {
    const TABLE: &'static str = RELATIVE_STRENGTH_TABLE;
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("Date", "TEXT NOT NULL"),
        ("Pair", "TEXT NOT NULL"),
        ("Base", "TEXT NOT NULL"),
        ("Quote", "TEXT NOT NULL"),
        ("Window", "INTEGER NOT NULL"),
        ("RS", "REAL"),
        ("RS_Smooth", "REAL"),
    ];
    const INDEXES: &'static [&'static [&'static str]] = &[&["Pair", "Window"], &["Date"]];

    fn bind_row<'args>(&'args self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.date)
            .push_bind(self.pair.as_str())
            .push_bind(self.base.as_str())
            .push_bind(self.quote.as_str())
            .push_bind(self.window)
            .push_bind(self.rs)
            .push_bind(self.rs_smooth);
    }
}

impl TableRow for AssetPriceRecord {
    const TABLE: &'static str = ASSET_PRICES_TABLE;
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("Date", "TEXT NOT NULL"),
        ("Ticker", "TEXT NOT NULL"),
        ("Price", "REAL NOT NULL"),
        ("Volume", "REAL NOT NULL"),
        ("RSI", "REAL"),
        ("MACD", "REAL"),
        ("MACD_Signal", "REAL"),
        ("SMA_20", "REAL"),
        ("SMA_50", "REAL"),
        ("EMA_20", "REAL"),
        ("EMA_50", "REAL"),
        ("MarketCap", "REAL"),
    ];
    const INDEXES: &'static [&'static [&'static str]] = &[&["Ticker", "Date"]];

    fn bind_row<'args>(&'args self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.date)
            .push_bind(self.ticker.as_str())
            .push_bind(self.price)
            .push_bind(self.volume)
            .push_bind(self.rsi)
            .push_bind(self.macd)
            .push_bind(self.macd_signal)
            .push_bind(self.sma_20)
            .push_bind(self.sma_50)
            .push_bind(self.ema_20)
            .push_bind(self.ema_50)
            .push_bind(self.market_cap);
    }
}

/// Filter for reads. The same value is the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SeriesQuery {
    pub window: Option<u32>,
    /// Matches either side of a pair, Base/Quote, or Ticker.
    pub asset: Option<String>,
    pub since: Option<NaiveDate>,
}

impl SeriesQuery {
    pub fn window(mut self, window: u32) -> Self {
        self.window = Some(window);
        self
    }

    pub fn asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into());
        self
    }

    pub fn since(mut self, date: NaiveDate) -> Self {
        self.since = Some(date);
        self
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Handle on one SQLite database holding long-format result tables.
#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let connect_err = |source| StoreError::Connect {
            url: url.to_string(),
            source,
        };
        if let Some(path_part) = url.strip_prefix("sqlite://")
            && let Some(parent) = Path::new(path_part).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| connect_err(sqlx::Error::Io(e)))?;
        }
        let options = SqliteConnectOptions::from_str(url)
            .map_err(connect_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(connect_err)?;
        info!("connected to {}", url);
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start an all-or-nothing replacement of one or more tables.
    pub async fn begin_replace(&self) -> Result<TableReplacement, StoreError> {
        let tx = self.pool.begin().await.map_err(|source| StoreError::Replace {
            table: "<begin>".into(),
            source,
        })?;
        Ok(TableReplacement {
            tx,
            staged: Vec::new(),
        })
    }

    /// Replace a single table with `rows`.
    pub async fn replace<R: TableRow>(&self, rows: &[R]) -> Result<usize, StoreError> {
        let mut replacement = self.begin_replace().await?;
        replacement.stage(rows).await?;
        replacement.commit().await?;
        Ok(rows.len())
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await
                .map_err(|source| StoreError::Read {
                    table: table.to_string(),
                    source,
                })?;
        Ok(found.is_some())
    }

    /// Most recent `Date` in `table`, `None` if the table is missing or empty.
    pub async fn last_update(&self, table: &str) -> Result<Option<NaiveDate>, StoreError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let row: (Option<String>,) = sqlx::query_as(&format!("SELECT MAX(\"Date\") FROM \"{}\"", table))
            .fetch_one(&self.pool)
            .await
            .map_err(|source| StoreError::Read {
                table: table.to_string(),
                source,
            })?;
        Ok(row
            .0
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    pub async fn correlations(
        &self,
        query: &SeriesQuery,
    ) -> Result<Vec<CorrelationRecord>, StoreError> {
        let mut qb = select::<CorrelationRecord>();
        if let Some(w) = query.window {
            qb.push(" AND \"Window\" = ").push_bind(w);
        }
        if let Some(asset) = &query.asset {
            let esc = escape_like(asset);
            qb.push(" AND (\"Pair\" LIKE ")
                .push_bind(format!("{}/%", esc))
                .push(" ESCAPE '\\' OR \"Pair\" LIKE ")
                .push_bind(format!("%/{}", esc))
                .push(" ESCAPE '\\')");
        }
        if let Some(since) = query.since {
            qb.push(" AND \"Date\" >= ").push_bind(since);
        }
        self.fetch(qb).await
    }

    pub async fn relative_strength(
        &self,
        query: &SeriesQuery,
    ) -> Result<Vec<RelativeStrengthRecord>, StoreError> {
        let mut qb = select::<RelativeStrengthRecord>();
        if let Some(w) = query.window {
            qb.push(" AND \"Window\" = ").push_bind(w);
        }
        if let Some(asset) = &query.asset {
            qb.push(" AND (\"Base\" = ")
                .push_bind(asset.clone())
                .push(" OR \"Quote\" = ")
                .push_bind(asset.clone())
                .push(")");
        }
        if let Some(since) = query.since {
            qb.push(" AND \"Date\" >= ").push_bind(since);
        }
        self.fetch(qb).await
    }

    /// `asset_prices` rows; the window filter does not apply.
    pub async fn asset_prices(
        &self,
        query: &SeriesQuery,
    ) -> Result<Vec<AssetPriceRecord>, StoreError> {
        let mut qb = select::<AssetPriceRecord>();
        if let Some(asset) = &query.asset {
            qb.push(" AND \"Ticker\" = ").push_bind(asset.clone());
        }
        if let Some(since) = query.since {
            qb.push(" AND \"Date\" >= ").push_bind(since);
        }
        self.fetch(qb).await
    }

    async fn fetch<R>(&self, mut qb: QueryBuilder<'_, Sqlite>) -> Result<Vec<R>, StoreError>
    where
        R: TableRow + for<'r> FromRow<'r, SqliteRow> + Unpin,
    {
        if !self.table_exists(R::TABLE).await? {
            debug!("{} does not exist yet", R::TABLE);
            return Ok(Vec::new());
        }
        qb.push(" ORDER BY rowid");
        qb.build_query_as::<R>()
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StoreError::Read {
                table: R::TABLE.to_string(),
                source,
            })
    }
}

fn select<R: TableRow>() -> QueryBuilder<'static, Sqlite> {
    let cols = R::COLUMNS
        .iter()
        .map(|(c, _)| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");
    QueryBuilder::new(format!("SELECT {} FROM \"{}\" WHERE 1 = 1", cols, R::TABLE))
}

struct StagedTable {
    table: &'static str,
    indexes: &'static [&'static [&'static str]],
    /// `None` drops the live table without a replacement.
    rows: Option<usize>,
}

/// Tables staged inside one open transaction. Nothing is visible to other
/// connections until `commit`; dropping the value rolls everything back.
pub struct TableReplacement {
    tx: Transaction<'static, Sqlite>,
    staged: Vec<StagedTable>,
}

impl TableReplacement {
    /// Write `rows` into the staging copy of `R::TABLE`.
    pub async fn stage<R: TableRow>(&mut self, rows: &[R]) -> Result<usize, StoreError> {
        let table = R::TABLE;
        let staging = format!("{}{}", table, STAGING_SUFFIX);
        let err = |source| StoreError::Replace {
            table: table.to_string(),
            source,
        };

        sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", staging))
            .execute(&mut *self.tx)
            .await
            .map_err(err)?;
        let columns = R::COLUMNS
            .iter()
            .map(|(c, ty)| format!("\"{}\" {}", c, ty))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("CREATE TABLE \"{}\" ({})", staging, columns))
            .execute(&mut *self.tx)
            .await
            .map_err(err)?;

        let names = R::COLUMNS
            .iter()
            .map(|(c, _)| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let per_statement = (MAX_BINDS_PER_STATEMENT / R::COLUMNS.len()).max(1);
        for chunk in rows.chunks(per_statement) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO \"{}\" ({}) ", staging, names));
            qb.push_values(chunk, |mut b, row| row.bind_row(&mut b));
            qb.build().execute(&mut *self.tx).await.map_err(err)?;
        }
        debug!("staged {} rows for {}", rows.len(), table);
        self.staged.push(StagedTable {
            table,
            indexes: R::INDEXES,
            rows: Some(rows.len()),
        });
        Ok(rows.len())
    }

    /// Write `pivot` into the staging copy of `table`: a `Date` column plus
    /// one REAL column per series. A pivot wider than SQLite allows is not
    /// stored; the live table is dropped on commit so it cannot go stale.
    pub async fn stage_wide(
        &mut self,
        table: &'static str,
        pivot: &CorrelationPivot,
    ) -> Result<usize, StoreError> {
        if pivot.columns.len() + 1 > MAX_COLUMNS {
            warn!(
                "{} series exceed the column limit, {} will not be written",
                pivot.columns.len(),
                table
            );
            self.staged.push(StagedTable {
                table,
                indexes: WIDE_INDEXES,
                rows: None,
            });
            return Ok(0);
        }
        let staging = format!("{}{}", table, STAGING_SUFFIX);
        let err = |source| StoreError::Replace {
            table: table.to_string(),
            source,
        };

        sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", staging))
            .execute(&mut *self.tx)
            .await
            .map_err(err)?;
        let series: Vec<String> = pivot.columns.iter().map(|c| quote_ident(c)).collect();
        let columns = std::iter::once("\"Date\" TEXT NOT NULL".to_string())
            .chain(series.iter().map(|c| format!("{} REAL", c)))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("CREATE TABLE \"{}\" ({})", staging, columns))
            .execute(&mut *self.tx)
            .await
            .map_err(err)?;

        let names = std::iter::once("\"Date\"".to_string())
            .chain(series.iter().cloned())
            .collect::<Vec<_>>()
            .join(", ");
        let per_statement = (MAX_BINDS_PER_STATEMENT / (series.len() + 1)).max(1);
        for chunk in pivot.rows.chunks(per_statement) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO \"{}\" ({}) ", staging, names));
            qb.push_values(chunk, |mut b, (date, cells)| {
                b.push_bind(*date);
                for cell in cells {
                    b.push_bind(*cell);
                }
            });
            qb.build().execute(&mut *self.tx).await.map_err(err)?;
        }
        debug!(
            "staged {} dates x {} series for {}",
            pivot.rows.len(),
            series.len(),
            table
        );
        self.staged.push(StagedTable {
            table,
            indexes: WIDE_INDEXES,
            rows: Some(pivot.rows.len()),
        });
        Ok(pivot.rows.len())
    }

    /// Swap every staged table into place and commit.
    pub async fn commit(mut self) -> Result<Vec<(&'static str, usize)>, StoreError> {
        for staged in &self.staged {
            let table = staged.table;
            let err = |source| StoreError::Replace {
                table: table.to_string(),
                source,
            };
            sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
                .execute(&mut *self.tx)
                .await
                .map_err(err)?;
            if staged.rows.is_none() {
                continue;
            }
            sqlx::query(&format!(
                "ALTER TABLE \"{}{}\" RENAME TO \"{}\"",
                table, STAGING_SUFFIX, table
            ))
            .execute(&mut *self.tx)
            .await
            .map_err(err)?;
            for cols in staged.indexes {
                let name = format!("idx_{}_{}", table, cols.join("_").to_lowercase());
                let list = cols
                    .iter()
                    .map(|c| format!("\"{}\"", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
                    name, table, list
                ))
                .execute(&mut *self.tx)
                .await
                .map_err(err)?;
            }
        }
        let summary: Vec<(&'static str, usize)> = self
            .staged
            .iter()
            .filter_map(|s| Some((s.table, s.rows?)))
            .collect();
        let tables = summary.iter().map(|(t, _)| *t).collect::<Vec<_>>().join(", ");
        self.tx.commit().await.map_err(|source| StoreError::Replace {
            table: tables,
            source,
        })?;
        for (table, rows) in &summary {
            info!("replaced {} ({} rows)", table, rows);
        }
        Ok(summary)
    }
}
