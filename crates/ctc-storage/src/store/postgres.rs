//! Remote relational backend over a Postgres pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ctc_core::{CrawlRunAudit, RunStatus, TournamentRecord};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    has_text, validate_for_insert, DistinctField, FieldValue, Page, Pagination, StoreError,
    TournamentFilter, TournamentStore,
};

const TOURNAMENT_COLUMNS: &str = "id, name, month, year, start_date, end_date, is_international, \
     city, country, tournament_type, category, website_url, description, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub tournaments: String,
    pub runs: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            tournaments: "ct_tournaments".to_string(),
            runs: "ct_crawl_runs".to_string(),
        }
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    tables: TableNames,
}

impl PostgresStore {
    /// Table names are spliced into SQL, so only plain identifiers are accepted.
    pub fn new(pool: PgPool, tables: TableNames) -> Result<Self, StoreError> {
        for name in [&tables.tournaments, &tables.runs] {
            if !is_valid_identifier(name) {
                return Err(StoreError::InvalidTableName(name.clone()));
            }
        }
        Ok(Self { pool, tables })
    }

    pub async fn connect(database_url: &str, tables: TableNames) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Self::new(pool, tables)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Creates both tables when missing. The natural-key constraint is what keeps
    /// separate processes from storing the same tournament twice.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let t = &self.tables.tournaments;
        let r = &self.tables.runs;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    month TEXT NOT NULL,
                    year INTEGER NOT NULL CHECK (year > 0),
                    start_date TIMESTAMPTZ,
                    end_date TIMESTAMPTZ,
                    is_international BOOLEAN NOT NULL DEFAULT FALSE,
                    city TEXT,
                    country TEXT,
                    tournament_type TEXT,
                    category TEXT,
                    website_url TEXT,
                    description TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    CONSTRAINT {t}_natural_key UNIQUE (name, month, year)
                )
                "#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {r} (
                    id UUID PRIMARY KEY,
                    run_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    tournaments_count BIGINT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('success', 'failed')),
                    error_message TEXT
                )
                "#
            ),
        ];
        for sql in &statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        info!(tournaments = %t, runs = %r, "postgres schema ready");
        Ok(())
    }

    async fn fetch_by_key(&self, name: &str, month: &str, year: i32) -> Result<TournamentRecord, StoreError> {
        let sql = format!(
            "SELECT {TOURNAMENT_COLUMNS} FROM {} WHERE name = $1 AND month = $2 AND year = $3",
            self.tables.tournaments
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(month)
            .bind(year)
            .fetch_one(&self.pool)
            .await?;
        Ok(record_from_row(&row)?)
    }
}

fn record_from_row(row: &PgRow) -> Result<TournamentRecord, sqlx::Error> {
    Ok(TournamentRecord {
        id: Some(row.try_get("id")?),
        name: row.try_get("name")?,
        month: row.try_get("month")?,
        year: row.try_get("year")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        is_international: row.try_get("is_international")?,
        city: row.try_get("city")?,
        country: row.try_get("country")?,
        tournament_type: row.try_get("tournament_type")?,
        category: row.try_get("category")?,
        website_url: row.try_get("website_url")?,
        description: row.try_get("description")?,
        created_at: Some(row.try_get("created_at")?),
        updated_at: Some(row.try_get("updated_at")?),
    })
}

fn audit_from_row(row: &PgRow) -> Result<CrawlRunAudit, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(CrawlRunAudit {
        id: row.try_get("id")?,
        run_at: row.try_get("run_at")?,
        tournaments_count: row.try_get("tournaments_count")?,
        status: status.parse().map_err(StoreError::CorruptRow)?,
        error_message: row.try_get("error_message")?,
    })
}

/// Escapes `%`, `_` and `\` so the term matches literally inside ILIKE.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn push_filter(qb: &mut QueryBuilder<'static, Postgres>, filter: &TournamentFilter) {
    let mut first = true;
    let mut next = |qb: &mut QueryBuilder<'static, Postgres>| {
        qb.push(if first { " WHERE " } else { " AND " });
        first = false;
    };

    for (column, value) in filter.text_conditions() {
        next(qb);
        qb.push(column).push(" = ").push_bind(value.to_string());
    }
    if let Some(year) = filter.year {
        next(qb);
        qb.push("year = ").push_bind(year);
    }
    if let Some(flag) = filter.is_international {
        next(qb);
        qb.push("is_international = ").push_bind(flag);
    }
    if let Some(term) = filter.search_term() {
        let pattern = format!("%{}%", escape_like(term));
        next(qb);
        qb.push("(name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR city ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl TournamentStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn exists(&self, name: &str, month: &str, year: i32) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE name = $1 AND month = $2 AND year = $3)",
            self.tables.tournaments
        );
        let found: bool = sqlx::query_scalar(&sql)
            .bind(name)
            .bind(month)
            .bind(year)
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    async fn insert(&self, record: TournamentRecord) -> Result<TournamentRecord, StoreError> {
        validate_for_insert(&record)?;
        let now = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO {} ({TOURNAMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            ON CONFLICT (name, month, year) DO NOTHING
            RETURNING {TOURNAMENT_COLUMNS}
            "#,
            self.tables.tournaments
        );
        let inserted = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&record.name)
            .bind(&record.month)
            .bind(record.year)
            .bind(record.start_date)
            .bind(record.end_date)
            .bind(record.is_international)
            .bind(&record.city)
            .bind(&record.country)
            .bind(&record.tournament_type)
            .bind(&record.category)
            .bind(&record.website_url)
            .bind(&record.description)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(record_from_row(&row)?),
            None => {
                debug!(tournament = %record.natural_key(), "natural key conflict, returning stored row");
                self.fetch_by_key(&record.name, &record.month, record.year).await
            }
        }
    }

    async fn query(
        &self,
        filter: &TournamentFilter,
        pagination: Pagination,
    ) -> Result<Page<TournamentRecord>, StoreError> {
        let mut count_q: QueryBuilder<'static, Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", self.tables.tournaments));
        push_filter(&mut count_q, filter);
        let total: i64 = count_q
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut rows_q: QueryBuilder<'static, Postgres> = QueryBuilder::new(format!(
            "SELECT {TOURNAMENT_COLUMNS} FROM {}",
            self.tables.tournaments
        ));
        push_filter(&mut rows_q, filter);
        rows_q
            .push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(i64::from(pagination.page_size.max(1)))
            .push(" OFFSET ")
            .push_bind(i64::try_from(pagination.offset()).unwrap_or(i64::MAX));
        let rows = rows_q.build().fetch_all(&self.pool).await?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pagination.page_of(records, u64::try_from(total).unwrap_or(0)))
    }

    async fn distinct_values(&self, field: DistinctField) -> Result<Vec<FieldValue>, StoreError> {
        let column = field.column();
        let table = &self.tables.tournaments;
        let mut values = if field == DistinctField::Year {
            let sql = format!("SELECT DISTINCT {column} FROM {table}");
            sqlx::query_scalar::<_, i32>(&sql)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|year| FieldValue::Int(i64::from(year)))
                .collect::<Vec<_>>()
        } else {
            let sql = format!("SELECT DISTINCT {column} FROM {table} WHERE {column} IS NOT NULL");
            sqlx::query_scalar::<_, String>(&sql)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .filter(|value| has_text(value))
                .map(FieldValue::Text)
                .collect::<Vec<_>>()
        };
        // Sort client-side so ordering matches the in-memory backend regardless of collation.
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn record_run(
        &self,
        tournaments_count: i64,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<CrawlRunAudit, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, run_at, tournaments_count, status, error_message)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, run_at, tournaments_count, status, error_message
            "#,
            self.tables.runs
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(Utc::now())
            .bind(tournaments_count)
            .bind(status.as_str())
            .bind(error_message)
            .fetch_one(&self.pool)
            .await?;
        audit_from_row(&row)
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<CrawlRunAudit>, StoreError> {
        let sql = format!(
            "SELECT id, run_at, tournaments_count, status, error_message FROM {} ORDER BY run_at DESC LIMIT $1",
            self.tables.runs
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(is_valid_identifier("ct_tournaments"));
        assert!(is_valid_identifier("_staging2"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("t; DROP TABLE x"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(64)));
    }

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("100%_open\\"), "100\\%\\_open\\\\");
        assert_eq!(escape_like("open"), "open");
    }

    #[test]
    fn filter_sql_joins_conditions_with_and() {
        let filter = TournamentFilter {
            month: Some("April".into()),
            year: Some(2025),
            search: Some("open".into()),
            ..Default::default()
        };
        let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new("SELECT 1 FROM t");
        push_filter(&mut qb, &filter);
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM t WHERE month = $1 AND year = $2 AND \
             (name ILIKE $3 OR description ILIKE $4 OR city ILIKE $5)"
        );
    }

    /// Runs against a live database only when `CTC_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn live_round_trip_matches_memory_semantics() {
        let Ok(url) = std::env::var("CTC_TEST_DATABASE_URL") else {
            return;
        };
        let suffix = Uuid::new_v4().simple().to_string();
        let tables = TableNames {
            tournaments: format!("ctc_test_t_{}", &suffix[..12]),
            runs: format!("ctc_test_r_{}", &suffix[..12]),
        };
        let store = PostgresStore::connect(&url, tables.clone()).await.unwrap();
        store.ensure_schema().await.unwrap();

        for name in ["Berlin Open", "Hamburg Open", "Leipzig Blitz Cup"] {
            let mut r = TournamentRecord::new(name, "April", 2025);
            r.category = Some("Open".into());
            store.insert(r).await.unwrap();
        }
        let dup = store
            .insert(TournamentRecord::new("Berlin Open", "April", 2025))
            .await
            .unwrap();
        assert_eq!(dup.category.as_deref(), Some("Open"));
        assert!(store.exists("Berlin Open", "April", 2025).await.unwrap());

        let mut blank = TournamentRecord::new("Blank Category Cup", "May", 2025);
        blank.category = Some("\t\n".into());
        store.insert(blank).await.unwrap();
        assert_eq!(
            store.distinct_values(DistinctField::Category).await.unwrap(),
            vec![FieldValue::Text("Open".into())]
        );

        let filter = TournamentFilter {
            search: Some("OPEN".into()),
            ..Default::default()
        };
        let page = store.query(&filter, Pagination::new(1, 1)).await.unwrap();
        assert_eq!((page.records.len(), page.total, page.pages), (1, 2, 2));

        store
            .record_run(0, RunStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);

        for table in [&tables.tournaments, &tables.runs] {
            sqlx::query(&format!("DROP TABLE {table}"))
                .execute(store.pool())
                .await
                .unwrap();
        }
    }
}
