use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

/// One page of ISBNs plus the cursor for the next page. `cursor` is `None`
/// when the datastore has no more results.
#[derive(Debug, Clone)]
pub struct IsbnPage {
    pub isbns: Vec<String>,
    pub cursor: Option<String>,
}

/// Paged, read-only view of the external system of record.
#[async_trait]
pub trait IsbnSource: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&str>, limit: u32) -> Result<IsbnPage>;
}

pub struct PostgresIsbnSource {
    pool: PgPool,
}

impl PostgresIsbnSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IsbnSource for PostgresIsbnSource {
    async fn fetch_page(&self, cursor: Option<&str>, limit: u32) -> Result<IsbnPage> {
        // Keyset pagination: the cursor is the last ISBN of the previous
        // page, with the empty string admitting every non-empty ISBN.
        let after = cursor.unwrap_or("");
        let isbns: Vec<String> =
            sqlx::query_scalar("SELECT isbn FROM books WHERE isbn > $1 ORDER BY isbn LIMIT $2")
                .bind(after)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
                .context("Failed to query ISBN page from the datastore")?;

        let cursor = if isbns.len() == limit as usize {
            isbns.last().cloned()
        } else {
            None
        };

        Ok(IsbnPage { isbns, cursor })
    }
}

#[cfg(test)]
pub(crate) struct StaticIsbnSource {
    isbns: Vec<String>,
}

#[cfg(test)]
impl StaticIsbnSource {
    pub(crate) fn new(mut isbns: Vec<String>) -> Self {
        isbns.sort();
        Self { isbns }
    }
}

#[cfg(test)]
#[async_trait]
impl IsbnSource for StaticIsbnSource {
    async fn fetch_page(&self, cursor: Option<&str>, limit: u32) -> Result<IsbnPage> {
        let after = cursor.unwrap_or("");
        let isbns: Vec<String> = self
            .isbns
            .iter()
            .filter(|isbn| isbn.as_str() > after)
            .take(limit as usize)
            .cloned()
            .collect();

        let cursor = if isbns.len() == limit as usize {
            isbns.last().cloned()
        } else {
            None
        };

        Ok(IsbnPage { isbns, cursor })
    }
}
