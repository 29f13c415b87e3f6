//! `sqlx` Postgres implementation of [`DealStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deals_core::{AppMetadata, CatalogEntry, CatalogKind, DealListing, NewDeal, Package};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::store::{DealStore, StoreError, UpsertedDeal};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }
}

fn map_insert_error(err: sqlx::Error, entry: &CatalogEntry) -> StoreError {
    let unique = err
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if unique {
        StoreError::UniqueViolation {
            kind: entry.kind(),
            key: entry.key().to_string(),
        }
    } else {
        StoreError::Database(err)
    }
}

fn package_from_row(row: &PgRow) -> Result<Package, sqlx::Error> {
    Ok(Package {
        id: row.try_get("id")?,
        package_uid: row.try_get("package_uid")?,
        name: row.try_get("name")?,
        category_id: row.try_get("category_id")?,
        platform_id: row.try_get("platform_id")?,
        store_url: row.try_get("store_url")?,
        description: row.try_get("description")?,
        rating: row.try_get("rating")?,
        installs: row.try_get("installs")?,
        icon_url: row.try_get("icon_url")?,
        scraped_json: row.try_get("scraped_json")?,
        updated_at: row.try_get("updated_at")?,
        not_found_at: row.try_get("not_found_at")?,
    })
}

const PACKAGE_COLUMNS: &str = "id, package_uid, name, category_id, platform_id, store_url, \
     description, rating, installs, icon_url, scraped_json, updated_at, not_found_at";

#[async_trait]
impl DealStore for PgStore {
    async fn find_catalog_id(&self, kind: CatalogKind, key: &str) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "SELECT id FROM {} WHERE {} = $1",
            kind.table(),
            kind.key_column()
        );
        let id = sqlx::query_scalar::<_, i64>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert_catalog(&self, entry: &CatalogEntry) -> Result<i64, StoreError> {
        let query = match entry {
            CatalogEntry::DataSource { name, base_url } => sqlx::query_scalar::<_, i64>(
                "INSERT INTO data_sources (name, base_url) VALUES ($1, $2) RETURNING id",
            )
            .bind(name)
            .bind(base_url),
            CatalogEntry::Channel {
                data_source_id,
                channel_name,
                base_route,
            } => sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO channels (data_source_id, channel_name, base_route)
                VALUES ($1, $2, $3)
                RETURNING id
                "#,
            )
            .bind(*data_source_id)
            .bind(channel_name)
            .bind(base_route),
            CatalogEntry::Category { name } => {
                sqlx::query_scalar::<_, i64>("INSERT INTO categories (name) VALUES ($1) RETURNING id")
                    .bind(name)
            }
            CatalogEntry::Platform { name } => {
                sqlx::query_scalar::<_, i64>("INSERT INTO platforms (name) VALUES ($1) RETURNING id")
                    .bind(name)
            }
            CatalogEntry::Package(pkg) => sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO packages (package_uid, name, category_id, platform_id, store_url, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                RETURNING id
                "#,
            )
            .bind(&pkg.package_uid)
            .bind(&pkg.name)
            .bind(pkg.category_id)
            .bind(pkg.platform_id)
            .bind(&pkg.store_url),
        };

        query
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_insert_error(err, entry))
    }

    async fn package(&self, id: i64) -> Result<Option<Package>, StoreError> {
        let sql = format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(package_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_package_metadata(
        &self,
        id: i64,
        metadata: &AppMetadata,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE packages
               SET name = COALESCE($2, name),
                   description = COALESCE($3, description),
                   rating = COALESCE($4, rating),
                   store_url = COALESCE($5, store_url),
                   icon_url = COALESCE($6, icon_url),
                   installs = COALESCE($7, installs),
                   scraped_json = $8,
                   updated_at = $9,
                   not_found_at = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&metadata.title)
        .bind(&metadata.description)
        .bind(metadata.rating)
        .bind(&metadata.store_url)
        .bind(&metadata.icon_url)
        .bind(&metadata.installs)
        .bind(&metadata.raw)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: CatalogKind::Package,
                id,
            });
        }
        Ok(())
    }

    async fn set_package_category(&self, id: i64, category_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE packages SET category_id = $2 WHERE id = $1")
            .bind(id)
            .bind(category_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: CatalogKind::Package,
                id,
            });
        }
        Ok(())
    }

    async fn mark_package_not_found(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE packages SET not_found_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: CatalogKind::Package,
                id,
            });
        }
        Ok(())
    }

    async fn packages_missing_metadata(
        &self,
        after_id: i64,
        limit: usize,
        absent_before: DateTime<Utc>,
    ) -> Result<Vec<Package>, StoreError> {
        let sql = format!(
            "SELECT {PACKAGE_COLUMNS} FROM packages \
             WHERE scraped_json IS NULL AND id > $1 \
               AND (not_found_at IS NULL OR not_found_at < $3) \
             ORDER BY id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(after_id)
            .bind(limit as i64)
            .bind(absent_before)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(package_from_row(&row)?);
        }
        Ok(out)
    }

    async fn upsert_deal(&self, deal: &NewDeal) -> Result<UpsertedDeal, StoreError> {
        // xmax is zero only for a freshly inserted tuple.
        let row = sqlx::query(
            r#"
            INSERT INTO deals (
                title, description, price_before, price_after, currency,
                discount_type, discount_value, url, referral_code, score_at_scrape,
                posted_utc, expiry_date, channel_id, data_source_id, package_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT ON CONSTRAINT deals_dedup_key
            DO UPDATE SET score_at_scrape = EXCLUDED.score_at_scrape,
                          metadata = EXCLUDED.metadata
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&deal.title)
        .bind(&deal.description)
        .bind(deal.price_before)
        .bind(deal.price_after)
        .bind(&deal.currency)
        .bind(&deal.discount_type)
        .bind(deal.discount_value)
        .bind(&deal.url)
        .bind(&deal.referral_code)
        .bind(deal.score_at_scrape)
        .bind(deal.posted_utc)
        .bind(deal.expiry_date)
        .bind(deal.channel_id)
        .bind(deal.data_source_id)
        .bind(deal.package_id)
        .bind(&deal.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertedDeal {
            id: row.try_get("id")?,
            inserted: row.try_get("inserted")?,
        })
    }

    async fn recent_deals(&self, limit: usize) -> Result<Vec<DealListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.title, d.description, d.price_before, d.price_after, d.currency,
                   d.discount_type, d.discount_value, d.url, d.referral_code,
                   d.score_at_scrape, d.posted_utc, d.expiry_date,
                   d.channel_id, d.data_source_id,
                   c.channel_name, s.name AS source_name
              FROM deals d
              LEFT JOIN channels c ON c.id = d.channel_id
              LEFT JOIN data_sources s ON s.id = d.data_source_id
             ORDER BY d.posted_utc DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DealListing {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                description: row.try_get("description")?,
                price_before: row.try_get("price_before")?,
                price_after: row.try_get("price_after")?,
                currency: row.try_get("currency")?,
                discount_type: row.try_get("discount_type")?,
                discount_value: row.try_get("discount_value")?,
                url: row.try_get("url")?,
                referral_code: row.try_get("referral_code")?,
                score_at_scrape: row.try_get("score_at_scrape")?,
                posted_utc: row.try_get("posted_utc")?,
                expiry_date: row.try_get("expiry_date")?,
                channel_id: row.try_get("channel_id")?,
                data_source_id: row.try_get("data_source_id")?,
                channel_name: row.try_get("channel_name")?,
                source_name: row.try_get("source_name")?,
            });
        }
        Ok(out)
    }

    async fn count_deals(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM deals")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
