//! Seed the catalog from a YAML file.
//!
//! ```yaml
//! products:
//!   - name: Classic Tee
//!     slug: classic-tee
//!     variants:
//!       - sku: TEE-M
//!         name: Classic Tee - Medium
//!         price: "20.00"
//!         stock: 25
//! ```
//!
//! Products are matched on slug and variants on SKU, so re-running the seed
//! updates prices and stock in place.

use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{error, info};

use proshop_storefront::db;

/// Top-level seed document.
#[derive(Debug, Deserialize)]
pub struct CatalogSeed {
    pub products: Vec<ProductSeed>,
}

#[derive(Debug, Deserialize)]
pub struct ProductSeed {
    pub name: String,
    pub slug: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub variants: Vec<VariantSeed>,
}

#[derive(Debug, Deserialize)]
pub struct VariantSeed {
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    pub stock: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

const fn default_active() -> bool {
    true
}

/// Problems that make a seed file unusable.
#[must_use]
pub fn validate(seed: &CatalogSeed) -> Vec<String> {
    let mut errors = Vec::new();
    let mut skus = std::collections::HashSet::new();
    for product in &seed.products {
        if product.variants.is_empty() {
            errors.push(format!("product {} has no variants", product.slug));
        }
        for variant in &product.variants {
            if variant.price.is_sign_negative() {
                errors.push(format!("variant {} has a negative price", variant.sku));
            }
            if i32::try_from(variant.stock).is_err() {
                errors.push(format!("variant {} stock is too large", variant.sku));
            }
            if !skus.insert(variant.sku.as_str()) {
                errors.push(format!("duplicate sku {}", variant.sku));
            }
        }
    }
    errors
}

/// Load a catalog seed file into the database.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, fails validation,
/// or the database rejects the rows.
pub async fn catalog(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(file_path);
    if !path.exists() {
        return Err(format!("File not found: {file_path}").into());
    }

    info!(path = %file_path, "Loading catalog seed");
    let content = tokio::fs::read_to_string(path).await?;
    let seed: CatalogSeed = serde_yaml::from_str(&content)?;

    let errors = validate(&seed);
    if !errors.is_empty() {
        error!("Seed validation failed:");
        for err in &errors {
            error!("  - {err}");
        }
        return Err(format!("{} validation errors found", errors.len()).into());
    }

    let database_url = super::database_url()?;
    let pool = db::create_pool(&database_url).await?;
    info!("Connected to database");

    let variants = insert(&pool, &seed).await?;
    info!(products = seed.products.len(), variants, "Seeding complete!");
    Ok(())
}

async fn insert(pool: &PgPool, seed: &CatalogSeed) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut count = 0;

    for product in &seed.products {
        let product_id: i32 = sqlx::query_scalar(
            r"
            INSERT INTO storefront.product (name, slug, is_active)
            VALUES ($1, $2, $3)
            ON CONFLICT (slug) DO UPDATE
                SET name = EXCLUDED.name, is_active = EXCLUDED.is_active
            RETURNING id
            ",
        )
        .bind(&product.name)
        .bind(&product.slug)
        .bind(product.is_active)
        .fetch_one(&mut *tx)
        .await?;

        for variant in &product.variants {
            sqlx::query(
                r"
                INSERT INTO storefront.variant (product_id, sku, name, price, stock, is_active)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (sku) DO UPDATE
                    SET product_id = EXCLUDED.product_id,
                        name = EXCLUDED.name,
                        price = EXCLUDED.price,
                        stock = EXCLUDED.stock,
                        is_active = EXCLUDED.is_active,
                        updated_at = now()
                ",
            )
            .bind(product_id)
            .bind(&variant.sku)
            .bind(&variant.name)
            .bind(variant.price)
            .bind(i32::try_from(variant.stock).unwrap_or(i32::MAX))
            .bind(variant.is_active)
            .execute(&mut *tx)
            .await?;
            count += 1;
        }
    }

    tx.commit().await?;
    Ok(count)
}
