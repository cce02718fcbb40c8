use async_trait::async_trait;
use common::{ProductId, VariantId};
use domain::{Product, Variant};

use crate::Result;

/// Read access to the product catalog plus the sync/seed seam.
///
/// The catalog is owned by the surrounding storefront; the core reads
/// products for pricing and only ever mutates variant stock through
/// the inventory and order transactions.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Inserts or replaces a product (catalog sync / test seeding).
    async fn upsert_product(&self, product: Product) -> Result<()>;

    /// Looks a product up by id.
    async fn product(&self, id: ProductId) -> Result<Option<Product>>;

    /// Inserts or replaces a variant (catalog sync / test seeding).
    async fn upsert_variant(&self, variant: Variant) -> Result<()>;

    /// Looks a variant up by id.
    async fn variant(&self, id: VariantId) -> Result<Option<Variant>>;

    /// Current on-hand stock for a variant.
    async fn stock_on_hand(&self, id: VariantId) -> Result<i64> {
        let variant = self
            .variant(id)
            .await?
            .ok_or_else(|| crate::StoreError::not_found("variant", id))?;
        Ok(variant.stock_on_hand)
    }
}
