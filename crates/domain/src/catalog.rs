//! Catalog records: products and their per-size variants.
//!
//! The catalog is owned by the surrounding storefront; the core reads
//! products for pricing and mutates nothing here except the variant
//! stock counter, and that only through store transactions.

use chrono::{DateTime, Utc};
use common::{Money, ProductId, VariantId};
use serde::{Deserialize, Serialize};

/// A sellable product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Unit price, VAT inclusive.
    pub unit_price: Money,
    pub active: bool,
}

/// One size of one product, carrying the stock counter.
///
/// `stock_on_hand` is the single source of truth for how many units
/// exist. It never goes negative; every mutation is a delta applied
/// inside a store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub product_id: ProductId,
    pub size: String,
    pub stock_on_hand: i64,
    pub updated_at: DateTime<Utc>,
}

impl Variant {
    /// Creates a variant with an initial stock level.
    pub fn new(product_id: ProductId, size: impl Into<String>, stock_on_hand: i64) -> Self {
        Self {
            id: VariantId::new(),
            product_id,
            size: size.into(),
            stock_on_hand,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_new_assigns_fresh_id() {
        let product_id = ProductId::new();
        let a = Variant::new(product_id, "M", 5);
        let b = Variant::new(product_id, "L", 5);
        assert_ne!(a.id, b.id);
        assert_eq!(a.stock_on_hand, 5);
        assert_eq!(a.size, "M");
    }
}
