use async_trait::async_trait;
use common::UserId;
use domain::Customer;

use crate::Result;

/// The slice of account data the core needs: segment rules read
/// account age and orders; outbound mail needs an address.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn upsert_customer(&self, customer: Customer) -> Result<()>;

    async fn customer(&self, id: UserId) -> Result<Option<Customer>>;
}
