pub mod ids;
pub mod money;

pub use ids::{CouponId, OrderId, ProductId, SessionId, UserId, VariantId};
pub use money::Money;
