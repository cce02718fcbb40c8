//! Customer accounts, as far as the core needs them.
//!
//! Authentication and registration live outside the core; segment
//! rules and outbound mail only need an id, an address, and an account
//! age.

use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: UserId,
    pub email: String,
    pub created_at: DateTime<Utc>,
}
