use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

pub mod creations;
pub mod credits;
pub mod memory;
pub mod profiles;
pub mod referrals;

use creations::{CreationRepository, CreationStore};
use credits::{CreditRepository, CreditStore};
use memory::MemoryStore;
use profiles::{ProfileRepository, ProfileStore};
use referrals::{ReferralRepository, ReferralStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No credit record for user {0}")]
    Missing(Uuid),
    #[error("Credit record of user {0} kept changing during the update")]
    Conflict(Uuid),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Every store the services talk to, behind trait objects.
#[derive(Clone)]
pub struct Stores {
    pub credits: Arc<dyn CreditStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub referrals: Arc<dyn ReferralStore>,
    pub creations: Arc<dyn CreationStore>,
}

impl Stores {
    pub fn postgres(conn: PgPool) -> Self {
        Self {
            credits: Arc::new(CreditRepository::new(conn.clone())),
            profiles: Arc::new(ProfileRepository::new(conn.clone())),
            referrals: Arc::new(ReferralRepository::new(conn.clone())),
            creations: Arc::new(CreationRepository::new(conn)),
        }
    }

    pub fn memory(store: MemoryStore) -> Self {
        Self {
            credits: Arc::new(store.clone()),
            profiles: Arc::new(store.clone()),
            referrals: Arc::new(store.clone()),
            creations: Arc::new(store),
        }
    }
}
