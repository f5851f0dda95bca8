//! HTTP client for the warrior directory

use async_trait::async_trait;
use coin_ledger::catalog::{CatalogError, WarriorCatalog, WarriorProfile};
use coin_ledger::WarriorId;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

pub struct HttpWarriorCatalog {
    client: Client,
    base_url: String,
}

impl HttpWarriorCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn warrior_url(&self, warrior_id: WarriorId) -> String {
        format!("{}/warriors/{}", self.base_url, warrior_id)
    }
}

#[async_trait]
impl WarriorCatalog for HttpWarriorCatalog {
    async fn get_warrior(&self, warrior_id: WarriorId) -> Result<Option<WarriorProfile>, CatalogError> {
        let url = self.warrior_url(warrior_id);
        debug!(warrior_id, "Fetching warrior from directory");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let profile: WarriorProfile = response
                    .json()
                    .await
                    .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;
                if profile.id != warrior_id {
                    return Err(CatalogError::InvalidResponse(format!(
                        "asked for warrior {} but got {}",
                        warrior_id, profile.id
                    )));
                }
                Ok(Some(profile))
            }
            status => {
                warn!(warrior_id, status = status.as_u16(), "Warrior directory error");
                Err(CatalogError::Unavailable(format!("directory returned {}", status)))
            }
        }
    }
}
