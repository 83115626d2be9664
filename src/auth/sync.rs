//! Single sign-on synchronization against a remote account server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;

use crate::auth::SsoSync;
use crate::config::SharedSettings;
use crate::error::GatewayError;
use crate::store::{Store, User, UserKind};

/// Checks SSO-backed accounts at most once per `auth.sync_interval_secs`.
pub struct RemoteSync {
    store: Arc<dyn Store>,
    settings: SharedSettings,
    client: reqwest::Client,
}

impl RemoteSync {
    pub fn new(store: Arc<dyn Store>, settings: SharedSettings) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            store,
            settings,
            client,
        })
    }
}

#[async_trait]
impl SsoSync for RemoteSync {
    async fn sync_user(&self, usr: &User) -> Result<bool, GatewayError> {
        let auth = self.settings.load().auth.clone();

        if let Some(last_sync) = usr.last_sync {
            let elapsed = (Utc::now() - last_sync).to_std().unwrap_or_default();
            if elapsed < auth.sync_interval() {
                return Ok(true);
            }
        }

        if usr.kind != UserKind::Google {
            return Ok(true);
        }

        let Some(server) = auth.sso_server.as_deref() else {
            tracing::debug!(username = %usr.username, "No sso server configured, skipping sync");
            return Ok(true);
        };

        let resp = self
            .client
            .get(format!("{}/update/google", server.trim_end_matches('/')))
            .query(&[("user", usr.username.as_str()), ("license", auth.license.as_str())])
            .send()
            .await?;

        if resp.status() == StatusCode::OK {
            self.store.update_user_sync(&usr.id, Utc::now()).await?;
            Ok(true)
        } else {
            tracing::info!(
                username = %usr.username,
                status_code = resp.status().as_u16(),
                "User single sign-on sync failed"
            );
            Ok(false)
        }
    }
}
