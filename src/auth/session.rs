//! Cookie and bearer-token sessions backed by the store.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};

use crate::auth::{Authorizer, SessionProvider};
use crate::config::SharedSettings;
use crate::error::GatewayError;
use crate::store::{Secondary, Service, Session, Store, User};

pub struct CookieSessions {
    store: Arc<dyn Store>,
    settings: SharedSettings,
}

impl CookieSessions {
    pub fn new(store: Arc<dyn Store>, settings: SharedSettings) -> Self {
        Self { store, settings }
    }

    /// Redeem a secondary-factor token of `kind` issued within
    /// `auth.secondary_expire`. Tokens are single use.
    pub async fn redeem_secondary(
        &self,
        token: &str,
        kind: &str,
    ) -> Result<Option<Secondary>, GatewayError> {
        let max_age = self.settings.load().auth.secondary_expire();
        let Some(secondary) = self.store.secondary(token, kind, max_age).await? else {
            return Ok(None);
        };

        self.store.remove_secondary(token).await?;
        Ok(Some(secondary))
    }
}

#[async_trait]
impl SessionProvider for CookieSessions {
    async fn authorize(
        &self,
        _service: &Service,
        parts: &Parts,
    ) -> Result<Box<dyn Authorizer>, GatewayError> {
        let cookie_name = self.settings.load().auth.session_cookie.clone();

        let (session_id, token) = match bearer_token(&parts.headers) {
            Some(token) => (Some(token), true),
            None => (cookie_value(&parts.headers, &cookie_name), false),
        };

        let session = match session_id {
            Some(id) => self.store.session(&id).await?,
            None => None,
        };

        Ok(Box::new(SessionAuthorizer {
            store: self.store.clone(),
            api: token || session.as_ref().is_some_and(|s| s.api),
            session,
            cookie_name,
        }))
    }
}

struct SessionAuthorizer {
    store: Arc<dyn Store>,
    session: Option<Session>,
    api: bool,
    cookie_name: String,
}

#[async_trait]
impl Authorizer for SessionAuthorizer {
    fn is_valid(&self) -> bool {
        self.session.is_some()
    }

    fn is_api(&self) -> bool {
        self.api
    }

    async fn user(&self) -> Result<Option<User>, GatewayError> {
        match &self.session {
            Some(session) => Ok(self.store.user(&session.user_id).await?),
            None => Ok(None),
        }
    }

    async fn clear(&self, headers: &mut HeaderMap) -> Result<(), GatewayError> {
        if let Some(session) = &self.session {
            self.store.remove_session(&session.id).await?;
        }

        if !self.api {
            let expired = format!(
                "{}=; Path=/; Max-Age=0; HttpOnly; Secure; SameSite=Lax",
                self.cookie_name
            );
            let value = HeaderValue::from_str(&expired).map_err(axum::http::Error::from)?;
            headers.append(SET_COOKIE, value);
        }

        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
