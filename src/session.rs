use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::http::ApiClient;

const TOKEN_KEY: &str = "token";
const REFRESH_KEY: &str = "refresh_token";
const USERNAME_KEY: &str = "username";
const EMPRESA_KEY: &str = "empresaSeleccionada";
const ROLES_KEY: &str = "rolesByCompany";

const ALL_KEYS: [&str; 5] = [TOKEN_KEY, REFRESH_KEY, USERNAME_KEY, EMPRESA_KEY, ROLES_KEY];

/// A company/role pair the user can act as. Doubles as the active context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRole {
    pub empresa_id: i64,
    pub rol_id: i64,
    pub empresa_nombre: String,
    pub rol_nombre: String,
}

/// Everything `save_full_session` needs. Token, empresa and rol are required;
/// the rest degrades to defaults.
#[derive(Clone, Debug, Default)]
pub struct SessionData {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub empresa_id: Option<i64>,
    pub rol_id: Option<i64>,
    pub empresa_nombre: Option<String>,
    pub rol_nombre: Option<String>,
    pub roles_by_company: Vec<CompanyRole>,
    pub username: Option<String>,
}

/// Durable key/value persistence for session state.
///
/// One writer at a time is assumed; writes that span multiple keys are
/// sequenced by the store so a crash between writes leaves a subset the read
/// path can recover from.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;
    async fn put(&self, key: &str, value: &str) -> Result<(), Error>;
    async fn remove(&self, key: &str) -> Result<(), Error>;
}

/// File-per-key storage under a directory, the durable backend
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FsStorage { dir: dir.into() }
    }
}

#[async_trait]
impl SessionStorage for FsStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match tokio::fs::read_to_string(self.dir.join(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(key), value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        match tokio::fs::remove_file(self.dir.join(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory storage for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Deserialize)]
struct SwitchResponse {
    token: String,
    #[serde(default, rename = "refreshToken")]
    refresh_token: Option<String>,
}

/// Holds the bearer token, the active company/role pair, and the list of
/// pairs available to the user, mirrored between memory and durable storage.
pub struct SessionStore<S> {
    storage: S,
    token: Option<String>,
    username: Option<String>,
    active: Option<CompanyRole>,
    roles: Vec<CompanyRole>,
}

impl<S: SessionStorage> SessionStore<S> {
    pub fn new(storage: S) -> Self {
        SessionStore {
            storage,
            token: None,
            username: None,
            active: None,
            roles: Vec::new(),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn active_context(&self) -> Option<&CompanyRole> {
        self.active.as_ref()
    }

    pub fn roles_by_company(&self) -> &[CompanyRole] {
        &self.roles
    }

    /// Whether a company/role switcher is worth showing at all
    pub fn has_multiple_options(&self) -> bool {
        self.roles.len() > 1
    }

    /// Restores whatever subset of session keys survived the last run.
    ///
    /// Any key may be missing or unreadable; each one degrades independently.
    pub async fn load(&mut self) {
        self.token = self.read_plain(TOKEN_KEY).await;
        self.username = self.read_plain(USERNAME_KEY).await;
        self.active = self.read_json(EMPRESA_KEY).await;
        self.roles = self.read_json::<Vec<CompanyRole>>(ROLES_KEY).await.unwrap_or_default();
    }

    /// Persists token, active context, and roles, then mirrors them into
    /// memory.
    ///
    /// Validation happens before the first write, so a rejected call leaves
    /// both storage and memory exactly as they were.
    pub async fn save_full_session(&mut self, data: SessionData) -> Result<(), Error> {
        let token = match data.token.as_deref() {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => return Err(Error::Validation("token is required".to_string())),
        };
        let empresa_id = data
            .empresa_id
            .ok_or_else(|| Error::Validation("empresaId is required".to_string()))?;
        let rol_id = data
            .rol_id
            .ok_or_else(|| Error::Validation("rolId is required".to_string()))?;

        let context = CompanyRole {
            empresa_id,
            rol_id,
            empresa_nombre: data.empresa_nombre.unwrap_or_else(|| "Sin nombre".to_string()),
            rol_nombre: data.rol_nombre.unwrap_or_else(|| "Sin rol".to_string()),
        };

        self.storage.put(TOKEN_KEY, &token).await?;
        if let Some(refresh) = &data.refresh_token {
            self.storage.put(REFRESH_KEY, refresh).await?;
        }
        if let Some(username) = &data.username {
            self.storage.put(USERNAME_KEY, username).await?;
        }
        self.storage
            .put(EMPRESA_KEY, &serde_json::to_string(&context)?)
            .await?;
        self.storage
            .put(ROLES_KEY, &serde_json::to_string(&data.roles_by_company)?)
            .await?;

        self.token = Some(token);
        if let Some(username) = data.username {
            self.username = Some(username);
        }
        self.active = Some(context);
        self.roles = data.roles_by_company;
        Ok(())
    }

    /// Switches the active company/role through the backend.
    ///
    /// The freshly issued token fully replaces the current one; there is no
    /// window where both are in use.
    pub async fn switch_context(
        &mut self,
        api: &ApiClient,
        empresa_id: i64,
        rol_id: i64,
        remember_as_default: bool,
    ) -> Result<(), Error> {
        let current = self
            .token
            .clone()
            .ok_or_else(|| Error::ContextSwitch("no active session".to_string()))?;

        let body = serde_json::json!({
            "empresaId": empresa_id,
            "rolId": rol_id,
            "rememberAsDefault": remember_as_default,
        });
        let res = api.with_token(current).post_json("/auth/switch-context", &body).await?;
        if res.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Permission);
        }
        if !res.status().is_success() {
            return Err(Error::ContextSwitch(format!(
                "backend returned {}",
                res.status()
            )));
        }
        let switched: SwitchResponse = res.json().await?;

        let names = self
            .roles
            .iter()
            .find(|role| role.empresa_id == empresa_id && role.rol_id == rol_id);

        self.save_full_session(SessionData {
            token: Some(switched.token),
            refresh_token: switched.refresh_token,
            empresa_id: Some(empresa_id),
            rol_id: Some(rol_id),
            empresa_nombre: names.map(|r| r.empresa_nombre.clone()),
            rol_nombre: names.map(|r| r.rol_nombre.clone()),
            roles_by_company: self.roles.clone(),
            username: None,
        })
        .await
    }

    /// Claims of the current token, or None when no token is held or it is
    /// malformed
    pub fn decode_token(&self) -> Option<serde_json::Value> {
        decode_claims(self.token.as_deref()?)
    }

    /// True iff the current token decodes and its expiry is still ahead
    pub fn is_token_valid(&self) -> bool {
        let Some(claims) = self.decode_token() else {
            return false;
        };
        let Some(exp) = claims.get("exp").and_then(|v| v.as_i64()) else {
            return false;
        };
        exp > Utc::now().timestamp()
    }

    /// Clears every persisted key and all in-memory state together
    pub async fn logout(&mut self) -> Result<(), Error> {
        self.token = None;
        self.username = None;
        self.active = None;
        self.roles.clear();
        for key in ALL_KEYS {
            self.storage.remove(key).await?;
        }
        Ok(())
    }

    async fn read_plain(&self, key: &str) -> Option<String> {
        match self.storage.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Could not read {}: {}", key, err);
                None
            }
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read_plain(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Discarding unreadable {}: {}", key, err);
                None
            }
        }
    }
}

/// Reads the claims segment of a compact three-segment token.
///
/// No signature verification happens here; the client only inspects claims
/// for UX decisions. Returns None on any malformation.
pub fn decode_claims(token: &str) -> Option<serde_json::Value> {
    let mut segments = token.split('.');
    let (_, claims, _) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("Token claims are not JSON: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{body}.firma")
    }

    fn valid_data(token: &str) -> SessionData {
        SessionData {
            token: Some(token.to_string()),
            empresa_id: Some(1),
            rol_id: Some(2),
            empresa_nombre: Some("Acme".to_string()),
            rol_nombre: Some("Admin".to_string()),
            roles_by_company: vec![
                CompanyRole {
                    empresa_id: 1,
                    rol_id: 2,
                    empresa_nombre: "Acme".to_string(),
                    rol_nombre: "Admin".to_string(),
                },
                CompanyRole {
                    empresa_id: 3,
                    rol_id: 4,
                    empresa_nombre: "Other".to_string(),
                    rol_nombre: "Viewer".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_required_field_leaves_everything_untouched() {
        let mut store = SessionStore::new(MemoryStorage::default());
        store.save_full_session(valid_data("tok-1")).await.unwrap();

        let mut partial = valid_data("tok-2");
        partial.rol_id = None;
        let err = store.save_full_session(partial).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(store.token(), Some("tok-1"));
        assert_eq!(
            store.storage.get(TOKEN_KEY).await.unwrap().as_deref(),
            Some("tok-1")
        );
        assert_eq!(store.active_context().unwrap().empresa_id, 1);
    }

    #[tokio::test]
    async fn token_validity_round_trip() {
        let mut store = SessionStore::new(MemoryStorage::default());
        let future = Utc::now().timestamp() + 3600;
        let token = make_token(serde_json::json!({"exp": future, "sub": "user@acme.co"}));
        store.save_full_session(valid_data(&token)).await.unwrap();
        assert!(store.is_token_valid());

        let past = Utc::now().timestamp() - 10;
        let expired = make_token(serde_json::json!({"exp": past}));
        store.save_full_session(valid_data(&expired)).await.unwrap();
        assert!(!store.is_token_valid());
    }

    #[tokio::test]
    async fn opaque_token_is_invalid_not_a_panic() {
        let mut store = SessionStore::new(MemoryStorage::default());
        store.save_full_session(valid_data("abc")).await.unwrap();
        assert!(!store.is_token_valid());
        assert!(store.decode_token().is_none());
    }

    #[test]
    fn decode_rejects_wrong_segment_counts() {
        assert!(decode_claims("a.b").is_none());
        assert!(decode_claims("a.b.c.d").is_none());
        assert!(decode_claims("").is_none());
    }

    #[tokio::test]
    async fn logout_leaves_no_residual_state() {
        let mut store = SessionStore::new(MemoryStorage::default());
        store.save_full_session(valid_data("tok")).await.unwrap();
        assert!(store.has_multiple_options());

        store.logout().await.unwrap();

        assert_eq!(store.token(), None);
        assert!(store.active_context().is_none());
        assert!(store.roles_by_company().is_empty());
        for key in ALL_KEYS {
            assert!(store.storage.get(key).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn load_tolerates_any_key_subset() {
        let storage = MemoryStorage::default();
        storage.put(TOKEN_KEY, "tok").await.unwrap();
        storage.put(ROLES_KEY, "not json at all").await.unwrap();
        let mut store = SessionStore::new(storage);

        store.load().await;

        assert_eq!(store.token(), Some("tok"));
        assert!(store.active_context().is_none());
        assert!(store.roles_by_company().is_empty());
    }

    #[tokio::test]
    async fn single_role_needs_no_switcher() {
        let mut store = SessionStore::new(MemoryStorage::default());
        let mut data = valid_data("tok");
        data.roles_by_company.truncate(1);
        store.save_full_session(data).await.unwrap();
        assert!(!store.has_multiple_options());
    }
}
