//! Credential stores
//!
//! The credential is replicated into persisted token storage and a
//! request-transported cookie. Both are synchronous, like browser storage.
//! Only [`CredentialStores`] writes to them, and only on behalf of the
//! session manager.

use cookie::{Cookie, SameSite};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use switchboard_config::SessionConfig;

use crate::credential::Credential;
use crate::error::{StoreError, StoreResult};

/// Persisted key/value storage for the credential
pub trait TokenStorage: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// Cookie storage mirrored onto outgoing requests
pub trait CookieJar: Send + Sync {
    fn get(&self, name: &str) -> StoreResult<Option<Cookie<'static>>>;

    fn set(&self, cookie: Cookie<'static>) -> StoreResult<()>;

    fn remove(&self, name: &str) -> StoreResult<()>;
}

/// In-process token storage
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    entries: Mutex<BTreeMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` and `remove` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.lock().clone()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Token storage backed by a JSON file.
///
/// Every write rewrites the whole file through a sibling temp file and a
/// rename, so readers never see a half-written file.
#[derive(Debug)]
pub struct FileTokenStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> StoreResult<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> StoreResult<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        f(&mut entries);
        self.write_all(&entries)
    }
}

impl TokenStorage for FileTokenStorage {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}

/// In-process cookie jar
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    jar: Mutex<cookie::CookieJar>,
    writes: AtomicUsize,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.jar.lock().iter().next().is_none()
    }

    /// `Set-Cookie` header values for every cookie currently held
    pub fn set_cookie_headers(&self) -> Vec<String> {
        let jar = self.jar.lock();
        let mut headers: Vec<String> = jar.iter().map(|c| c.to_string()).collect();
        headers.sort();
        headers
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, name: &str) -> StoreResult<Option<Cookie<'static>>> {
        Ok(self.jar.lock().get(name).cloned())
    }

    fn set(&self, cookie: Cookie<'static>) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.jar.lock().add(cookie);
        Ok(())
    }

    fn remove(&self, name: &str) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.jar.lock().remove(Cookie::from(name.to_string()));
        Ok(())
    }
}

/// Both credential replicas behind one read/replace/purge interface
#[derive(Clone)]
pub struct CredentialStores {
    storage: Arc<dyn TokenStorage>,
    cookies: Arc<dyn CookieJar>,
    settings: SessionConfig,
}

impl CredentialStores {
    pub fn new(storage: Arc<dyn TokenStorage>, cookies: Arc<dyn CookieJar>, settings: SessionConfig) -> Self {
        Self {
            storage,
            cookies,
            settings,
        }
    }

    /// In-memory stores, or file storage when `storage_path` is configured
    pub fn from_config(settings: SessionConfig) -> Self {
        let storage: Arc<dyn TokenStorage> = match &settings.storage_path {
            Some(path) => Arc::new(FileTokenStorage::new(path.clone())),
            None => Arc::new(MemoryTokenStorage::new()),
        };
        Self::new(storage, Arc::new(MemoryCookieJar::new()), settings)
    }

    pub fn settings(&self) -> &SessionConfig {
        &self.settings
    }

    /// Read the persisted credential.
    ///
    /// A token without a tenant id (or the reverse) is corrupt: it is purged and
    /// reported as absent.
    pub fn load(&self) -> StoreResult<Option<Credential>> {
        let token = self.storage.get(&self.settings.token_key)?;
        let tenant_id = self.storage.get(&self.settings.tenant_key)?;

        match (token, tenant_id) {
            (Some(token), Some(tenant_id)) if !token.is_empty() && !tenant_id.is_empty() => {
                Ok(Some(Credential::new(token, tenant_id)))
            }
            (None, None) => Ok(None),
            _ => {
                warn!("Persisted credential is incomplete, purging");
                self.purge()?;
                Ok(None)
            }
        }
    }

    /// The credential as carried by the cookies
    pub fn cookie_credential(&self) -> StoreResult<Option<Credential>> {
        let token = self.cookies.get(&self.settings.token_key)?;
        let tenant_id = self.cookies.get(&self.settings.tenant_key)?;
        Ok(match (token, tenant_id) {
            (Some(token), Some(tenant_id)) => Some(Credential::new(token.value(), tenant_id.value())),
            _ => None,
        })
    }

    /// Write `next` into storage then cookies.
    ///
    /// If either write fails, both replicas are restored to `previous` (or
    /// cleared when there was none) and the error is returned.
    pub fn replace(&self, next: &Credential, previous: Option<&Credential>) -> StoreResult<()> {
        if let Err(err) = self.write_storage(next) {
            self.restore(previous);
            return Err(err);
        }
        if let Err(err) = self.write_cookies(next) {
            self.restore(previous);
            return Err(err);
        }
        debug!(tenant_id = %next.tenant_id, "Credential written to all stores");
        Ok(())
    }

    /// Remove the credential from every replica.
    ///
    /// Every removal is attempted; the first failure is returned.
    pub fn purge(&self) -> StoreResult<()> {
        let results = [
            self.storage.remove(&self.settings.token_key),
            self.storage.remove(&self.settings.tenant_key),
            self.cookies.remove(&self.settings.token_key),
            self.cookies.remove(&self.settings.tenant_key),
        ];
        let mut first_error = None;
        for result in results {
            if let Err(err) = result {
                warn!(error = %err, "Failed to clear credential store entry");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn restore(&self, previous: Option<&Credential>) {
        let restored = match previous {
            Some(credential) => self
                .write_storage(credential)
                .and_then(|_| self.write_cookies(credential)),
            None => self.purge(),
        };
        if let Err(err) = restored {
            warn!(error = %err, "Failed to restore credential stores after a failed write");
        }
    }

    fn write_storage(&self, credential: &Credential) -> StoreResult<()> {
        self.storage.set(&self.settings.token_key, credential.token.expose())?;
        self.storage.set(&self.settings.tenant_key, credential.tenant_id.as_str())
    }

    fn write_cookies(&self, credential: &Credential) -> StoreResult<()> {
        self.cookies.set(self.build_cookie(&self.settings.token_key, credential.token.expose()))?;
        self.cookies.set(self.build_cookie(&self.settings.tenant_key, credential.tenant_id.as_str()))
    }

    fn build_cookie(&self, name: &str, value: &str) -> Cookie<'static> {
        Cookie::build((name.to_string(), value.to_string()))
            .path("/")
            .same_site(same_site(&self.settings.cookie_same_site))
            .secure(self.settings.cookie_secure)
            .max_age(max_age(self.settings.cookie_max_age))
            .build()
    }
}

fn same_site(value: &str) -> SameSite {
    if value.eq_ignore_ascii_case("lax") {
        SameSite::Lax
    } else {
        SameSite::Strict
    }
}

fn max_age(duration: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cookie jar that refuses every write
    struct BrokenJar;

    impl CookieJar for BrokenJar {
        fn get(&self, _name: &str) -> StoreResult<Option<Cookie<'static>>> {
            Ok(None)
        }

        fn set(&self, cookie: Cookie<'static>) -> StoreResult<()> {
            Err(StoreError::rejected(cookie.name(), "quota exceeded"))
        }

        fn remove(&self, _name: &str) -> StoreResult<()> {
            Ok(())
        }
    }

    fn memory_stores() -> (CredentialStores, Arc<MemoryTokenStorage>, Arc<MemoryCookieJar>) {
        let storage = Arc::new(MemoryTokenStorage::new());
        let cookies = Arc::new(MemoryCookieJar::new());
        let stores = CredentialStores::new(storage.clone(), cookies.clone(), SessionConfig::default());
        (stores, storage, cookies)
    }

    #[test]
    fn test_replace_then_load() {
        let (stores, _, _) = memory_stores();
        let credential = Credential::new("tok-1", "acme");

        stores.replace(&credential, None).unwrap();
        assert_eq!(stores.load().unwrap(), Some(credential.clone()));
        assert_eq!(stores.cookie_credential().unwrap(), Some(credential));
    }

    #[test]
    fn test_cookie_attributes() {
        let (stores, _, cookies) = memory_stores();
        stores.replace(&Credential::new("tok-1", "acme"), None).unwrap();

        let cookie = cookies.get("auth_token").unwrap().unwrap();
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.max_age(), Some(time::Duration::days(7)));

        let headers = cookies.set_cookie_headers();
        assert_eq!(headers.len(), 2);
        assert!(headers.iter().any(|h| h.starts_with("current_tenant_id=acme")));
    }

    #[test]
    fn test_purge_is_idempotent() {
        let (stores, storage, cookies) = memory_stores();
        stores.replace(&Credential::new("tok-1", "acme"), None).unwrap();

        stores.purge().unwrap();
        stores.purge().unwrap();
        assert!(storage.is_empty());
        assert!(cookies.is_empty());
        assert_eq!(stores.load().unwrap(), None);
    }

    #[test]
    fn test_partial_credential_is_purged() {
        let (stores, storage, _) = memory_stores();
        storage.set("auth_token", "orphan").unwrap();

        assert_eq!(stores.load().unwrap(), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_failed_cookie_write_restores_previous() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let previous = Credential::new("tok-old", "acme");
        storage.set("auth_token", "tok-old").unwrap();
        storage.set("current_tenant_id", "acme").unwrap();

        let stores = CredentialStores::new(storage.clone(), Arc::new(BrokenJar), SessionConfig::default());
        let err = stores
            .replace(&Credential::new("tok-new", "emea"), Some(&previous))
            .unwrap_err();

        assert!(matches!(err, StoreError::Rejected { .. }));
        assert_eq!(stores.load().unwrap(), Some(previous));
    }

    #[test]
    fn test_failed_first_login_write_leaves_nothing() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let stores = CredentialStores::new(storage.clone(), Arc::new(BrokenJar), SessionConfig::default());

        assert!(stores.replace(&Credential::new("tok", "acme"), None).is_err());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let storage = FileTokenStorage::new(&path);
        assert_eq!(storage.get("auth_token").unwrap(), None);

        storage.set("auth_token", "tok-1").unwrap();
        storage.set("current_tenant_id", "acme").unwrap();

        let reopened = FileTokenStorage::new(&path);
        assert_eq!(reopened.get("auth_token").unwrap().as_deref(), Some("tok-1"));

        reopened.remove("auth_token").unwrap();
        assert_eq!(storage.get("auth_token").unwrap(), None);
        assert_eq!(storage.get("current_tenant_id").unwrap().as_deref(), Some("acme"));
    }

    #[test]
    fn test_from_config_uses_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SessionConfig {
            storage_path: Some(dir.path().join("creds.json")),
            ..Default::default()
        };
        let stores = CredentialStores::from_config(settings);
        stores.replace(&Credential::new("tok", "acme"), None).unwrap();
        assert!(dir.path().join("creds.json").exists());
    }
}
