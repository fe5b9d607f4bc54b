//! The persistent connection pool.

use http::{HeaderName, HeaderValue, Version};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::connection::{ConnectOptions, Destination};
use crate::generation::{Generations, Track};
use crate::proxy::{ProxySetting, ResolvedProxy};
use crate::request::IntoUrl;
use crate::socket::SocketOption;
use crate::store::{bind_to_thread, Registry, WorkerId, WorkerStore};
use crate::tls::{TlsSettings, TlsVersion, VerifyCallback, VerifyMode};
use crate::Result;

pub(crate) struct Settings {
    pub(crate) config: PoolConfig,
    pub(crate) proxy: ResolvedProxy,
}

/// A pool of persistent HTTP/1.1 connections, partitioned by worker.
///
/// Each worker (an OS thread, or an explicit [`WorkerId`]) owns its own
/// connections, so a connection is never used by two workers at once.
/// Changing the proxy or TLS parameters does not touch live connections;
/// it bumps a generation counter and every worker drops its stale
/// connections the next time it asks for one.
///
/// ```rust,no_run
/// use armature_persistent::{PersistentPool, ProxySetting};
///
/// # fn main() -> armature_persistent::Result<()> {
/// let pool = PersistentPool::new("api", ProxySetting::None)?;
///
/// let response = pool.request("https://api.example.com/users", None)?;
/// println!("Status: {}", response.status());
///
/// // Reuses the same connection.
/// let response = pool.request("https://api.example.com/users/1", None)?;
/// println!("Body: {}", response.text()?);
/// # Ok(())
/// # }
/// ```
pub struct PersistentPool {
    pub(crate) name: String,
    pub(crate) settings: RwLock<Settings>,
    pub(crate) generations: Generations,
    pub(crate) workers: Arc<Registry>,
    pub(crate) http_versions: Mutex<HashMap<String, Version>>,
    tls_cache: Mutex<Option<(u64, Arc<ClientConfig>)>>,
}

impl std::fmt::Debug for PersistentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentPool")
            .field("name", &self.name)
            .field("generations", &self.generations)
            .field("workers", &self.workers.read().len())
            .finish()
    }
}

impl PersistentPool {
    /// Create a pool with default settings.
    ///
    /// `proxy` may be [`ProxySetting::FromEnvironment`] to read `HTTP_PROXY`
    /// and `NO_PROXY`.
    pub fn new(name: impl Into<String>, proxy: impl Into<ProxySetting>) -> Result<Self> {
        Self::with_config(PoolConfig {
            name: name.into(),
            proxy: proxy.into(),
            ..PoolConfig::default()
        })
    }

    /// Create a pool from a configuration.
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        let proxy = ResolvedProxy::resolve(&config.proxy)?;
        debug!(
            pool = %config.name,
            proxy = ?proxy.proxy.as_ref().map(|p| p.address()),
            "Persistent pool created"
        );
        Ok(Self {
            name: config.name.clone(),
            settings: RwLock::new(Settings { config, proxy }),
            generations: Generations::new(),
            workers: Arc::new(RwLock::new(HashMap::new())),
            http_versions: Mutex::new(HashMap::new()),
            tls_cache: Mutex::new(None),
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> PoolConfig {
        self.settings.read().config.clone()
    }

    /// Current generation of a track.
    pub fn generation(&self, track: Track) -> u64 {
        self.generations.current(track)
    }

    // Invalidating setters

    /// Change the proxy. Every connection is replaced on next use.
    pub fn set_proxy(&self, proxy: impl Into<ProxySetting>) -> Result<()> {
        let setting = proxy.into();
        let resolved = ResolvedProxy::resolve(&setting)?;
        {
            let mut settings = self.settings.write();
            settings.config.proxy = setting;
            settings.proxy = resolved;
        }
        let (transport, ssl) = self.generations.bump_both();
        info!(pool = %self.name, transport, ssl, "Proxy changed, connections invalidated");
        Ok(())
    }

    /// Set the client certificate chain.
    pub fn set_certificate(&self, chain: Vec<CertificateDer<'static>>) {
        self.update_tls("certificate", |tls| tls.certificate = Some(chain));
    }

    /// Set the client private key.
    pub fn set_private_key(&self, key: PrivateKeyDer<'static>) {
        self.update_tls("private_key", |tls| tls.private_key = Some(Arc::new(key)));
    }

    /// Trust the certificates in a PEM file. Forces peer verification.
    pub fn set_ca_file(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.update_tls("ca_file", |tls| tls.ca_file = Some(path));
    }

    /// Replace the bundled trust roots.
    pub fn set_cert_store(&self, store: RootCertStore) {
        self.update_tls("cert_store", |tls| tls.cert_store = Some(Arc::new(store)));
    }

    /// Set the verification policy.
    pub fn set_verify_mode(&self, mode: VerifyMode) {
        self.update_tls("verify_mode", |tls| tls.verify_mode = mode);
    }

    /// Set the verification hook, used together with a CA file.
    pub fn set_verify_callback(&self, callback: VerifyCallback) {
        self.update_tls("verify_callback", |tls| tls.verify_callback = Some(callback));
    }

    /// Pin the TLS protocol version.
    pub fn set_tls_version(&self, version: Option<TlsVersion>) {
        self.update_tls("version", |tls| tls.version = version);
    }

    /// Enable or disable TLS session resumption across connections.
    pub fn set_reuse_tls_sessions(&self, reuse: bool) {
        self.update_tls("reuse_sessions", |tls| tls.reuse_sessions = reuse);
    }

    fn update_tls(&self, field: &'static str, update: impl FnOnce(&mut TlsSettings)) {
        update(&mut self.settings.write().config.tls);
        let ssl = self.generations.bump(Track::Tls);
        info!(pool = %self.name, field, ssl, "TLS settings changed, connections invalidated");
    }

    /// Drop all plain connections on next use.
    pub fn reconnect(&self) -> u64 {
        let transport = self.generations.bump(Track::Transport);
        info!(pool = %self.name, transport, "Transport reconnect requested");
        transport
    }

    /// Drop all TLS connections on next use.
    pub fn reconnect_tls(&self) -> u64 {
        let ssl = self.generations.bump(Track::Tls);
        info!(pool = %self.name, ssl, "TLS reconnect requested");
        ssl
    }

    // Plain setters, picked up by the next request or connection start

    /// Set the idle timeout.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.settings.write().config.idle_timeout = timeout;
    }

    /// Set the advertised keep-alive, in seconds.
    pub fn set_keep_alive(&self, seconds: u32) {
        self.settings.write().config.keep_alive = seconds;
    }

    /// Set the connect timeout.
    pub fn set_open_timeout(&self, timeout: Option<Duration>) {
        self.settings.write().config.open_timeout = timeout;
    }

    /// Set the per-attempt read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.settings.write().config.read_timeout = timeout;
    }

    /// Replace the socket options applied to new connections.
    pub fn set_socket_options(&self, options: Vec<SocketOption>) {
        self.settings.write().config.socket_options = options;
    }

    /// Add a header appended to every request.
    pub fn add_header(&self, name: HeaderName, value: HeaderValue) {
        self.settings.write().config.headers.push((name, value));
    }

    /// Replace the headers appended to every request.
    pub fn set_headers(&self, headers: Vec<(HeaderName, HeaderValue)>) {
        self.settings.write().config.headers = headers;
    }

    /// Add a header that replaces request values of the same name.
    pub fn set_override_header(&self, name: HeaderName, value: HeaderValue) {
        self.settings
            .write()
            .config
            .override_headers
            .insert(name, value);
    }

    /// Allow or forbid retrying non-idempotent requests.
    pub fn set_retry_change_requests(&self, enable: bool) {
        self.settings.write().config.retry_change_requests = enable;
    }

    /// Silence the warning logged when peer verification is disabled.
    pub fn set_suppress_verify_warning(&self, suppress: bool) {
        self.settings.write().config.tls.suppress_verify_warning = suppress;
    }

    /// Protocol version last seen from the destination of `uri`.
    pub fn http_version(&self, uri: impl IntoUrl) -> Result<Option<Version>> {
        let destination = Destination::from_url(&uri.into_url()?)?;
        Ok(self.http_versions.lock().get(&destination.address()).copied())
    }

    /// Connections held by a worker, started or not.
    ///
    /// A connection in the middle of an exchange is not counted.
    pub fn connection_count(&self, worker: WorkerId) -> usize {
        self.workers
            .read()
            .get(&worker)
            .map_or(0, |store| store.lock().connection_count())
    }

    /// Workers holding a store in this pool.
    ///
    /// A thread's implicit worker is removed when the thread exits; an
    /// explicit worker stays until it is shut down.
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    pub(crate) fn worker_store(&self, worker: WorkerId) -> Arc<Mutex<WorkerStore>> {
        if let Some(store) = self.workers.read().get(&worker) {
            return Arc::clone(store);
        }
        let store = {
            let mut workers = self.workers.write();
            Arc::clone(workers.entry(worker).or_insert_with(|| {
                debug!(pool = %self.name, %worker, "Worker store created");
                Arc::new(Mutex::new(WorkerStore::new()))
            }))
        };
        if worker == WorkerId::current() {
            bind_to_thread(&self.workers);
        }
        store
    }

    /// TLS client configuration for the current `ssl` generation.
    pub(crate) fn tls_client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut cache = self.tls_cache.lock();
        let generation = self.generations.ssl();
        if let Some((cached, config)) = cache.as_ref()
            && *cached == generation
        {
            return Ok(Arc::clone(config));
        }
        let config = self.settings.read().config.tls.client_config()?;
        *cache = Some((generation, Arc::clone(&config)));
        Ok(config)
    }

    pub(crate) fn connect_options(&self) -> ConnectOptions {
        let settings = self.settings.read();
        ConnectOptions {
            open_timeout: settings.config.open_timeout,
            read_timeout: settings.config.read_timeout,
            socket_options: settings.config.socket_options.clone(),
        }
    }

    pub(crate) fn remember_version(&self, destination: &Destination, version: Version) {
        self.http_versions
            .lock()
            .entry(destination.address())
            .or_insert(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Proxy;

    #[test]
    fn test_new_pool_defaults() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        assert_eq!(pool.name(), "test");
        assert_eq!(pool.generation(Track::Transport), 0);
        assert_eq!(pool.generation(Track::Tls), 0);
        assert_eq!(pool.config().keep_alive, 30);
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_set_proxy_bumps_both_generations() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        pool.set_proxy(Proxy::new("proxy.local", 3128)).unwrap();
        assert_eq!(pool.generation(Track::Transport), 1);
        assert_eq!(pool.generation(Track::Tls), 1);
        assert!(matches!(pool.config().proxy, ProxySetting::Explicit(_)));
    }

    #[test]
    fn test_tls_setters_bump_ssl_only() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        pool.set_verify_mode(VerifyMode::Peer);
        pool.set_tls_version(Some(TlsVersion::Tls13));
        pool.set_reuse_tls_sessions(false);
        assert_eq!(pool.generation(Track::Tls), 3);
        assert_eq!(pool.generation(Track::Transport), 0);
        assert!(!pool.config().tls.reuse_sessions);
    }

    #[test]
    fn test_plain_setters_do_not_invalidate() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        pool.set_idle_timeout(None);
        pool.set_keep_alive(10);
        pool.set_read_timeout(Some(Duration::from_secs(1)));
        pool.set_retry_change_requests(true);
        pool.add_header(
            HeaderName::from_static("x-a"),
            HeaderValue::from_static("1"),
        );

        let config = pool.config();
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.keep_alive, 10);
        assert!(config.retry_change_requests);
        assert_eq!(config.headers.len(), 1);
        assert_eq!(pool.generation(Track::Transport), 0);
        assert_eq!(pool.generation(Track::Tls), 0);
    }

    #[test]
    fn test_reconnect_bumps_one_track() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        assert_eq!(pool.reconnect(), 1);
        assert_eq!(pool.generation(Track::Tls), 0);
        assert_eq!(pool.reconnect_tls(), 1);
    }

    #[test]
    fn test_tls_config_cached_per_generation() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        let first = pool.tls_client_config().unwrap();
        let second = pool.tls_client_config().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        pool.reconnect_tls();
        let third = pool.tls_client_config().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_worker_store_is_shared_per_worker() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        let worker = WorkerId::next();
        let a = pool.worker_store(worker);
        let b = pool.worker_store(worker);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &pool.worker_store(WorkerId::next())));
        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn test_thread_store_dropped_with_thread() {
        let pool = Arc::new(PersistentPool::new("test", ProxySetting::None).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    pool.worker_store(WorkerId::current());
                    WorkerId::current()
                })
            })
            .collect();
        let workers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.connection_count(workers[0]), 0);
    }

    #[test]
    fn test_http_version_unknown_until_seen() {
        let pool = PersistentPool::new("test", ProxySetting::None).unwrap();
        assert_eq!(pool.http_version("http://a.local/").unwrap(), None);

        let destination =
            Destination::from_url(&url::Url::parse("http://a.local/").unwrap()).unwrap();
        pool.remember_version(&destination, Version::HTTP_10);
        pool.remember_version(&destination, Version::HTTP_11);
        assert_eq!(
            pool.http_version("http://a.local:80/x").unwrap(),
            Some(Version::HTTP_10)
        );
    }
}
