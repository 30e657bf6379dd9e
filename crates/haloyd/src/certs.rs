//! Certificate Manager: an in-memory map from canonical domain to a
//! loaded certificate/key pair, kept in sync with
//! `<data-dir>/cert-storage` by a debounced filesystem watcher, with
//! ACME HTTP-01 issuance handled by `instant-acme` + `rcgen`. The map
//! is `ArcSwap`-backed, matching the Router Table's publish
//! discipline: build the next map off-thread, then swap the pointer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("no certificate available for {0:?}")]
    NoCertificate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error("acme: {0}")]
    Acme(String),
}

pub type Result<T> = std::result::Result<T, CertError>;

#[derive(Debug, Clone)]
pub struct CertMeta {
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

struct Entry {
    key: Arc<CertifiedKey>,
    meta: CertMeta,
}

#[derive(Default)]
struct CertMap {
    by_canonical: HashMap<String, Arc<Entry>>,
    by_alias: HashMap<String, String>,
}

/// The pending HTTP-01 challenges currently being served from `:80`
/// under `/.well-known/acme-challenge/`. Shared with the proxy.
#[derive(Clone, Default)]
pub struct ChallengeStore(Arc<Mutex<HashMap<String, String>>>);

impl ChallengeStore {
    pub fn set(&self, token: &str, key_authorization: &str) {
        self.0
            .lock()
            .unwrap()
            .insert(token.to_owned(), key_authorization.to_owned());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.0.lock().unwrap().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.0.lock().unwrap().remove(token);
    }
}

const RENEW_WITHIN: chrono::Duration = chrono::Duration::days(30);
const BACKOFF_STEPS: [Duration; 5] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(2 * 3600),
    Duration::from_secs(12 * 3600),
];

pub struct CertificateManager {
    storage_dir: PathBuf,
    map: ArcSwap<CertMap>,
    default_protected: ArcSwap<Option<Arc<Entry>>>,
    acme_directory_url: String,
    default_email: Option<String>,
    pub challenges: ChallengeStore,
    /// At-most-one ACME job per domain name (Design Note: per-domain
    /// latch rather than a global singleton).
    in_flight: AsyncMutex<std::collections::HashSet<String>>,
    reload_tx: mpsc::UnboundedSender<()>,
    reload_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl CertificateManager {
    pub fn new(storage_dir: PathBuf, acme_directory_url: String, default_email: Option<String>) -> Arc<Self> {
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            storage_dir,
            map: ArcSwap::new(Arc::new(CertMap::default())),
            default_protected: ArcSwap::new(Arc::new(None)),
            acme_directory_url,
            default_email,
            challenges: ChallengeStore::default(),
            in_flight: AsyncMutex::new(std::collections::HashSet::new()),
            reload_tx,
            reload_rx: AsyncMutex::new(Some(reload_rx)),
        })
    }

    pub fn request_reload(&self) {
        let _ = self.reload_tx.send(());
    }

    /// Rebuild the map off-thread and swap it in atomically. In-flight
    /// handshakes keep whatever `Arc<CertifiedKey>` they already
    /// captured, so a reload never invalidates a connection mid-flight.
    pub async fn reload(&self) -> Result<()> {
        let dir = self.storage_dir.clone();
        let built = tokio::task::spawn_blocking(move || build_map(&dir))
            .await
            .expect("cert reload task panicked")?;
        self.map.store(Arc::new(built));
        tracing::info!("certificate map reloaded");
        Ok(())
    }

    /// Spawns the debounced (500ms coalescing) filesystem watcher plus
    /// the reload-request consumer. Call once at startup after an
    /// initial synchronous `reload()`.
    pub fn spawn_watcher(self: Arc<Self>) {
        let mut rx = self
            .reload_rx
            .try_lock()
            .expect("spawn_watcher called twice")
            .take()
            .expect("spawn_watcher called twice");
        tokio::spawn(async move {
            loop {
                if rx.recv().await.is_none() {
                    return;
                }
                // Coalesce a burst of fs events / requests into one reload.
                loop {
                    match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                if let Err(err) = self.reload().await {
                    tracing::warn!(%err, "certificate reload failed");
                }
            }
        });
    }

    pub fn watch_directory(self: &Arc<Self>) -> Result<notify::RecommendedWatcher> {
        use notify::Watcher;
        let tx = self.reload_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })
        .map_err(|e| CertError::Tls(e.to_string()))?;
        watcher
            .watch(&self.storage_dir, notify::RecursiveMode::Recursive)
            .map_err(|e| CertError::Tls(e.to_string()))?;
        Ok(watcher)
    }

    /// Resolution order: exact canonical, then alias, then one-level
    /// wildcard, then the `Protected` default if any.
    fn resolve(&self, sni: &str) -> Option<Arc<Entry>> {
        let map = self.map.load();
        if let Some(entry) = map.by_canonical.get(sni) {
            return Some(entry.clone());
        }
        if let Some(canonical) = map.by_alias.get(sni) {
            if let Some(entry) = map.by_canonical.get(canonical) {
                return Some(entry.clone());
            }
        }
        if let Some((_, rest)) = sni.split_once('.') {
            let wildcard = format!("*.{rest}");
            if let Some(entry) = map.by_canonical.get(&wildcard) {
                return Some(entry.clone());
            }
        }
        self.default_protected.load().as_ref().clone()
    }

    pub fn get_certificate(&self, sni: &str) -> Result<Arc<CertifiedKey>> {
        self.resolve(sni)
            .map(|e| e.key.clone())
            .ok_or_else(|| CertError::NoCertificate(sni.to_owned()))
    }

    pub fn meta_for(&self, canonical: &str) -> Option<CertMeta> {
        self.map.load().by_canonical.get(canonical).map(|e| e.meta.clone())
    }

    pub fn set_protected_default(&self, canonical: &str) {
        let entry = self.map.load().by_canonical.get(canonical).cloned();
        self.default_protected.store(Arc::new(entry));
    }

    /// Enqueues (at most once per domain) an ACME HTTP-01 issuance job.
    /// Returns immediately; the certificate becomes available on the
    /// next `reload()` once the background task finishes.
    pub fn ensure_certificate(self: &Arc<Self>, canonical: String, alt_names: Vec<String>, email: Option<String>) {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut guard = this.in_flight.lock().await;
                if !guard.insert(canonical.clone()) {
                    return;
                }
            }
            let email = email.or_else(|| this.default_email.clone());
            let mut attempt = 0usize;
            loop {
                match this.issue(&canonical, &alt_names, email.as_deref()).await {
                    Ok(()) => {
                        tracing::info!(domain = %canonical, "certificate issued");
                        this.request_reload();
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(domain = %canonical, %err, attempt, "acme issuance failed");
                        let delay = BACKOFF_STEPS[attempt.min(BACKOFF_STEPS.len() - 1)];
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        if attempt > BACKOFF_STEPS.len() * 3 {
                            tracing::error!(domain = %canonical, "giving up on acme issuance for now");
                            break;
                        }
                    }
                }
            }
            this.in_flight.lock().await.remove(&canonical);
        });
    }

    async fn issue(&self, canonical: &str, alt_names: &[String], email: Option<&str>) -> Result<()> {
        let Some(email) = email else {
            return Err(CertError::Acme(format!(
                "no acme_email configured for {canonical:?} (neither per-domain nor daemon-wide)"
            )));
        };

        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{email}")],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.acme_directory_url,
            None,
        )
        .await
        .map_err(|e| CertError::Acme(e.to_string()))?;

        let mut identifiers = vec![Identifier::Dns(canonical.to_owned())];
        identifiers.extend(alt_names.iter().cloned().map(Identifier::Dns));

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| CertError::Acme(e.to_string()))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| CertError::Acme(e.to_string()))?;

        for authz in &authorizations {
            if authz.status != AuthorizationStatus::Pending {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| CertError::Acme("no http-01 challenge offered".into()))?;
            let key_auth = order.key_authorization(challenge);
            self.challenges.set(&challenge.token, key_auth.as_str());
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| CertError::Acme(e.to_string()))?;
        }

        poll_order_ready(&mut order)
            .await
            .map_err(|e| CertError::Acme(e.to_string()))?;

        let mut params = rcgen::CertificateParams::new(
            std::iter::once(canonical.to_owned())
                .chain(alt_names.iter().cloned())
                .collect::<Vec<_>>(),
        )
        .map_err(|e| CertError::Acme(e.to_string()))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate().map_err(|e| CertError::Acme(e.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CertError::Acme(e.to_string()))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| CertError::Acme(e.to_string()))?;

        let cert_chain_pem = loop {
            match order.certificate().await.map_err(|e| CertError::Acme(e.to_string()))? {
                Some(pem) => break pem,
                None => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        };

        for authz in authorizations {
            if let Identifier::Dns(name) = authz.identifier {
                let token_to_clear: Vec<String> = authz
                    .challenges
                    .iter()
                    .filter(|c| c.r#type == ChallengeType::Http01)
                    .map(|c| c.token.clone())
                    .collect();
                for t in token_to_clear {
                    self.challenges.remove(&t);
                }
                let _ = name;
            }
        }

        let dir = self.storage_dir.join(canonical);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("cert.pem"), cert_chain_pem)?;
        std::fs::write(dir.join("key.pem"), key_pair.serialize_pem())?;
        Ok(())
    }

    /// Periodic renewal scan, run on an hourly tick from `main`.
    pub async fn renew_expiring(self: &Arc<Self>) {
        let entries: Vec<(String, CertMeta)> = {
            let map = self.map.load();
            map.by_canonical
                .iter()
                .map(|(k, v)| (k.clone(), v.meta.clone()))
                .collect()
        };
        let now = Utc::now();
        for (canonical, meta) in entries {
            if meta.not_after - now < RENEW_WITHIN {
                let alt_names = meta
                    .alt_names
                    .into_iter()
                    .filter(|a| a != &canonical)
                    .collect();
                self.clone().ensure_certificate(canonical, alt_names, None);
            }
        }
    }
}

async fn poll_order_ready(order: &mut instant_acme::Order) -> std::result::Result<(), instant_acme::Error> {
    let mut delay = Duration::from_millis(500);
    loop {
        let state = order.refresh().await?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                return Err(instant_acme::Error::Str("order became invalid"));
            }
            _ => {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
        }
    }
}

fn build_map(dir: &Path) -> Result<CertMap> {
    let mut map = CertMap::default();
    if !dir.exists() {
        return Ok(map);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let canonical = entry.file_name().to_string_lossy().into_owned();
        let cert_path = entry.path().join("cert.pem");
        let key_path = entry.path().join("key.pem");
        if !cert_path.exists() || !key_path.exists() {
            continue;
        }
        match load_entry(&canonical, &cert_path, &key_path) {
            Ok(loaded) => {
                for alias in &loaded.meta.alt_names {
                    if alias != &canonical {
                        map.by_alias.insert(alias.clone(), canonical.clone());
                    }
                }
                map.by_canonical.insert(canonical, Arc::new(loaded));
            }
            Err(err) => {
                tracing::warn!(%canonical, %err, "failed to load certificate, skipping");
            }
        }
    }
    Ok(map)
}

fn load_entry(canonical: &str, cert_path: &Path, key_path: &Path) -> Result<Entry> {
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| CertError::Tls(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| CertError::Tls(e.to_string()))?
        .ok_or_else(|| CertError::Tls("no private key found".into()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::Tls(e.to_string()))?;
    let certified_key = CertifiedKey::new(certs.clone(), signing_key);

    let (not_before, not_after, alt_names) = parse_validity(&certs)?;

    Ok(Entry {
        key: Arc::new(certified_key),
        meta: CertMeta {
            common_name: canonical.to_owned(),
            alt_names,
            not_before,
            not_after,
        },
    })
}

fn parse_validity(
    certs: &[rustls::pki_types::CertificateDer<'static>],
) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<String>)> {
    let leaf = certs.first().ok_or_else(|| CertError::Tls("empty chain".into()))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| CertError::Tls(e.to_string()))?;
    let not_before = DateTime::from_timestamp(parsed.validity().not_before.timestamp(), 0)
        .unwrap_or_else(Utc::now);
    let not_after = DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
        .unwrap_or_else(Utc::now);
    let mut names = vec![];
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    Ok((not_before, not_after, names))
}

/// Adapts [`CertificateManager`] to rustls's SNI resolution hook.
pub struct SniResolver(pub Arc<CertificateManager>);

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.0.get_certificate(sni).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_exact_over_wildcard() {
        // Exercises only the pure matching logic against a hand-built
        // map, since building real certs needs an ACME round trip.
        let mut map = CertMap::default();
        let dummy = || {
            Arc::new(Entry {
                key: dummy_certified_key(),
                meta: CertMeta {
                    common_name: "x".into(),
                    alt_names: vec![],
                    not_before: Utc::now(),
                    not_after: Utc::now(),
                },
            })
        };
        map.by_canonical.insert("a.b.c".into(), dummy());
        map.by_canonical.insert("*.b.c".into(), dummy());

        let manager = test_manager(map);
        assert!(manager.resolve("a.b.c").is_some());
        assert!(manager.resolve("z.b.c").is_some());
        assert!(manager.resolve("z.q.c").is_none());
    }

    fn test_manager(map: CertMap) -> CertificateManager {
        let (tx, rx) = mpsc::unbounded_channel();
        CertificateManager {
            storage_dir: PathBuf::new(),
            map: ArcSwap::new(Arc::new(map)),
            default_protected: ArcSwap::new(Arc::new(None)),
            acme_directory_url: String::new(),
            default_email: None,
            challenges: ChallengeStore::default(),
            in_flight: AsyncMutex::new(std::collections::HashSet::new()),
            reload_tx: tx,
            reload_rx: AsyncMutex::new(Some(rx)),
        }
    }

    fn dummy_certified_key() -> Arc<CertifiedKey> {
        let kp = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["test".into()]).unwrap();
        let cert = params.self_signed(&kp).unwrap();
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&kp.serialize_der().into())
            .unwrap();
        Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key))
    }
}
