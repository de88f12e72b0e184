//! Per-handle cache of idle targets.
//!
//! A slot is reserved for a URL with `add` (or automatically when the
//! engine caches everything). Released targets are only kept when a
//! reserved slot for their endpoint is free; everything else is shut down.

use std::sync::Arc;
use std::time::Instant;

use crate::attr::OperationAttributes;
use crate::config::EngineConfig;
use crate::error::ClientError;
use crate::target::{effective_auth, Target, TargetState};
use crate::url::FtpUrl;

#[derive(Debug)]
struct CacheEntry {
    url: FtpUrl,
    target: Option<Target>,
}

/// What `release` did with a target.
#[derive(Debug)]
pub enum Released {
    Cached,
    /// The target is not kept; the caller closes its connection.
    Evicted(Target),
}

#[derive(Debug, Default)]
pub struct Cache {
    entries: Vec<CacheEntry>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot for `url`'s endpoint.
    pub fn add(&mut self, url: &FtpUrl) -> Result<(), ClientError> {
        if self.entries.iter().any(|e| e.url.same_endpoint(url)) {
            return Err(ClientError::AlreadyDone);
        }
        self.entries.push(CacheEntry {
            url: url.clone(),
            target: None,
        });
        Ok(())
    }

    /// Drops every slot for `url`'s endpoint and hands back the idle
    /// targets they held.
    pub fn remove(&mut self, url: &FtpUrl) -> Result<Vec<Target>, ClientError> {
        if !self.entries.iter().any(|e| e.url.same_endpoint(url)) {
            return Err(ClientError::ObjectNotInUse("url cache entry"));
        }
        let mut evicted = Vec::new();
        self.entries.retain_mut(|e| {
            if e.url.same_endpoint(url) {
                evicted.extend(e.target.take());
                false
            } else {
                true
            }
        });
        Ok(evicted)
    }

    /// Takes every cached target out; used when the handle is dropped.
    pub fn drain(&mut self) -> Vec<Target> {
        self.entries.drain(..).filter_map(|e| e.target).collect()
    }

    pub fn contains(&self, url: &FtpUrl) -> bool {
        self.entries.iter().any(|e| e.url.same_endpoint(url))
    }

    /// Number of idle targets held.
    pub fn idle_count(&self) -> usize {
        self.entries.iter().filter(|e| e.target.is_some()).count()
    }

    /// Returns a cached target compatible with `url`/`attr`, or a new one.
    ///
    /// A cached target is compatible when it serves the same endpoint and
    /// logged in with the credentials a new target would use: the explicit
    /// ones, else those of the URL (ftp, sshftp) or the engine default
    /// (gsiftp).
    pub fn find_or_create(
        &mut self,
        url: &FtpUrl,
        attr: Option<&OperationAttributes>,
        config: &Arc<EngineConfig>,
    ) -> Target {
        let hit = self.entries.iter_mut().find(|e| {
            e.url.same_endpoint(url)
                && e.target
                    .as_ref()
                    .is_some_and(|t| compatible(t, url, attr, config))
        });
        if let Some(entry) = hit {
            if let Some(mut target) = entry.target.take() {
                target.url = url.clone();
                target.set_attr(attr, config);
                return target;
            }
        }
        if config.cache_all && !self.contains(url) {
            self.entries.push(CacheEntry {
                url: url.clone(),
                target: None,
            });
        }
        Target::new(url, attr, config)
    }

    /// Takes a target back at the end of an operation.
    pub fn release(&mut self, mut target: Target) -> Released {
        if target.state == TargetState::CompletedOperation {
            target.state = TargetState::SetupConnection;
        }
        if target.state != TargetState::SetupConnection {
            return Released::Evicted(target);
        }
        target.plan.clear();
        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.target.is_none() && e.url.same_endpoint(&target.url));
        match slot {
            Some(entry) => {
                target.last_access = Instant::now();
                entry.target = Some(target);
                Released::Cached
            }
            None => Released::Evicted(target),
        }
    }
}

fn compatible(
    cached: &Target,
    url: &FtpUrl,
    attr: Option<&OperationAttributes>,
    config: &EngineConfig,
) -> bool {
    let attr = attr.cloned().unwrap_or_default();
    cached.attr.auth == effective_auth(url, &attr, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AuthInfo;
    use crate::target::TargetId;

    fn url(s: &str) -> FtpUrl {
        FtpUrl::parse(s).unwrap()
    }

    fn config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig::default())
    }

    fn idle(cache: &mut Cache, u: &FtpUrl, attr: Option<&OperationAttributes>) -> TargetId {
        let mut t = cache.find_or_create(u, attr, &config());
        t.state = TargetState::CompletedOperation;
        let id = t.id;
        assert!(matches!(cache.release(t), Released::Cached));
        id
    }

    #[test]
    fn test_release_then_find_returns_same_target() {
        let mut cache = Cache::new();
        let u = url("gsiftp://h:2811/a/b");
        cache.add(&u).unwrap();
        let id = idle(&mut cache, &u, None);
        let again = cache.find_or_create(&url("gsiftp://h:2811/other"), None, &config());
        assert_eq!(again.id, id);
        assert_eq!(again.url.path, "/other");
        assert_eq!(cache.idle_count(), 0);
    }

    #[test]
    fn test_remove_forces_new_target() {
        let mut cache = Cache::new();
        let u = url("ftp://h/x");
        cache.add(&u).unwrap();
        let id = idle(&mut cache, &u, None);
        let evicted = cache.remove(&u).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, id);
        let fresh = cache.find_or_create(&u, None, &config());
        assert_ne!(fresh.id, id);
    }

    #[test]
    fn test_add_twice_is_already_done() {
        let mut cache = Cache::new();
        cache.add(&url("ftp://h/x")).unwrap();
        assert!(matches!(cache.add(&url("ftp://H:21/y")), Err(ClientError::AlreadyDone)));
        assert!(matches!(
            cache.remove(&url("ftp://other/")),
            Err(ClientError::ObjectNotInUse(_))
        ));
    }

    #[test]
    fn test_unreserved_release_evicts() {
        let mut cache = Cache::new();
        let mut t = cache.find_or_create(&url("ftp://h/x"), None, &config());
        t.state = TargetState::SetupConnection;
        assert!(matches!(cache.release(t), Released::Evicted(_)));
    }

    #[test]
    fn test_faulted_target_is_never_cached() {
        let mut cache = Cache::new();
        let u = url("ftp://h/x");
        cache.add(&u).unwrap();
        let mut t = cache.find_or_create(&u, None, &config());
        t.state = TargetState::Fault;
        assert!(matches!(cache.release(t), Released::Evicted(_)));
        assert_eq!(cache.idle_count(), 0);
    }

    #[test]
    fn test_explicit_auth_must_match() {
        let mut cache = Cache::new();
        let u = url("gsiftp://h/x");
        cache.add(&u).unwrap();
        let mut alice = OperationAttributes::new();
        alice.set_authorization(AuthInfo::new(Some("alice"), Some("a")));
        let id = idle(&mut cache, &u, Some(&alice));

        let mut bob = OperationAttributes::new();
        bob.set_authorization(AuthInfo::new(Some("bob"), Some("b")));
        let other = cache.find_or_create(&u, Some(&bob), &config());
        assert_ne!(other.id, id);

        let same = cache.find_or_create(&u, Some(&alice), &config());
        assert_eq!(same.id, id);
    }

    #[test]
    fn test_default_auth_matches_default_on_gsiftp() {
        let mut cache = Cache::new();
        let u = url("gsiftp://h/x");
        cache.add(&u).unwrap();
        let id = idle(&mut cache, &u, Some(&OperationAttributes::new()));
        let again = cache.find_or_create(&u, Some(&OperationAttributes::new()), &config());
        assert_eq!(again.id, id);
    }

    #[test]
    fn test_url_credentials_must_match() {
        let mut cache = Cache::new();
        let alice = url("ftp://alice:a@h/x");
        cache.add(&alice).unwrap();
        let id = idle(&mut cache, &alice, None);

        let bob = cache.find_or_create(&url("ftp://bob:b@h/y"), None, &config());
        assert_ne!(bob.id, id);
        assert_eq!(bob.attr.auth.user_or_anonymous(), "bob");

        let again = cache.find_or_create(&url("ftp://alice:a@h/z"), None, &config());
        assert_eq!(again.id, id);
    }

    #[test]
    fn test_default_caller_skips_explicit_target_on_gsiftp() {
        let mut cache = Cache::new();
        let u = url("gsiftp://h/x");
        cache.add(&u).unwrap();
        let mut alice = OperationAttributes::new();
        alice.set_authorization(AuthInfo::new(Some("alice"), Some("a")));
        let id = idle(&mut cache, &u, Some(&alice));

        let fresh = cache.find_or_create(&u, None, &config());
        assert_ne!(fresh.id, id);
        assert_eq!(fresh.attr.auth, config().default_auth());
    }

    #[test]
    fn test_cache_all_reserves_slots() {
        let mut cache = Cache::new();
        let mut cfg = EngineConfig::default();
        cfg.cache_all = true;
        let cfg = Arc::new(cfg);
        let u = url("ftp://h/x");
        let mut t = cache.find_or_create(&u, None, &cfg);
        t.state = TargetState::SetupConnection;
        assert!(matches!(cache.release(t), Released::Cached));
    }
}
