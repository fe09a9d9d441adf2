//! Bearer token acquisition through an external credential CLI, with a
//! per-scope-set cache.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::AuthError;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Stderr phrases the CLI uses when there is no signed-in session.
const LOGIN_HINTS: [&str; 4] = ["log in", "not logged in", "please login", "logged out"];

/// Why a single fetch from a [`CredentialSource`] failed.
#[derive(Debug)]
pub enum FetchError {
    /// The source does not understand scope narrowing.
    ScopeRejected { stderr: String },
    Auth(AuthError),
}

impl From<AuthError> for FetchError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

/// Something that can hand out a raw bearer token for a resource.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, resource: &str, scopes: Option<&[String]>) -> Result<String, FetchError>;
}

/// Runs `<command> util accesstoken get --resource <uri> [--scope a,b]`.
pub struct CliCredentialSource {
    command: String,
}

impl CliCredentialSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    // The CLI is installed as a .cmd shim on Windows, which CreateProcess
    // cannot start directly.
    #[cfg(windows)]
    fn base_command(&self) -> Command {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(&self.command);
        cmd
    }

    #[cfg(not(windows))]
    fn base_command(&self) -> Command {
        Command::new(&self.command)
    }

    fn classify(&self, status: String, stderr: String) -> FetchError {
        // Phrases only; a bare "login" also matches login.microsoftonline.com
        // in network errors.
        let lower = stderr.to_lowercase();
        if lower.contains("is not recognized as an internal or external command") {
            return AuthError::CliNotFound {
                command: self.command.clone(),
            }
            .into();
        }
        let mentions_scope = lower.contains("scope");
        let rejected = ["unknown", "unrecognized", "invalid option", "not supported"]
            .iter()
            .any(|marker| lower.contains(marker));
        if mentions_scope && rejected {
            return FetchError::ScopeRejected { stderr };
        }
        if LOGIN_HINTS.iter().any(|hint| lower.contains(hint)) {
            return AuthError::NotLoggedIn {
                command: self.command.clone(),
            }
            .into();
        }
        AuthError::CommandFailed { status, stderr }.into()
    }
}

#[async_trait::async_trait]
impl CredentialSource for CliCredentialSource {
    async fn fetch(&self, resource: &str, scopes: Option<&[String]>) -> Result<String, FetchError> {
        let mut cmd = self.base_command();
        cmd.args(["util", "accesstoken", "get", "--resource", resource]);
        if let Some(scopes) = scopes.filter(|s| !s.is_empty()) {
            cmd.arg("--scope").arg(scopes.join(","));
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        log::debug!("Running credential command '{}' (scoped={})", self.command, scopes.is_some());
        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::CliNotFound {
                    command: self.command.clone(),
                }
                .into());
            }
            Err(e) => {
                return Err(AuthError::Spawn {
                    command: self.command.clone(),
                    source: e,
                }
                .into());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(self.classify(output.status.to_string(), stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    token: String,
    expires_at: Instant,
}

type Slot = Arc<AsyncMutex<Option<CacheEntry>>>;

/// Token cache keyed by the normalized scope set.
///
/// Each key owns an async slot. A caller holds the slot while it refreshes,
/// so concurrent callers for the same key wait for that one acquisition
/// instead of starting their own.
pub struct TokenCache {
    source: Arc<dyn CredentialSource>,
    resource: String,
    ttl: Duration,
    scopes_supported: AtomicBool,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Sort, trim and deduplicate a scope list.
pub fn normalize_scopes<S: AsRef<str>>(scopes: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = scopes
        .iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Cache key for a scope list. The empty key means "default scopes".
pub fn cache_key<S: AsRef<str>>(scopes: &[S]) -> String {
    normalize_scopes(scopes).join(" ")
}

impl TokenCache {
    pub fn new(source: Arc<dyn CredentialSource>, resource: impl Into<String>, ttl: Duration) -> Self {
        Self {
            source,
            resource: resource.into(),
            ttl,
            scopes_supported: AtomicBool::new(true),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the credential source is still believed to accept `--scope`.
    pub fn scopes_supported(&self) -> bool {
        self.scopes_supported.load(Ordering::Relaxed)
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    pub async fn get_access_token<S: AsRef<str>>(&self, scopes: &[S]) -> Result<String, AuthError> {
        let scopes = normalize_scopes(scopes);
        let key = cache_key(&scopes);
        let slot = self.slot(&key);
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if Instant::now() < cached.expires_at {
                log::debug!("Token cache hit for [{}]", key);
                return Ok(cached.token.clone());
            }
        }

        log::debug!("Token cache miss for [{}]", key);
        let token = self.acquire(&scopes).await?;
        *entry = Some(CacheEntry {
            token: token.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(token)
    }

    async fn acquire(&self, scopes: &[String]) -> Result<String, AuthError> {
        let narrowed = !scopes.is_empty() && self.scopes_supported();
        let first = self
            .source
            .fetch(&self.resource, narrowed.then_some(scopes))
            .await;

        let raw = match first {
            Ok(raw) => raw,
            Err(FetchError::ScopeRejected { stderr }) if narrowed => {
                log::warn!(
                    "Credential command rejected --scope, falling back to default scopes: {}",
                    stderr
                );
                self.scopes_supported.store(false, Ordering::Relaxed);
                match self.source.fetch(&self.resource, None).await {
                    Ok(raw) => raw,
                    Err(FetchError::Auth(e)) => return Err(e),
                    Err(FetchError::ScopeRejected { stderr }) => {
                        return Err(AuthError::CommandFailed {
                            status: "scope rejected".to_string(),
                            stderr,
                        })
                    }
                }
            }
            Err(FetchError::ScopeRejected { stderr }) => {
                return Err(AuthError::CommandFailed {
                    status: "scope rejected".to_string(),
                    stderr,
                })
            }
            Err(FetchError::Auth(e)) => return Err(e),
        };

        let token = raw.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(token.to_string())
    }

    /// Drop every cached token.
    pub fn clear(&self) {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Hands out a fixed token, for tests that exercise the request layer.
#[cfg(test)]
pub(crate) struct StaticCredentialSource(pub &'static str);

#[cfg(test)]
#[async_trait::async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn fetch(&self, _resource: &str, _scopes: Option<&[String]>) -> Result<String, FetchError> {
        Ok(self.0.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts fetches and records whether each was scoped.
    struct FakeSource {
        calls: AtomicUsize,
        scoped_calls: AtomicUsize,
        reject_scopes: bool,
        token: String,
        delay: Duration,
    }

    impl FakeSource {
        fn new(token: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                scoped_calls: AtomicUsize::new(0),
                reject_scopes: false,
                token: token.to_string(),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CredentialSource for FakeSource {
        async fn fetch(&self, _resource: &str, scopes: Option<&[String]>) -> Result<String, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if scopes.is_some() {
                self.scoped_calls.fetch_add(1, Ordering::SeqCst);
                if self.reject_scopes {
                    return Err(FetchError::ScopeRejected {
                        stderr: "error: unknown option '--scope'".to_string(),
                    });
                }
            }
            Ok(format!("{}-{}\n", self.token, n))
        }
    }

    fn cache(source: &Arc<FakeSource>, ttl: Duration) -> TokenCache {
        let source: Arc<dyn CredentialSource> = source.clone();
        TokenCache::new(source, "https://graph.microsoft.com", ttl)
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        assert_eq!(
            cache_key(&["Mail.Send", "Mail.Read", "Mail.Read"]),
            cache_key(&[" Mail.Read", "Mail.Send"])
        );
        assert_eq!(cache_key(&["b", "a"]), "a b");
        assert_eq!(cache_key::<&str>(&[]), "");
    }

    #[tokio::test]
    async fn test_token_is_trimmed_and_cached() {
        let source = Arc::new(FakeSource::new("tok"));
        let cache = cache(&source, DEFAULT_TOKEN_TTL);

        let first = cache.get_access_token(&["Mail.Read", "Mail.Send"]).await.unwrap();
        let second = cache.get_access_token(&["Mail.Send", "Mail.Read"]).await.unwrap();

        assert_eq!(first, "tok-1");
        assert_eq!(second, "tok-1");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_separately() {
        let source = Arc::new(FakeSource::new("tok"));
        let cache = cache(&source, DEFAULT_TOKEN_TTL);

        cache.get_access_token::<&str>(&[]).await.unwrap();
        cache.get_access_token(&["Calendars.Read"]).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let source = Arc::new(FakeSource::new("tok"));
        let cache = cache(&source, Duration::ZERO);

        assert_eq!(cache.get_access_token(&["Mail.Read"]).await.unwrap(), "tok-1");
        assert_eq!(cache.get_access_token(&["Mail.Read"]).await.unwrap(), "tok-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_scope_rejection_falls_back_and_is_remembered() {
        let mut fake = FakeSource::new("tok");
        fake.reject_scopes = true;
        let source = Arc::new(fake);
        let cache = cache(&source, DEFAULT_TOKEN_TTL);

        let token = cache.get_access_token(&["Mail.Read"]).await.unwrap();
        assert_eq!(token, "tok-2");
        assert!(!cache.scopes_supported());
        assert_eq!(source.scoped_calls.load(Ordering::SeqCst), 1);

        cache.get_access_token(&["Calendars.Read"]).await.unwrap();
        assert_eq!(source.calls(), 3);
        assert_eq!(source.scoped_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_token_is_an_error_and_not_cached() {
        let source = Arc::new(FakeSource::new(""));
        struct Blank(Arc<FakeSource>);
        #[async_trait::async_trait]
        impl CredentialSource for Blank {
            async fn fetch(&self, _: &str, _: Option<&[String]>) -> Result<String, FetchError> {
                self.0.calls.fetch_add(1, Ordering::SeqCst);
                Ok("   \n".to_string())
            }
        }
        let cache = TokenCache::new(Arc::new(Blank(source.clone())), "res", DEFAULT_TOKEN_TTL);

        assert!(matches!(
            cache.get_access_token(&["Mail.Read"]).await,
            Err(AuthError::EmptyToken)
        ));
        assert!(cache.get_access_token(&["Mail.Read"]).await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_acquisition() {
        let mut fake = FakeSource::new("tok");
        fake.delay = Duration::from_millis(50);
        let source = Arc::new(fake);
        let cache = Arc::new(cache(&source, DEFAULT_TOKEN_TTL));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.spawn(async move { cache.get_access_token(&["Mail.Read"]).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap(), "tok-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_clear_forces_reacquisition() {
        let source = Arc::new(FakeSource::new("tok"));
        let cache = cache(&source, DEFAULT_TOKEN_TTL);

        cache.get_access_token(&["Mail.Read"]).await.unwrap();
        cache.clear();
        assert_eq!(cache.get_access_token(&["Mail.Read"]).await.unwrap(), "tok-2");
    }

    #[test]
    fn test_classify_stderr() {
        let cli = CliCredentialSource::new("m365");
        assert!(matches!(
            cli.classify("exit status: 1".into(), "error: unknown option '--scope'".into()),
            FetchError::ScopeRejected { .. }
        ));
        assert!(matches!(
            cli.classify("exit status: 1".into(), "Error: Log in to Microsoft 365 first".into()),
            FetchError::Auth(AuthError::NotLoggedIn { .. })
        ));
        assert!(matches!(
            cli.classify("exit status: 1".into(), "'m365' is not recognized as an internal or external command".into()),
            FetchError::Auth(AuthError::CliNotFound { .. })
        ));
        assert!(matches!(
            cli.classify("exit status: 2".into(), "boom".into()),
            FetchError::Auth(AuthError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_network_error_naming_login_host_is_not_a_login_prompt() {
        let cli = CliCredentialSource::new("m365");
        let stderr = "Error: request to https://login.microsoftonline.com/common/oauth2/token failed, reason: getaddrinfo ENOTFOUND";
        match cli.classify("exit status: 1".into(), stderr.into()) {
            FetchError::Auth(AuthError::CommandFailed { stderr: carried, .. }) => {
                assert_eq!(carried, stderr);
            }
            other => panic!("unexpected classification: {:?}", other),
        }
        assert!(matches!(
            cli.classify("exit status: 1".into(), "You are not logged in".into()),
            FetchError::Auth(AuthError::NotLoggedIn { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_cli_reports_remediation() {
        let cli = CliCredentialSource::new("definitely-not-a-credential-cli-4821");
        let err = cli.fetch("https://graph.microsoft.com", None).await.unwrap_err();
        match err {
            FetchError::Auth(err @ AuthError::CliNotFound { .. }) => {
                assert!(err.to_string().contains("GRAPH_CREDENTIAL_COMMAND"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_script_scope_fallback() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-m365");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor a in \"$@\"; do\n  if [ \"$a\" = \"--scope\" ]; then\n    echo \"error: unknown option '--scope'\" >&2\n    exit 1\n  fi\ndone\necho '  cli-token  '\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = Arc::new(CliCredentialSource::new(script.to_string_lossy()));
        let cache = TokenCache::new(source, "https://graph.microsoft.com", DEFAULT_TOKEN_TTL);

        let token = cache.get_access_token(&["Mail.Read"]).await.unwrap();
        assert_eq!(token, "cli-token");
        assert!(!cache.scopes_supported());
    }
}
