//! Environment-driven configuration of a storage stack.
//!
//! The environment is read once, at process start, into a [`StackConfig`].
//! [`StackConfig::from_vars`] takes the variables explicitly so tests never
//! touch the process environment.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stowage_reduce::{CacheConfig, RepositoryOptions, SafetyLevel, DEFAULT_MAX_CACHE_BYTES};
use stowage_storage::{path, BackendConfig, StorageError, StorageResult, DEFAULT_ALGORITHM};

/// Directory of a local backend; unset selects an in-memory backend
pub const ENV_LOCAL_BACKEND_PATH: &str = "STOWAGE_LOCAL_BACKEND_PATH";
/// Base path every caller path is confined beneath
pub const ENV_BACKEND_BASE_PATH: &str = "STOWAGE_BACKEND_BASE_PATH";
/// Stream encryption algorithm; unset disables encryption
pub const ENV_ENCRYPTION_ALGORITHM: &str = "STOWAGE_ENCRYPTION_ALGORITHM";
/// Stream encryption passphrase
pub const ENV_ENCRYPTION_PASS_PHRASE: &str = "STOWAGE_ENCRYPTION_PASS_PHRASE";
/// Repository root; set to enable the content-addressable layer
pub const ENV_CAS_REPO_ROOT: &str = "STOWAGE_CAS_REPO_ROOT";
/// Repository password
pub const ENV_CAS_PASSWORD: &str = "STOWAGE_CAS_PASSWORD";
/// Disable the local chunk cache
pub const ENV_CAS_DISABLE_CACHE: &str = "STOWAGE_CAS_DISABLE_CACHE";
/// Run maintenance when the stack is finalized
pub const ENV_CAS_MAINTENANCE: &str = "STOWAGE_CAS_MAINTENANCE";
/// Maintenance safety level, `none` or `full`
pub const ENV_CAS_SAFETY: &str = "STOWAGE_CAS_SAFETY";

/// Content-addressable layer settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasConfig {
    /// Repository root inside the backend. The sidecar lives next to it.
    pub repo_root: String,
    /// Repository password; empty selects the built-in default
    #[serde(default)]
    pub password: String,
    /// Skip the local chunk cache
    #[serde(default)]
    pub disable_cache: bool,
    /// Parent directory of the chunk cache
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Backend the repository lives in; part of the cache identity
    #[serde(default)]
    pub backend: BackendConfig,
}

impl fmt::Debug for CasConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasConfig")
            .field("repo_root", &self.repo_root)
            .field("password", &"[REDACTED]")
            .field("disable_cache", &self.disable_cache)
            .field("cache_dir", &self.cache_dir)
            .field("backend", &self.backend.obscured())
            .finish()
    }
}

impl CasConfig {
    /// Settings for a repository at `repo_root`
    pub fn new(repo_root: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            password: String::new(),
            disable_cache: false,
            cache_dir: None,
            backend: BackendConfig::default(),
        }
    }

    /// Cleaned repository root. It may not be the backend root nor climb out of it.
    pub fn validated_root(&self) -> StorageResult<String> {
        let root = path::clean(self.repo_root.trim());
        if root == "." || root == "/" || root.starts_with("..") {
            return Err(StorageError::Config(format!(
                "repository root should not be '.', '/' or start with '..', got {:?}",
                self.repo_root
            )));
        }
        Ok(root)
    }

    /// Stable identity of this configuration seen through `base_path`:
    /// hex SHA-256 of the effective parameters followed by the base path.
    pub fn cache_id(&self, base_path: &str) -> String {
        let mut params: BTreeMap<String, String> = self.backend.effective_params();
        params.insert("cas.repo_root".to_string(), self.repo_root.clone());
        params.insert("cas.password".to_string(), self.password.clone());
        params.insert("cas.disable_cache".to_string(), self.disable_cache.to_string());
        let mut hasher = Sha256::new();
        for field in params.iter().flat_map(|(k, v)| [k, v]) {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(base_path.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Options the repository is opened with
    pub fn repository_options(&self, base_path: &str) -> RepositoryOptions {
        RepositoryOptions {
            cache: CacheConfig {
                cache_id: self.cache_id(base_path),
                disabled: self.disable_cache,
                base_dir: self.cache_dir.clone(),
                max_bytes: DEFAULT_MAX_CACHE_BYTES,
            },
            splitter: None,
        }
    }
}

/// Stream encryption settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Algorithm name, e.g. `AES-256-CFB`
    pub algorithm: String,
    /// Passphrase the key is derived from
    pub passphrase: String,
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("algorithm", &self.algorithm)
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: DEFAULT_ALGORITHM.to_string(),
            passphrase: String::new(),
        }
    }
}

/// Which layers a stack has and how they are set up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Backend holding everything
    pub backend: BackendConfig,
    /// Confinement base path; empty for none
    #[serde(default)]
    pub base_path: String,
    /// Stream encryption, outermost
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
    /// Content-addressable layer over the backend
    #[serde(default)]
    pub cas: Option<CasConfig>,
    /// Run maintenance on finalize
    #[serde(default)]
    pub maintenance: bool,
    /// Maintenance safety level
    #[serde(default)]
    pub safety: SafetyLevel,
}

impl StackConfig {
    /// Read the process environment.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> =
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        let local = get(ENV_LOCAL_BACKEND_PATH);
        let backend = if local.is_empty() {
            BackendConfig::memory()
        } else {
            BackendConfig::local(local)
        };

        let algorithm = get(ENV_ENCRYPTION_ALGORITHM);
        let encryption = if algorithm.is_empty() {
            None
        } else {
            let passphrase = vars.get(ENV_ENCRYPTION_PASS_PHRASE).cloned().unwrap_or_default();
            if passphrase.is_empty() {
                return Err(StorageError::Config(
                    "encryption pass phrase should not be empty".to_string(),
                ));
            }
            Some(EncryptionConfig {
                algorithm,
                passphrase,
            })
        };

        let repo_root = get(ENV_CAS_REPO_ROOT);
        let cas = if repo_root.is_empty() {
            None
        } else {
            Some(CasConfig {
                repo_root,
                password: get(ENV_CAS_PASSWORD),
                disable_cache: parse_bool(&get(ENV_CAS_DISABLE_CACHE)),
                cache_dir: None,
                backend: backend.clone(),
            })
        };

        Ok(Self {
            backend,
            base_path: get(ENV_BACKEND_BASE_PATH),
            encryption,
            cas,
            maintenance: parse_bool(&get(ENV_CAS_MAINTENANCE)),
            safety: SafetyLevel::parse(&get(ENV_CAS_SAFETY)),
        })
    }
}

/// `1`, `t` and `true` in any case are true; everything else is false.
fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "t" | "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_storage::ErrorKind;

    #[test]
    fn empty_environment_is_a_bare_memory_stack() {
        let cfg = StackConfig::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(cfg.backend, BackendConfig::memory());
        assert!(cfg.encryption.is_none());
        assert!(cfg.cas.is_none());
        assert!(!cfg.maintenance);
        assert_eq!(cfg.safety, SafetyLevel::Full);
    }

    #[test]
    fn full_environment() {
        let cfg = StackConfig::from_vars([
            (ENV_LOCAL_BACKEND_PATH, "/srv/data"),
            (ENV_BACKEND_BASE_PATH, " tenant "),
            (ENV_ENCRYPTION_ALGORITHM, "aes-128-cfb"),
            (ENV_ENCRYPTION_PASS_PHRASE, "secret"),
            (ENV_CAS_REPO_ROOT, "repo"),
            (ENV_CAS_PASSWORD, "pw"),
            (ENV_CAS_DISABLE_CACHE, "TRUE"),
            (ENV_CAS_MAINTENANCE, "1"),
            (ENV_CAS_SAFETY, "none"),
        ])
        .unwrap();
        assert_eq!(cfg.backend, BackendConfig::local("/srv/data"));
        assert_eq!(cfg.base_path, "tenant");
        let enc = cfg.encryption.unwrap();
        assert_eq!(enc.algorithm, "aes-128-cfb");
        assert_eq!(enc.passphrase, "secret");
        let cas = cfg.cas.unwrap();
        assert_eq!(cas.repo_root, "repo");
        assert_eq!(cas.password, "pw");
        assert!(cas.disable_cache);
        assert_eq!(cas.backend, cfg.backend);
        assert!(cfg.maintenance);
        assert_eq!(cfg.safety, SafetyLevel::None);
    }

    #[test]
    fn encryption_needs_a_passphrase() {
        let err = StackConfig::from_vars([(ENV_ENCRYPTION_ALGORITHM, "AES-256-CFB")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn repo_root_validation() {
        for bad in [".", "/", "..", "../x", "", "a/../.."] {
            assert!(CasConfig::new(bad).validated_root().is_err(), "{bad:?}");
        }
        assert_eq!(CasConfig::new("a/b/").validated_root().unwrap(), "a/b");
        assert_eq!(CasConfig::new("/srv/repo").validated_root().unwrap(), "/srv/repo");
    }

    #[test]
    fn cache_id_depends_on_config_and_base() {
        let a = CasConfig::new("repo");
        assert_eq!(a.cache_id("x"), a.cache_id("x"));
        assert_eq!(a.cache_id("x").len(), 64);
        assert_ne!(a.cache_id("x"), a.cache_id("y"));
        let mut b = a.clone();
        b.password = "other".to_string();
        assert_ne!(a.cache_id("x"), b.cache_id("x"));
        let mut c = a.clone();
        c.backend = BackendConfig::local("/tmp");
        assert_ne!(a.cache_id("x"), c.cache_id("x"));

        // Field boundaries are part of the identity.
        let mut d = a.clone();
        d.backend.params.insert("ab".to_string(), "c".to_string());
        let mut e = a.clone();
        e.backend.params.insert("a".to_string(), "bc".to_string());
        assert_ne!(d.cache_id("x"), e.cache_id("x"));
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let mut cfg = CasConfig::new("repo");
        cfg.password = "hunter2".to_string();
        assert!(!format!("{cfg:?}").contains("hunter2"));
        let enc = EncryptionConfig {
            passphrase: "hunter2".to_string(),
            ..EncryptionConfig::default()
        };
        assert!(!format!("{enc:?}").contains("hunter2"));
    }
}
