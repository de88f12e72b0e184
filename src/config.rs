use secrecy::SecretString;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::attr::AuthInfo;

/// File name of the sshftp helper program
pub const SSH_EXEC_SCRIPT: &str = "gridftp-ssh";

/// Process-wide engine defaults
///
/// Loaded once at startup and shared by every handle through an `Arc`.
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// User presented when the caller supplies no credentials (JSON field: default_user)
    pub default_user: String,
    /// Password paired with `default_user` (JSON field: default_password)
    pub default_password: SecretString,
    /// Expected server subject for default authentication (JSON field: default_subject)
    pub default_subject: Option<String>,
    /// Idle seconds after which a cached connection gets a real NOOP (JSON field: noop_idle_secs)
    pub noop_idle_secs: u64,
    /// Control connection timeout in seconds (JSON field: connect_timeout_secs)
    pub connect_timeout_secs: u64,
    /// Explicit path of the sshftp helper program (JSON field: ssh_client_program)
    pub ssh_client_program: Option<PathBuf>,
    /// Directories searched for the helper instead of the built-in list (JSON field: ssh_search_path)
    pub ssh_search_path: Option<Vec<PathBuf>>,
    /// Cache every URL a handle touches, not just the requested ones (JSON field: cache_all)
    pub cache_all: bool,
    /// Wrap gsiftp control channels in TLS (JSON field: secure_gsiftp_control)
    pub secure_gsiftp_control: bool,
    /// Accept any server certificate (JSON field: insecure_skip_verify)
    pub insecure_skip_verify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_user: ":globus-mapping:".to_string(),
            default_password: SecretString::new(String::new()),
            default_subject: None,
            noop_idle_secs: 15,
            connect_timeout_secs: 30,
            ssh_client_program: None,
            ssh_search_path: None,
            cache_all: false,
            secure_gsiftp_control: true,
            insecure_skip_verify: false,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON configuration file
    ///
    /// # Errors
    /// - File not found or unreadable
    /// - Invalid JSON (reported with the line number)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, Error> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<EngineConfig, Error> {
        serde_json::from_str(text).map_err(|e| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("invalid JSON on line {}: {}", e.line(), e),
            )
        })
    }

    /// Credentials used for targets whose attributes carry no explicit auth.
    pub fn default_auth(&self) -> AuthInfo {
        AuthInfo {
            user: Some(self.default_user.clone()),
            password: Some(self.default_password.clone()),
            account: None,
            subject: self.default_subject.clone(),
        }
    }

    pub fn noop_idle(&self) -> Duration {
        Duration::from_secs(self.noop_idle_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Overlays values found in an external parameter source
    ///
    /// Keys: `noop_idle_secs`, `connect_timeout_secs`, `ssh_client_program`,
    /// `cache_all`, `secure_gsiftp_control`, `insecure_skip_verify`.
    /// Unparseable values are ignored.
    pub fn apply_params(&mut self, params: &dyn ParamSource) {
        if let Some(v) = params.lookup_u64("noop_idle_secs") {
            self.noop_idle_secs = v;
        }
        if let Some(v) = params.lookup_u64("connect_timeout_secs") {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = params.lookup("ssh_client_program") {
            self.ssh_client_program = Some(PathBuf::from(v));
        }
        if let Some(v) = params.lookup_bool("cache_all") {
            self.cache_all = v;
        }
        if let Some(v) = params.lookup_bool("secure_gsiftp_control") {
            self.secure_gsiftp_control = v;
        }
        if let Some(v) = params.lookup_bool("insecure_skip_verify") {
            self.insecure_skip_verify = v;
        }
    }

    /// Locates the sshftp helper program
    ///
    /// Search order: explicit `ssh_client_program`, then the search path
    /// override if set, else `$HOME/.globus/gridftp-ssh`,
    /// `$GLOBUS_LOCATION/libexec/gridftp-ssh` and
    /// `/etc/grid-security/gridftp-ssh`. The first existing file wins.
    pub fn find_ssh_client_program(&self) -> Option<PathBuf> {
        if let Some(path) = &self.ssh_client_program {
            return path.is_file().then(|| path.clone());
        }
        let candidates = match &self.ssh_search_path {
            Some(dirs) => dirs.iter().map(|d| d.join(SSH_EXEC_SCRIPT)).collect(),
            None => default_helper_candidates(),
        };
        candidates.into_iter().find(|p| p.is_file())
    }
}

fn default_helper_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(home) = env::var("HOME") {
        candidates.push(Path::new(&home).join(".globus").join(SSH_EXEC_SCRIPT));
    }
    if let Ok(location) = env::var("GLOBUS_LOCATION") {
        candidates.push(Path::new(&location).join("libexec").join(SSH_EXEC_SCRIPT));
    }
    candidates.push(Path::new("/etc/grid-security").join(SSH_EXEC_SCRIPT));
    candidates
}

/// Key to value lookup for externally supplied parameters
pub trait ParamSource {
    fn lookup(&self, key: &str) -> Option<String>;

    fn lookup_u64(&self, key: &str) -> Option<u64> {
        self.lookup(key).and_then(|v| v.trim().parse().ok())
    }

    fn lookup_bool(&self, key: &str) -> Option<bool> {
        match self.lookup(key)?.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

/// Reads parameters from `GRIDFTP_CLIENT_<KEY>` environment variables
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvParams;

impl ParamSource for EnvParams {
    fn lookup(&self, key: &str) -> Option<String> {
        env::var(format!("GRIDFTP_CLIENT_{}", key.to_ascii_uppercase())).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config.noop_idle_secs, 15);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(config.secure_gsiftp_control);
        assert!(!config.cache_all);
        let auth = config.default_auth();
        assert_eq!(auth.user.as_deref(), Some(":globus-mapping:"));
        assert_eq!(auth.password_or_empty(), "");
    }

    #[test]
    fn test_parse_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut file = File::create(&path).unwrap();
        file.write_all(
            br#"{
  "noop_idle_secs": 5,
  "cache_all": true,
  "default_user": "anonymous",
  "default_password": "guest@",
  "ssh_client_program": "/opt/helper"
}"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.noop_idle(), Duration::from_secs(5));
        assert!(config.cache_all);
        assert_eq!(config.default_user, "anonymous");
        assert_eq!(config.default_password.expose_secret(), "guest@");
        assert_eq!(config.ssh_client_program, Some(PathBuf::from("/opt/helper")));
    }

    #[test]
    fn test_invalid_json_reports_line() {
        let err = EngineConfig::from_json_str("{\n  \"noop_idle_secs\": \"x\"\n}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    struct MapParams(HashMap<&'static str, &'static str>);

    impl ParamSource for MapParams {
        fn lookup(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    #[test]
    fn test_apply_params_overlays_known_keys() {
        let mut config = EngineConfig::default();
        let params = MapParams(HashMap::from([
            ("noop_idle_secs", "60"),
            ("cache_all", "yes"),
            ("secure_gsiftp_control", "nonsense"),
        ]));
        config.apply_params(&params);
        assert_eq!(config.noop_idle_secs, 60);
        assert!(config.cache_all);
        assert!(config.secure_gsiftp_control);
    }

    #[test]
    #[serial]
    fn test_env_params() {
        temp_env::with_vars(
            [
                ("GRIDFTP_CLIENT_CONNECT_TIMEOUT_SECS", Some("7")),
                ("GRIDFTP_CLIENT_INSECURE_SKIP_VERIFY", Some("true")),
            ],
            || {
                let mut config = EngineConfig::default();
                config.apply_params(&EnvParams);
                assert_eq!(config.connect_timeout_secs, 7);
                assert!(config.insecure_skip_verify);
            },
        );
    }

    #[test]
    #[serial]
    fn test_helper_search_order() {
        let location = tempdir().unwrap();
        let home = tempdir().unwrap();
        let libexec = location.path().join("libexec");
        fs::create_dir_all(&libexec).unwrap();
        let globus_helper = libexec.join("gridftp-ssh");
        let home_helper = home.path().join(".globus").join("gridftp-ssh");
        fs::create_dir_all(home_helper.parent().unwrap()).unwrap();

        temp_env::with_vars(
            [
                ("GLOBUS_LOCATION", Some(location.path().to_str().unwrap())),
                ("HOME", Some(home.path().to_str().unwrap())),
            ],
            || {
                let config = EngineConfig::default();
                File::create(&globus_helper).unwrap();
                assert_eq!(config.find_ssh_client_program(), Some(globus_helper.clone()));

                File::create(&home_helper).unwrap();
                assert_eq!(config.find_ssh_client_program(), Some(home_helper.clone()));
            },
        );
    }

    #[test]
    fn test_explicit_helper_must_exist() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.ssh_client_program = Some(dir.path().join("missing"));
        assert_eq!(config.find_ssh_client_program(), None);

        let present = dir.path().join("helper");
        File::create(&present).unwrap();
        config.ssh_client_program = Some(present.clone());
        assert_eq!(config.find_ssh_client_program(), Some(present));
    }
}
