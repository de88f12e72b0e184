//! Per-operation attribute bundle.
//!
//! A target takes its own copy of the caller's attributes when it is
//! found or created, so nothing the caller does afterwards leaks into an
//! operation that is already running.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Data transfer mode (`MODE S` / `MODE E`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Stream,
    ExtendedBlock,
}

impl Mode {
    pub fn code(self) -> char {
        match self {
            Mode::Stream => 'S',
            Mode::ExtendedBlock => 'E',
        }
    }
}

/// Representation type (`TYPE A` / `TYPE I`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    Ascii,
    #[default]
    Image,
}

impl DataType {
    pub fn code(self) -> char {
        match self {
            DataType::Ascii => 'A',
            DataType::Image => 'I',
        }
    }
}

/// Data channel authentication.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Dcau {
    /// Whatever the server starts with: self for gsiftp, none otherwise.
    #[default]
    Default,
    None,
    SelfAuth,
    Subject(String),
}

/// Data channel protection level (`PROT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protection {
    #[default]
    Clear,
    Safe,
    Confidential,
    Private,
}

impl Protection {
    pub fn code(self) -> char {
        match self {
            Protection::Clear => 'C',
            Protection::Safe => 'S',
            Protection::Confidential => 'E',
            Protection::Private => 'P',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    #[default]
    None,
    Fixed(u32),
}

/// Striping layout for extended-block transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    #[default]
    None,
    Partitioned,
    Blocked(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpBuffer {
    #[default]
    Default,
    Fixed(u64),
}

/// Credentials presented on the control channel.
#[derive(Clone, Default)]
pub struct AuthInfo {
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub account: Option<String>,
    pub subject: Option<String>,
}

impl AuthInfo {
    pub fn new(user: Option<&str>, password: Option<&str>) -> Self {
        AuthInfo {
            user: user.map(str::to_string),
            password: password.map(|p| SecretString::new(p.to_string())),
            account: None,
            subject: None,
        }
    }

    pub fn user_or_anonymous(&self) -> &str {
        self.user.as_deref().unwrap_or("anonymous")
    }

    pub fn password_or_empty(&self) -> &str {
        self.password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .unwrap_or("")
    }
}

impl PartialEq for AuthInfo {
    fn eq(&self, other: &Self) -> bool {
        let pw = |a: &AuthInfo| a.password.as_ref().map(|p| p.expose_secret().clone());
        self.user == other.user
            && pw(self) == pw(other)
            && self.account == other.account
            && self.subject == other.subject
    }
}

impl Eq for AuthInfo {}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("account", &self.account)
            .field("subject", &self.subject)
            .finish()
    }
}

/// Everything that shapes how one operation talks to one server.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationAttributes {
    pub mode: Mode,
    pub data_type: DataType,
    pub auth: AuthInfo,
    /// True until the caller supplies credentials of their own.
    pub using_default_auth: bool,
    pub dcau: Dcau,
    pub protection: Protection,
    pub parallelism: Parallelism,
    pub layout: Layout,
    pub tcp_buffer: TcpBuffer,
    /// ERET/ESTO module string, e.g. `P 100 100`.
    pub module_alg_str: Option<String>,
    pub allow_ipv6: bool,
    pub allocated_size: Option<u64>,
    pub append: bool,
}

impl Default for OperationAttributes {
    fn default() -> Self {
        OperationAttributes {
            mode: Mode::Stream,
            data_type: DataType::Image,
            auth: AuthInfo::default(),
            using_default_auth: true,
            dcau: Dcau::Default,
            protection: Protection::Clear,
            parallelism: Parallelism::None,
            layout: Layout::None,
            tcp_buffer: TcpBuffer::Default,
            module_alg_str: None,
            allow_ipv6: false,
            allocated_size: None,
            append: false,
        }
    }
}

impl OperationAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_authorization(&mut self, auth: AuthInfo) -> &mut Self {
        self.auth = auth;
        self.using_default_auth = false;
        self
    }

    pub fn set_mode(&mut self, mode: Mode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_type(&mut self, data_type: DataType) -> &mut Self {
        self.data_type = data_type;
        self
    }

    pub fn set_dcau(&mut self, dcau: Dcau) -> &mut Self {
        self.dcau = dcau;
        self
    }

    pub fn set_protection(&mut self, protection: Protection) -> &mut Self {
        self.protection = protection;
        self
    }

    pub fn set_parallelism(&mut self, parallelism: Parallelism) -> &mut Self {
        self.parallelism = parallelism;
        self
    }

    pub fn set_tcp_buffer(&mut self, tcp_buffer: TcpBuffer) -> &mut Self {
        self.tcp_buffer = tcp_buffer;
        self
    }

    pub fn set_allocated_size(&mut self, size: u64) -> &mut Self {
        self.allocated_size = Some(size);
        self
    }

    pub fn set_append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    /// Copy with DCAU forced to none. Used when a third-party transfer
    /// spans two URL schemes.
    pub fn without_dcau(&self) -> Self {
        let mut copy = self.clone();
        copy.dcau = Dcau::None;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let attr = OperationAttributes::default();
        assert_eq!(attr.mode, Mode::Stream);
        assert_eq!(attr.data_type, DataType::Image);
        assert!(attr.using_default_auth);
        assert_eq!(attr.dcau, Dcau::Default);
        assert_eq!(attr.protection.code(), 'C');
    }

    #[test]
    fn test_explicit_auth_clears_default_flag() {
        let mut attr = OperationAttributes::new();
        attr.set_authorization(AuthInfo::new(Some("alice"), Some("pw")));
        assert!(!attr.using_default_auth);
        assert_eq!(attr.auth.user_or_anonymous(), "alice");
        assert_eq!(attr.auth.password_or_empty(), "pw");
    }

    #[test]
    fn test_auth_equality_includes_password() {
        let a = AuthInfo::new(Some("u"), Some("one"));
        let b = AuthInfo::new(Some("u"), Some("one"));
        let c = AuthInfo::new(Some("u"), Some("two"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!format!("{:?}", a).contains("one"));
    }

    #[test]
    fn test_copy_is_independent() {
        let mut attr = OperationAttributes::new();
        attr.set_mode(Mode::ExtendedBlock);
        let copy = attr.clone();
        attr.set_mode(Mode::Stream);
        assert_eq!(copy.mode, Mode::ExtendedBlock);
        assert_eq!(copy.without_dcau().dcau, Dcau::None);
    }
}
