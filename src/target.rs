//! One control connection and the per-connection state machine data.
//!
//! A target remembers what it has already negotiated with its server so a
//! cached connection only sends the settings that changed. The work left
//! for the current operation is a queue of `Step`s built when the target
//! reaches setup; the handle's reply machine pops them one at a time.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::attr::{AuthInfo, DataType, Dcau, Mode, OperationAttributes, Parallelism, Protection, TcpBuffer};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::control::ControlConnection;
use crate::features::{Feature, Features};
use crate::handle::Operation;
use crate::plugin::CommandMask;
use crate::restart_marker::RestartMarker;
use crate::url::{FtpUrl, Scheme};

static NEXT_TARGET: AtomicU64 = AtomicU64::new(1);

/// Protection buffer size announced with `PBSZ`.
pub const PBSZ_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

impl TargetId {
    fn next() -> TargetId {
        TargetId(NEXT_TARGET.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Start,
    Connect,
    Authenticate,
    SiteHelp,
    Feat,
    /// Idle and connected; the next operation can start from here.
    SetupConnection,
    Noop,
    Type,
    Mode,
    Bufsize,
    RetrOpts,
    Dcau,
    Pbsz,
    Prot,
    Pasv,
    Port,
    Allo,
    Rest,
    Rnfr,
    /// Third-party destination parked until the source is set up.
    Waiting,
    ReadyForData,
    NeedComplete,
    CompletedOperation,
    Fault,
    Closed,
}

impl TargetState {
    /// States in which no command is outstanding on the connection.
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            TargetState::Start
                | TargetState::SetupConnection
                | TargetState::CompletedOperation
                | TargetState::Closed
        )
    }
}

/// Session parameters already accepted by the server. `None` means the
/// server default is in effect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSettings {
    pub data_type: Option<DataType>,
    pub mode: Option<Mode>,
    pub tcp_buffer: Option<TcpBuffer>,
    pub parallelism: Option<Parallelism>,
    pub dcau: Option<Dcau>,
    pub pbsz: Option<u64>,
    pub protection: Option<Protection>,
}

/// One negotiable parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    Type(DataType),
    Mode(Mode),
    Sbuf(u64),
    SiteBufsize(u64),
    Parallelism(u32),
    Dcau(Dcau),
    Pbsz(u64),
    Prot(Protection),
}

impl Setting {
    pub fn command(&self) -> Command {
        match self {
            Setting::Type(t) => Command::Type(*t),
            Setting::Mode(m) => Command::Mode(*m),
            Setting::Sbuf(n) => Command::Sbuf(*n),
            Setting::SiteBufsize(n) => Command::SiteBufsize(*n),
            Setting::Parallelism(n) => {
                Command::OptsRetr(format!("Parallelism={},{},{};", n, n, n))
            }
            Setting::Dcau(d) => Command::Dcau(d.clone()),
            Setting::Pbsz(n) => Command::Pbsz(*n),
            Setting::Prot(p) => Command::Prot(*p),
        }
    }

    pub fn state(&self) -> TargetState {
        match self {
            Setting::Type(_) => TargetState::Type,
            Setting::Mode(_) => TargetState::Mode,
            Setting::Sbuf(_) | Setting::SiteBufsize(_) => TargetState::Bufsize,
            Setting::Parallelism(_) => TargetState::RetrOpts,
            Setting::Dcau(_) => TargetState::Dcau,
            Setting::Pbsz(_) => TargetState::Pbsz,
            Setting::Prot(_) => TargetState::Prot,
        }
    }

    pub fn record(&self, current: &mut SessionSettings) {
        match self {
            Setting::Type(t) => current.data_type = Some(*t),
            Setting::Mode(m) => current.mode = Some(*m),
            Setting::Sbuf(n) | Setting::SiteBufsize(n) => {
                current.tcp_buffer = Some(TcpBuffer::Fixed(*n))
            }
            Setting::Parallelism(n) => current.parallelism = Some(Parallelism::Fixed(*n)),
            Setting::Dcau(d) => current.dcau = Some(d.clone()),
            Setting::Pbsz(n) => current.pbsz = Some(*n),
            Setting::Prot(p) => current.protection = Some(*p),
        }
    }
}

/// Remaining work of the current operation on one target.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Negotiate(Setting),
    Pasv,
    /// `PORT` to the address the destination returned from `PASV`.
    Port,
    Allo(u64),
    Rest(RestartMarker),
    Rnfr(String),
    /// The operation's own command.
    Verb,
    /// Third-party destination: park and let the source set up.
    HandOff,
    /// Third-party source: start both sides of the transfer.
    StartThirdParty,
}

impl Step {
    pub fn state(&self) -> TargetState {
        match self {
            Step::Negotiate(s) => s.state(),
            Step::Pasv => TargetState::Pasv,
            Step::Port => TargetState::Port,
            Step::Allo(_) => TargetState::Allo,
            Step::Rest(_) => TargetState::Rest,
            Step::Rnfr(_) => TargetState::Rnfr,
            Step::Verb => TargetState::NeedComplete,
            Step::HandOff => TargetState::Waiting,
            Step::StartThirdParty => TargetState::ReadyForData,
        }
    }

    pub fn mask(&self) -> CommandMask {
        match self {
            Step::Negotiate(Setting::Sbuf(_) | Setting::SiteBufsize(_)) => CommandMask::BUFFER,
            Step::Negotiate(Setting::Pbsz(_) | Setting::Prot(_) | Setting::Dcau(_)) => {
                CommandMask::MISC
            }
            Step::Negotiate(_) => CommandMask::TRANSFER_PARAMETERS,
            Step::Pasv | Step::Port => CommandMask::DATA_ESTABLISHMENT,
            Step::Allo(_) | Step::Rest(_) => CommandMask::TRANSFER_MODIFIERS,
            Step::Rnfr(_) | Step::Verb | Step::HandOff | Step::StartThirdParty => {
                CommandMask::FILE_ACTIONS
            }
        }
    }

    /// Whether the step is answered with a 3yz "send more" reply.
    pub fn expects_intermediate(&self) -> bool {
        matches!(self, Step::Rest(_) | Step::Rnfr(_))
    }
}

/// Which target pair last ran a data transfer on a connection, and as
/// what operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedDataConn {
    pub source: Option<TargetId>,
    pub dest: Option<TargetId>,
    pub operation: Operation,
}

impl Default for CachedDataConn {
    fn default() -> Self {
        CachedDataConn {
            source: None,
            dest: None,
            operation: Operation::Idle,
        }
    }
}

/// Credentials a target for `url` logs in with under `attr`.
pub fn effective_auth(url: &FtpUrl, attr: &OperationAttributes, config: &EngineConfig) -> AuthInfo {
    if !attr.using_default_auth {
        return attr.auth.clone();
    }
    match url.scheme {
        Scheme::Gsiftp => {
            let mut auth = config.default_auth();
            if let Some(user) = &url.user {
                auth.user = Some(user.clone());
            }
            auth
        }
        Scheme::Ftp | Scheme::Sshftp => AuthInfo::new(url.user.as_deref(), url.password.as_deref()),
    }
}

pub struct Target {
    pub id: TargetId,
    pub url: FtpUrl,
    pub attr: OperationAttributes,
    pub state: TargetState,
    pub control: Option<Arc<dyn ControlConnection>>,
    pub features: Features,
    pub current: SessionSettings,
    pub cached_data_conn: CachedDataConn,
    /// Class of the command in flight, tagged on plugin events.
    pub mask: CommandMask,
    pub last_access: Instant,
    pub plan: VecDeque<Step>,
    /// Step whose reply is outstanding.
    pub pending: Option<Step>,
    /// Address from the last `PASV` reply.
    pub pasv_addr: Option<SocketAddr>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("url", &self.url.to_string())
            .field("state", &self.state)
            .field("connected", &self.control.is_some())
            .finish()
    }
}

impl Target {
    pub fn new(url: &FtpUrl, attr: Option<&OperationAttributes>, config: &EngineConfig) -> Target {
        let mut target = Target {
            id: TargetId::next(),
            url: url.clone(),
            attr: attr.cloned().unwrap_or_default(),
            state: TargetState::Start,
            control: None,
            features: Features::new(),
            current: SessionSettings::default(),
            cached_data_conn: CachedDataConn::default(),
            mask: CommandMask::NONE,
            last_access: Instant::now(),
            plan: VecDeque::new(),
            pending: None,
            pasv_addr: None,
        };
        target.override_attr(config);
        target
    }

    /// Takes a fresh copy of the caller's attributes for a new operation.
    pub fn set_attr(&mut self, attr: Option<&OperationAttributes>, config: &EngineConfig) {
        self.attr = attr.cloned().unwrap_or_default();
        self.override_attr(config);
    }

    /// Adjusts the copied attributes to what the URL scheme allows.
    ///
    /// Only gsiftp carries a delegated security context, so other schemes
    /// never authenticate the data channel. Default credentials come from
    /// the URL for plain schemes and from the engine config for gsiftp.
    pub fn override_attr(&mut self, config: &EngineConfig) {
        if self.url.scheme != Scheme::Gsiftp {
            self.attr.dcau = Dcau::None;
        }
        self.attr.auth = effective_auth(&self.url, &self.attr, config);
    }

    /// Parameters whose negotiated value differs from what this operation
    /// needs, in the order they are sent.
    ///
    /// `retrieving` is true when this target sends the data of an
    /// extended-block retrieve (the only case `OPTS RETR` applies to).
    pub fn negotiation(&self, retrieving: bool) -> Vec<Setting> {
        let attr = &self.attr;
        let current = &self.current;
        let mut out = Vec::new();
        if current.data_type != Some(attr.data_type) {
            out.push(Setting::Type(attr.data_type));
        }
        if current.mode != Some(attr.mode) {
            out.push(Setting::Mode(attr.mode));
        }
        if let TcpBuffer::Fixed(n) = attr.tcp_buffer {
            if current.tcp_buffer != Some(attr.tcp_buffer) {
                if self.features.may_support(Feature::Sbuf) {
                    out.push(Setting::Sbuf(n));
                } else {
                    out.push(Setting::SiteBufsize(n));
                }
            }
        }
        if retrieving && attr.mode == Mode::ExtendedBlock {
            if let Parallelism::Fixed(n) = attr.parallelism {
                if current.parallelism != Some(attr.parallelism) {
                    out.push(Setting::Parallelism(n));
                }
            }
        }
        if attr.dcau != Dcau::Default
            && self.features.supports(Feature::Dcau)
            && current.dcau.as_ref() != Some(&attr.dcau)
        {
            out.push(Setting::Dcau(attr.dcau.clone()));
        }
        let protection = current.protection.unwrap_or(Protection::Clear);
        if attr.protection != protection {
            if attr.protection != Protection::Clear && current.pbsz.is_none() {
                out.push(Setting::Pbsz(PBSZ_SIZE));
            }
            out.push(Setting::Prot(attr.protection));
        }
        out
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::Reply;

    fn target(url: &str, attr: Option<&OperationAttributes>) -> Target {
        Target::new(&FtpUrl::parse(url).unwrap(), attr, &EngineConfig::default())
    }

    #[test]
    fn test_ids_are_unique() {
        let a = target("ftp://h/x", None);
        let b = target("ftp://h/x", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_plain_ftp_drops_dcau_and_uses_url_credentials() {
        let mut attr = OperationAttributes::new();
        attr.set_dcau(Dcau::SelfAuth);
        let t = target("ftp://bob:pw@h/x", Some(&attr));
        assert_eq!(t.attr.dcau, Dcau::None);
        assert_eq!(t.attr.auth.user_or_anonymous(), "bob");
        assert_eq!(t.attr.auth.password_or_empty(), "pw");
    }

    #[test]
    fn test_gsiftp_default_auth_comes_from_config() {
        let t = target("gsiftp://h/x", None);
        assert_eq!(t.attr.auth, EngineConfig::default().default_auth());
        assert_eq!(t.attr.dcau, Dcau::Default);

        let mut attr = OperationAttributes::new();
        attr.set_authorization(AuthInfo::new(Some("carol"), None));
        let t = target("gsiftp://h/x", Some(&attr));
        assert_eq!(t.attr.auth.user_or_anonymous(), "carol");
    }

    #[test]
    fn test_negotiation_only_sends_differences() {
        let mut attr = OperationAttributes::new();
        attr.set_mode(Mode::ExtendedBlock)
            .set_parallelism(Parallelism::Fixed(4))
            .set_protection(Protection::Private)
            .set_tcp_buffer(TcpBuffer::Fixed(65536));
        let mut t = target("gsiftp://h/x", Some(&attr));
        let plan = t.negotiation(true);
        assert_eq!(
            plan,
            vec![
                Setting::Type(DataType::Image),
                Setting::Mode(Mode::ExtendedBlock),
                Setting::Sbuf(65536),
                Setting::Parallelism(4),
                Setting::Pbsz(PBSZ_SIZE),
                Setting::Prot(Protection::Private),
            ]
        );
        for s in &plan {
            s.record(&mut t.current);
        }
        assert!(t.negotiation(true).is_empty());

        t.attr.set_mode(Mode::Stream);
        assert_eq!(t.negotiation(false), vec![Setting::Mode(Mode::Stream)]);
    }

    #[test]
    fn test_dcau_needs_advertised_support() {
        let mut attr = OperationAttributes::new();
        attr.set_dcau(Dcau::SelfAuth);
        let mut t = target("gsiftp://h/x", Some(&attr));
        assert!(!t.negotiation(false).contains(&Setting::Dcau(Dcau::SelfAuth)));
        t.features
            .parse_feat(&Reply::new(211, "211-Features:\n DCAU\n211 End"));
        assert!(t.negotiation(false).contains(&Setting::Dcau(Dcau::SelfAuth)));
    }

    #[test]
    fn test_setting_wire_forms() {
        assert_eq!(
            Setting::Parallelism(3).command().to_string(),
            "OPTS RETR Parallelism=3,3,3;"
        );
        assert_eq!(Step::Rest(RestartMarker::new()).state(), TargetState::Rest);
        assert!(Step::Rnfr("/a".into()).expects_intermediate());
        assert!(!Step::Pasv.expects_intermediate());
    }
}
