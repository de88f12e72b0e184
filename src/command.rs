//! Control-channel commands the engine sends.

use std::fmt;

use crate::attr::{DataType, Dcau, Mode, Protection};
use crate::restart_marker::RestartMarker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Noop,
    Quit,
    SiteHelp,
    Feat,
    Type(DataType),
    Mode(Mode),
    Dcau(Dcau),
    Pbsz(u64),
    Prot(Protection),
    Sbuf(u64),
    SiteBufsize(u64),
    OptsRetr(String),
    Pasv,
    Port(String),
    Rest(RestartMarker),
    Allo(u64),
    Retr(String),
    Eret { alg: String, path: String },
    Stor(String),
    Appe(String),
    Esto { alg: String, path: String },
    List(String),
    Nlst(String),
    Mlsd(String),
    Mlst(String),
    Stat(String),
    Size(String),
    Mdtm(String),
    Cksm {
        algorithm: String,
        offset: u64,
        length: i64,
        path: String,
    },
    Dele(String),
    Mkd(String),
    Rmd(String),
    Cwd(String),
    Rnfr(String),
    Rnto(String),
    Chmod { mode: u32, path: String },
}

impl Command {
    /// Whether this command opens a data transfer on the control channel.
    pub fn moves_data(&self) -> bool {
        matches!(
            self,
            Command::Retr(_)
                | Command::Eret { .. }
                | Command::Stor(_)
                | Command::Appe(_)
                | Command::Esto { .. }
                | Command::List(_)
                | Command::Nlst(_)
                | Command::Mlsd(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Noop => f.write_str("NOOP"),
            Command::Quit => f.write_str("QUIT"),
            Command::SiteHelp => f.write_str("SITE HELP"),
            Command::Feat => f.write_str("FEAT"),
            Command::Type(t) => write!(f, "TYPE {}", t.code()),
            Command::Mode(m) => write!(f, "MODE {}", m.code()),
            Command::Dcau(d) => match d {
                Dcau::None => f.write_str("DCAU N"),
                Dcau::SelfAuth | Dcau::Default => f.write_str("DCAU A"),
                Dcau::Subject(s) => write!(f, "DCAU S {}", s),
            },
            Command::Pbsz(n) => write!(f, "PBSZ {}", n),
            Command::Prot(p) => write!(f, "PROT {}", p.code()),
            Command::Sbuf(n) => write!(f, "SBUF {}", n),
            Command::SiteBufsize(n) => write!(f, "SITE BUFSIZE {}", n),
            Command::OptsRetr(opts) => write!(f, "OPTS RETR {}", opts),
            Command::Pasv => f.write_str("PASV"),
            Command::Port(hp) => write!(f, "PORT {}", hp),
            Command::Rest(marker) => write!(f, "REST {}", marker),
            Command::Allo(n) => write!(f, "ALLO {}", n),
            Command::Retr(p) => write!(f, "RETR {}", p),
            Command::Eret { alg, path } => write!(f, "ERET {} {}", alg, path),
            Command::Stor(p) => write!(f, "STOR {}", p),
            Command::Appe(p) => write!(f, "APPE {}", p),
            Command::Esto { alg, path } => write!(f, "ESTO {} {}", alg, path),
            Command::List(p) => write!(f, "LIST {}", p),
            Command::Nlst(p) => write!(f, "NLST {}", p),
            Command::Mlsd(p) => write!(f, "MLSD {}", p),
            Command::Mlst(p) => write!(f, "MLST {}", p),
            Command::Stat(p) => write!(f, "STAT {}", p),
            Command::Size(p) => write!(f, "SIZE {}", p),
            Command::Mdtm(p) => write!(f, "MDTM {}", p),
            Command::Cksm {
                algorithm,
                offset,
                length,
                path,
            } => write!(f, "CKSM {} {} {} {}", algorithm, offset, length, path),
            Command::Dele(p) => write!(f, "DELE {}", p),
            Command::Mkd(p) => write!(f, "MKD {}", p),
            Command::Rmd(p) => write!(f, "RMD {}", p),
            Command::Cwd(p) => write!(f, "CWD {}", p),
            Command::Rnfr(p) => write!(f, "RNFR {}", p),
            Command::Rnto(p) => write!(f, "RNTO {}", p),
            Command::Chmod { mode, path } => write!(f, "SITE CHMOD {:o} {}", mode, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_forms() {
        assert_eq!(Command::Type(DataType::Image).to_string(), "TYPE I");
        assert_eq!(Command::Mode(Mode::ExtendedBlock).to_string(), "MODE E");
        assert_eq!(Command::Dcau(Dcau::None).to_string(), "DCAU N");
        assert_eq!(
            Command::Dcau(Dcau::Subject("/O=Grid/CN=x".into())).to_string(),
            "DCAU S /O=Grid/CN=x"
        );
        assert_eq!(
            Command::Eret {
                alg: "P 100 100".into(),
                path: "/a/b".into()
            }
            .to_string(),
            "ERET P 100 100 /a/b"
        );
        assert_eq!(
            Command::Chmod {
                mode: 0o755,
                path: "/x".into()
            }
            .to_string(),
            "SITE CHMOD 755 /x"
        );
        let mut marker = RestartMarker::new();
        marker.insert_range(0, 100).unwrap();
        assert_eq!(Command::Rest(marker).to_string(), "REST 0-100");
    }

    #[test]
    fn test_data_commands() {
        assert!(Command::Retr("/f".into()).moves_data());
        assert!(Command::Mlsd("/".into()).moves_data());
        assert!(!Command::Mlst("/".into()).moves_data());
        assert!(!Command::Pasv.moves_data());
    }
}
