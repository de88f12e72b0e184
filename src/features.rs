//! Server feature table, filled from `SITE HELP` and `FEAT` replies.

use crate::reply::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    #[default]
    Unknown,
    True,
    False,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    RestStream,
    Parallel,
    Dcau,
    Eret,
    Esto,
    Sbuf,
    Abuf,
    SiteBufsize,
    Size,
    Mdtm,
    Mlst,
    Mlsd,
    Cksm,
    Chmod,
    Spas,
    Spor,
    Pbsz,
    Prot,
}

impl Feature {
    pub const ALL: [Feature; 18] = [
        Feature::RestStream,
        Feature::Parallel,
        Feature::Dcau,
        Feature::Eret,
        Feature::Esto,
        Feature::Sbuf,
        Feature::Abuf,
        Feature::SiteBufsize,
        Feature::Size,
        Feature::Mdtm,
        Feature::Mlst,
        Feature::Mlsd,
        Feature::Cksm,
        Feature::Chmod,
        Feature::Spas,
        Feature::Spor,
        Feature::Pbsz,
        Feature::Prot,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn from_token(token: &str) -> Option<Feature> {
        let f = match token {
            "PARALLEL" => Feature::Parallel,
            "DCAU" => Feature::Dcau,
            "ERET" => Feature::Eret,
            "ESTO" => Feature::Esto,
            "SBUF" => Feature::Sbuf,
            "ABUF" => Feature::Abuf,
            "BUFSIZE" | "RETRBUFSIZE" => Feature::SiteBufsize,
            "SIZE" => Feature::Size,
            "MDTM" => Feature::Mdtm,
            "MLST" => Feature::Mlst,
            "MLSD" => Feature::Mlsd,
            "CKSM" => Feature::Cksm,
            "CHMOD" => Feature::Chmod,
            "SPAS" => Feature::Spas,
            "SPOR" => Feature::Spor,
            "PBSZ" => Feature::Pbsz,
            "PROT" => Feature::Prot,
            _ => return None,
        };
        Some(f)
    }
}

/// What a server is known to support.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Features {
    table: [Tristate; 18],
    pub probed: bool,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feature: Feature) -> Tristate {
        self.table[feature.index()]
    }

    pub fn set(&mut self, feature: Feature, value: Tristate) {
        self.table[feature.index()] = value;
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.get(feature) == Tristate::True
    }

    /// Anything not ruled out explicitly might still work.
    pub fn may_support(&self, feature: Feature) -> bool {
        self.get(feature) != Tristate::False
    }

    /// Marks every command listed in a `214` SITE HELP reply.
    pub fn parse_site_help(&mut self, reply: &Reply) {
        if !reply.is_completion() {
            return;
        }
        for line in reply.lines() {
            for token in line.split_whitespace() {
                if let Some(f) = Feature::from_token(&token.to_ascii_uppercase()) {
                    self.set(f, Tristate::True);
                }
            }
        }
    }

    /// Reads a `211` FEAT reply. Features still unknown afterwards are
    /// recorded as unsupported.
    pub fn parse_feat(&mut self, reply: &Reply) {
        if !reply.is_completion() {
            return;
        }
        for line in reply.text.lines().skip(1) {
            if !line.starts_with(' ') {
                continue;
            }
            let line = line.trim().to_ascii_uppercase();
            let mut words = line.split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };
            if first == "REST" {
                if words.next() == Some("STREAM") {
                    self.set(Feature::RestStream, Tristate::True);
                }
                continue;
            }
            let name = first.split(';').next().unwrap_or(first);
            if let Some(f) = Feature::from_token(name) {
                self.set(f, Tristate::True);
            }
        }
        for f in Feature::ALL {
            if self.get(f) == Tristate::Unknown {
                self.set(f, Tristate::False);
            }
        }
        self.probed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_help_marks_commands() {
        let mut features = Features::new();
        let reply = Reply::new(
            214,
            "214-The following commands are recognized:\n    ALLO ESTO RNFR\n    DCAU PBSZ\n214 End",
        );
        features.parse_site_help(&reply);
        assert!(features.supports(Feature::Esto));
        assert!(features.supports(Feature::Dcau));
        assert_eq!(features.get(Feature::Eret), Tristate::Unknown);
    }

    #[test]
    fn test_feat_fills_unknown_as_false() {
        let mut features = Features::new();
        let reply = Reply::new(
            211,
            "211-Extensions supported:\n MDTM\n SIZE\n REST STREAM\n MLST type*;size*;\n PARALLEL\n211 END",
        );
        features.parse_feat(&reply);
        assert!(features.supports(Feature::Mdtm));
        assert!(features.supports(Feature::Size));
        assert!(features.supports(Feature::RestStream));
        assert!(features.supports(Feature::Mlst));
        assert!(features.supports(Feature::Parallel));
        assert_eq!(features.get(Feature::Dcau), Tristate::False);
        assert!(!features.may_support(Feature::Cksm));
        assert!(features.probed);
    }

    #[test]
    fn test_failed_feat_leaves_table_alone() {
        let mut features = Features::new();
        features.parse_feat(&Reply::new(500, "500 Unknown command"));
        assert_eq!(features.get(Feature::Size), Tristate::Unknown);
        assert!(features.may_support(Feature::Size));
        assert!(!features.probed);
    }
}
