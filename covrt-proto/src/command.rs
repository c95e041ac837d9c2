//! Registry of supported control commands.

use crate::{Error, Request, Result};

/// Numeric identity of a control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CommandId {
    /// `test.ping`: server sleeps, then echoes the delay.
    Ping,
    /// `coverage.get`: download a coverage snapshot.
    GetCoverage,
    /// `coverage.dump`: persist coverage on the server side.
    DumpCoverage,
    /// `coverage.reset`: zero all collected hit flags.
    ResetCoverage,
}

impl CommandId {
    /// Wire code of this command.
    pub const fn code(self) -> u8 {
        match self {
            Self::Ping => 0,
            Self::GetCoverage => 1,
            Self::DumpCoverage => 2,
            Self::ResetCoverage => 3,
        }
    }

    /// Maps a wire code back to a command.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ping),
            1 => Some(Self::GetCoverage),
            2 => Some(Self::DumpCoverage),
            3 => Some(Self::ResetCoverage),
            _ => None,
        }
    }

    /// Static descriptor for this command.
    pub const fn descriptor(self) -> &'static CommandDescriptor {
        &COMMANDS[self.code() as usize]
    }
}

/// How a command fills absent argument slots on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Defaults {
    /// Nothing to fill.
    None,
    /// Path and merge flag from client settings; stop flag defaults on.
    Local,
    /// Path and merge flag left to the server; stop flag defaults on.
    Remote,
}

/// Name, code, arity, and usage of one control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Command identity.
    pub id: CommandId,
    /// User-facing name, e.g. `coverage.get`.
    pub name: &'static str,
    /// Exact number of argument slots on the wire.
    pub arity: usize,
    /// One-line usage.
    pub usage: &'static str,
    /// Default population rule.
    defaults: Defaults,
}

/// All supported commands, indexed by wire code.
pub const COMMANDS: [CommandDescriptor; 4] = [
    CommandDescriptor {
        id: CommandId::Ping,
        name: "test.ping",
        arity: 1,
        usage: "test.ping, <delay>",
        defaults: Defaults::None,
    },
    CommandDescriptor {
        id: CommandId::GetCoverage,
        name: "coverage.get",
        arity: 3,
        usage: "coverage.get, [<local pathname>], [yes|no], [yes|no]",
        defaults: Defaults::Local,
    },
    CommandDescriptor {
        id: CommandId::DumpCoverage,
        name: "coverage.dump",
        arity: 3,
        usage: "coverage.dump, [<remote pathname>], [yes|no], [yes|no]",
        defaults: Defaults::Remote,
    },
    CommandDescriptor {
        id: CommandId::ResetCoverage,
        name: "coverage.reset",
        arity: 0,
        usage: "coverage.reset",
        defaults: Defaults::None,
    },
];

/// Client-side values used to fill absent `coverage.get` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDefaults {
    /// Local file the downloaded snapshot is persisted to.
    pub out_file: String,
    /// Whether to merge into an existing local file.
    pub merge: bool,
}

impl CommandDescriptor {
    /// Finds the descriptor registered under `name`.
    pub fn lookup(name: &str) -> Result<&'static Self> {
        COMMANDS
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::UnknownCommand(name.to_owned()))
    }

    /// Builds a request, padding missing trailing slots with `None`.
    pub fn request(&self, mut args: Vec<Option<String>>) -> Result<Request> {
        if args.len() > self.arity {
            return Err(Error::TooManyArguments {
                name: self.name,
                given: args.len(),
                usage: self.usage,
            });
        }
        args.resize(self.arity, None);
        Ok(Request::new(self.id.code(), args))
    }

    /// Fills absent slots of `request` and normalizes boolean flags to
    /// `"true"`/`"false"`.
    pub fn populate_defaults(&self, request: &mut Request, defaults: &ClientDefaults) {
        let args = request.args_mut();
        match self.defaults {
            Defaults::None => {}
            Defaults::Local => {
                if let Some(slot) = args.get_mut(0)
                    && slot.is_none()
                {
                    *slot = Some(defaults.out_file.clone());
                }
                if let Some(slot) = args.get_mut(1) {
                    let merge = slot.as_deref().map_or(defaults.merge, parse_bool);
                    *slot = Some(bool_str(merge).to_owned());
                }
                normalize_flag(args.get_mut(2));
            }
            Defaults::Remote => normalize_flag(args.get_mut(2)),
        }
    }
}

/// Sets an absent flag to `true` and normalizes a present one.
fn normalize_flag(slot: Option<&mut Option<String>>) {
    if let Some(slot) = slot {
        let on = slot.as_deref().is_none_or(parse_bool);
        *slot = Some(bool_str(on).to_owned());
    }
}

const fn bool_str(b: bool) -> &'static str {
    if b { "true" } else { "false" }
}

/// Parses a loose boolean: `true`, `yes`, `on` and `1` (any case) are true,
/// everything else is false.
pub fn parse_bool(s: &str) -> bool {
    let s = s.trim();
    ["true", "yes", "on", "1"]
        .iter()
        .any(|t| s.eq_ignore_ascii_case(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ClientDefaults {
        ClientDefaults {
            out_file: "coverage.ec".into(),
            merge: true,
        }
    }

    #[test]
    fn codes_match_table_order() {
        for (i, d) in COMMANDS.iter().enumerate() {
            assert_eq!(usize::from(d.id.code()), i);
            assert_eq!(CommandId::from_code(d.id.code()), Some(d.id));
        }
        assert_eq!(CommandId::from_code(4), None);
    }

    #[test]
    fn unknown_name_is_usage_error() {
        let err = CommandDescriptor::lookup("bogus").unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn excess_args_are_usage_error() {
        let reset = CommandDescriptor::lookup("coverage.reset").unwrap();
        let err = reset.request(vec![Some("x".into())]).unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("coverage.reset"));
    }

    #[test]
    fn request_pads_to_arity() {
        let get = CommandDescriptor::lookup("coverage.get").unwrap();
        let req = get.request(vec![Some("a".into())]).unwrap();
        assert_eq!(req.id(), 1);
        assert_eq!(req.args(), &[Some("a".to_owned()), None, None]);
    }

    #[test]
    fn get_fills_client_defaults() {
        let get = CommandDescriptor::lookup("coverage.get").unwrap();
        let mut req = get.request(vec![None, Some("NO".into())]).unwrap();
        get.populate_defaults(&mut req, &defaults());
        assert_eq!(req.arg(0), Some("coverage.ec"));
        assert_eq!(req.arg(1), Some("false"));
        assert_eq!(req.arg(2), Some("true"));
    }

    #[test]
    fn dump_leaves_path_and_merge_to_server() {
        let dump = CommandDescriptor::lookup("coverage.dump").unwrap();
        let mut req = dump.request(vec![None, None, Some("off".into())]).unwrap();
        dump.populate_defaults(&mut req, &defaults());
        assert_eq!(req.arg(0), None);
        assert_eq!(req.arg(1), None);
        assert_eq!(req.arg(2), Some("false"));
    }

    #[test]
    fn parse_bool_accepts_loose_forms() {
        for s in ["true", "YES", "On", " 1 "] {
            assert!(parse_bool(s), "{s}");
        }
        for s in ["false", "no", "", "2"] {
            assert!(!parse_bool(s), "{s}");
        }
    }
}
