//! Tool invocations as ordered argument lists with tracked input/output
//! positions, so either file can be substituted in place.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical tool identity: a configuration-assigned id plus the on-disk
/// executable. Either part may be used to resolve the other.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolId {
    pub tool_id: String,
    pub executable: String,
}

impl ToolId {
    pub fn from_id(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            executable: String::new(),
        }
    }

    pub fn from_executable(executable: impl Into<String>) -> Self {
        Self {
            tool_id: String::new(),
            executable: executable.into(),
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tool_id.is_empty() {
            f.write_str(&self.executable)
        } else {
            f.write_str(&self.tool_id)
        }
    }
}

/// What a command line does once classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InvokeType {
    #[default]
    Unknown,
    Preprocess,
    Compile,
}

/// A parsed tool command line.
///
/// `input_index`/`output_index` point into `args` at the source and object
/// positions; `-1` means the position is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolCommandline {
    pub id: ToolId,
    pub invoke_type: InvokeType,
    pub args: Vec<String>,
    pub input_index: i32,
    pub output_index: i32,
    pub ignored_args: BTreeSet<String>,
}

impl ToolCommandline {
    pub fn new(id: ToolId, args: Vec<String>) -> Self {
        Self {
            id,
            invoke_type: InvokeType::Unknown,
            args,
            input_index: -1,
            output_index: -1,
            ignored_args: BTreeSet::new(),
        }
    }

    fn arg_at(&self, index: i32) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.args.get(i))
            .map(String::as_str)
    }

    /// The input (source) argument, if known.
    pub fn input(&self) -> Option<&str> {
        self.arg_at(self.input_index)
    }

    /// The output (object) argument, if known.
    pub fn output(&self) -> Option<&str> {
        self.arg_at(self.output_index)
    }

    /// Replace the input argument in place. No-op when the position is
    /// unknown.
    pub fn set_input(&mut self, path: impl Into<String>) {
        if let Ok(i) = usize::try_from(self.input_index) {
            if i < self.args.len() {
                self.args[i] = path.into();
            }
        }
    }

    /// Replace the output argument in place. No-op when the position is
    /// unknown.
    pub fn set_output(&mut self, path: impl Into<String>) {
        if let Ok(i) = usize::try_from(self.output_index) {
            if i < self.args.len() {
                self.args[i] = path.into();
            }
        }
    }

    /// Arguments joined for logging and subprocess spawning.
    pub fn args_string(&self) -> String {
        self.args.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcc_compile() -> ToolCommandline {
        let mut inv = ToolCommandline::new(
            ToolId::from_id("gcc9"),
            vec![
                "-c".into(),
                "main.cpp".into(),
                "-o".into(),
                "main.o".into(),
            ],
        );
        inv.invoke_type = InvokeType::Compile;
        inv.input_index = 1;
        inv.output_index = 3;
        inv
    }

    #[test]
    fn input_output_accessors_follow_indexes() {
        let inv = gcc_compile();
        assert_eq!(inv.input(), Some("main.cpp"));
        assert_eq!(inv.output(), Some("main.o"));
    }

    #[test]
    fn in_place_substitution() {
        let mut inv = gcc_compile();
        inv.set_input("/tmp/42_main.cpp");
        inv.set_output("/tmp/42_main.o");
        assert_eq!(inv.args[1], "/tmp/42_main.cpp");
        assert_eq!(inv.args[3], "/tmp/42_main.o");
    }

    #[test]
    fn unknown_positions_are_inert() {
        let mut inv = ToolCommandline::new(ToolId::from_id("gcc9"), vec!["--help".into()]);
        assert_eq!(inv.input(), None);
        assert_eq!(inv.output(), None);
        inv.set_input("ignored");
        inv.set_output("ignored");
        assert_eq!(inv.args, vec!["--help".to_string()]);
    }
}
