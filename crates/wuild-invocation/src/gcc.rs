//! GCC / Clang command-line dialect.

use wuild_core::{InvokeType, ToolCommandline, WuildError, WuildResult};

use crate::parser::{CommandLineParser, ParseOptions, ProcessedInvocation};

/// Flags whose value arrives as the following argument.
const VALUE_FLAGS: &[&str] = &[
    "-I", "-D", "-U", "-x", "-include", "-isystem", "-iquote", "-MF", "-MT", "-MQ",
];

/// Dependency-emission flags without a value.
const DEP_FLAGS: &[&str] = &["-M", "-MM", "-MD", "-MMD", "-MG", "-MP"];

/// Dependency-emission flags with a value.
const DEP_VALUE_FLAGS: &[&str] = &["-MF", "-MT", "-MQ"];

/// Preprocessor-input flags with a value.
const PREPROCESSOR_VALUE_FLAGS: &[&str] = &["-I", "-D", "-U", "-include", "-isystem", "-iquote"];

#[derive(Default)]
pub struct GccCommandLineParser;

struct Scan {
    invoke_flag_index: Option<usize>,
    remote_possible: bool,
}

impl GccCommandLineParser {
    /// Classify and index the argument list in place.
    fn scan(&self, inv: &mut ToolCommandline) -> WuildResult<Scan> {
        inv.invoke_type = InvokeType::Unknown;
        inv.input_index = -1;
        inv.output_index = -1;
        let mut scan = Scan {
            invoke_flag_index: None,
            remote_possible: true,
        };

        #[derive(PartialEq)]
        enum NextArg {
            Output,
            Value,
        }
        let mut pending: Option<NextArg> = None;

        for (index, arg) in inv.args.iter().enumerate() {
            if let Some(role) = pending.take() {
                if role == NextArg::Output {
                    inv.output_index = index as i32;
                }
                continue;
            }
            match arg.as_str() {
                "-c" => {
                    inv.invoke_type = InvokeType::Compile;
                    scan.invoke_flag_index = Some(index);
                }
                "-E" => {
                    inv.invoke_type = InvokeType::Preprocess;
                    scan.invoke_flag_index = Some(index);
                }
                "-o" => pending = Some(NextArg::Output),
                flag if VALUE_FLAGS.contains(&flag) => pending = Some(NextArg::Value),
                other => {
                    if other.starts_with('@') || other.starts_with("-specs=") {
                        // Response files and spec overrides reference
                        // local paths the remote peer cannot see.
                        scan.remote_possible = false;
                    } else if other.starts_with('-') {
                        // A flag carrying an absolute path (profile data,
                        // sanitizer lists, ...) pins the command to this
                        // machine. -I/-D/-U values are fine: they only
                        // feed the local preprocess stage.
                        let preprocessor_attached = other.starts_with("-I")
                            || other.starts_with("-D")
                            || other.starts_with("-U");
                        if !preprocessor_attached
                            && (other.contains("=/") || other.contains(":\\"))
                        {
                            scan.remote_possible = false;
                        }
                    } else if inv.ignored_args.contains(other) {
                        // Explicitly ignored positional.
                    } else if inv.input_index != -1 {
                        return Err(WuildError::invocation(format!(
                            "more than one input file: '{}' and '{}'",
                            inv.args[inv.input_index as usize], other
                        )));
                    } else {
                        inv.input_index = index as i32;
                    }
                }
            }
        }
        Ok(scan)
    }

    fn retain_rebuilding(inv: &mut ToolCommandline, mut keep: impl FnMut(&str, Option<&str>) -> Keep) {
        let mut result = Vec::with_capacity(inv.args.len());
        let mut index = 0;
        while index < inv.args.len() {
            let arg = &inv.args[index];
            let next = inv.args.get(index + 1).map(String::as_str);
            match keep(arg, next) {
                Keep::Arg => {
                    result.push(arg.clone());
                    index += 1;
                }
                Keep::DropOne => index += 1,
                Keep::DropPair => index += 2,
            }
        }
        inv.args = result;
    }
}

enum Keep {
    Arg,
    DropOne,
    DropPair,
}

impl CommandLineParser for GccCommandLineParser {
    fn process(
        &self,
        mut commandline: ToolCommandline,
        options: ParseOptions,
    ) -> WuildResult<ProcessedInvocation> {
        let scan = self.scan(&mut commandline)?;
        let mut remote_possible = scan.remote_possible;

        if let Some(target) = options.change_type {
            let Some(flag_index) = scan.invoke_flag_index else {
                return Err(WuildError::invocation(
                    "cannot change the invocation type: no -c/-E flag",
                ));
            };
            commandline.args[flag_index] = match target {
                InvokeType::Preprocess => "-E".to_string(),
                InvokeType::Compile => "-c".to_string(),
                InvokeType::Unknown => {
                    return Err(WuildError::invocation("cannot rewrite to Unknown"))
                }
            };
        }

        if options.remove_local_flags {
            Self::retain_rebuilding(&mut commandline, |arg, _| {
                // Debug info and its tuning do not travel.
                if arg.starts_with("-g") {
                    Keep::DropOne
                } else {
                    Keep::Arg
                }
            });
        }

        if options.remove_dependency_flags {
            Self::retain_rebuilding(&mut commandline, |arg, _| {
                if DEP_VALUE_FLAGS.contains(&arg) {
                    Keep::DropPair
                } else if DEP_FLAGS.contains(&arg) {
                    Keep::DropOne
                } else {
                    Keep::Arg
                }
            });
        }

        if options.remove_preprocessor_flags {
            Self::retain_rebuilding(&mut commandline, |arg, _| {
                if PREPROCESSOR_VALUE_FLAGS.contains(&arg) {
                    Keep::DropPair
                } else if arg.len() > 2
                    && (arg.starts_with("-I") || arg.starts_with("-D") || arg.starts_with("-U"))
                {
                    Keep::DropOne
                } else if arg.starts_with("-isystem") || arg.starts_with("-iquote") {
                    Keep::DropOne
                } else {
                    Keep::Arg
                }
            });
        }

        // Mutations shifted positions; re-index.
        let rescan = self.scan(&mut commandline)?;
        remote_possible &= rescan.remote_possible;

        Ok(ProcessedInvocation {
            commandline,
            remote_possible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuild_core::ToolId;

    fn commandline(args: &[&str]) -> ToolCommandline {
        ToolCommandline::new(
            ToolId::from_id("gcc9"),
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn parse(args: &[&str], options: ParseOptions) -> ProcessedInvocation {
        GccCommandLineParser.process(commandline(args), options).unwrap()
    }

    #[test]
    fn classifies_a_compile_line() {
        let processed = parse(
            &["-c", "src/main.cpp", "-o", "obj/main.o", "-O2", "-Iinclude"],
            ParseOptions::classify_only(),
        );
        let inv = &processed.commandline;
        assert_eq!(inv.invoke_type, InvokeType::Compile);
        assert_eq!(inv.input(), Some("src/main.cpp"));
        assert_eq!(inv.output(), Some("obj/main.o"));
        assert!(processed.remote_possible);
    }

    #[test]
    fn preprocess_stage_flips_c_to_e_and_keeps_deps() {
        let processed = parse(
            &[
                "-c", "a.cpp", "-o", "a.o", "-g", "-MD", "-MF", "a.d", "-Iinc", "-DFOO=1",
            ],
            ParseOptions::preprocess_stage(),
        );
        let inv = &processed.commandline;
        assert_eq!(inv.invoke_type, InvokeType::Preprocess);
        assert!(inv.args.contains(&"-E".to_string()));
        assert!(!inv.args.contains(&"-c".to_string()));
        // Dependency and include flags stay: the preprocessor needs them.
        assert!(inv.args.contains(&"-MD".to_string()));
        assert!(inv.args.contains(&"-Iinc".to_string()));
        // Debug info does not.
        assert!(!inv.args.contains(&"-g".to_string()));
    }

    #[test]
    fn compile_stage_strips_preprocessor_and_dependency_flags() {
        let processed = parse(
            &[
                "-c", "a.cpp", "-o", "a.o", "-g", "-O2", "-MD", "-MF", "a.d", "-I", "inc",
                "-DFOO=1", "-include", "pch.h",
            ],
            ParseOptions::compile_stage(),
        );
        let inv = &processed.commandline;
        assert_eq!(
            inv.args,
            vec!["-c", "a.cpp", "-o", "a.o", "-O2"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert_eq!(inv.input(), Some("a.cpp"));
        assert_eq!(inv.output(), Some("a.o"));
    }

    #[test]
    fn response_file_refuses_remote() {
        let processed = parse(&["-c", "a.cpp", "-o", "a.o", "@flags.rsp"], ParseOptions::classify_only());
        assert!(!processed.remote_possible);
    }

    #[test]
    fn two_inputs_is_an_error() {
        let result = GccCommandLineParser.process(
            commandline(&["-c", "a.cpp", "b.cpp", "-o", "a.o"]),
            ParseOptions::classify_only(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn link_line_stays_unknown() {
        let processed = parse(&["a.o", "-o", "app"], ParseOptions::classify_only());
        assert_eq!(processed.commandline.invoke_type, InvokeType::Unknown);
    }

    #[test]
    fn detached_x_flag_is_consumed() {
        let processed = parse(
            &["-x", "c++-cpp-output", "-c", "pp_a.ii", "-o", "a.o"],
            ParseOptions::classify_only(),
        );
        assert_eq!(processed.commandline.input(), Some("pp_a.ii"));
    }
}
