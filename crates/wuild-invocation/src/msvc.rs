//! MSVC (`cl.exe`) command-line dialect.
//!
//! Attached file arguments (`/Fo:obj\a.obj`, `/Foobj\a.obj`) are
//! normalized into the detached form (`/Fo:` + path) so input/output
//! substitution can work through plain argument indexes.

use wuild_core::{InvokeType, ToolCommandline, WuildError, WuildResult};

use crate::parser::{CommandLineParser, ParseOptions, ProcessedInvocation};

#[derive(Default)]
pub struct MsvcCommandLineParser;

struct Scan {
    invoke_flag_index: Option<usize>,
    remote_possible: bool,
}

fn is_flag(arg: &str) -> bool {
    arg.starts_with('/') || arg.starts_with('-')
}

impl MsvcCommandLineParser {
    /// Normalize and index the argument list; rebuilds `args`.
    fn scan(&self, inv: &mut ToolCommandline) -> WuildResult<Scan> {
        let mut scan = Scan {
            invoke_flag_index: None,
            remote_possible: true,
        };
        inv.invoke_type = InvokeType::Unknown;
        inv.input_index = -1;
        inv.output_index = -1;

        let mut rebuilt: Vec<String> = Vec::with_capacity(inv.args.len());
        let mut value_expected = false;

        for arg in std::mem::take(&mut inv.args) {
            if value_expected {
                rebuilt.push(arg);
                value_expected = false;
                continue;
            }
            if is_flag(&arg) && arg.len() >= 2 {
                let body = &arg[1..];
                match body.chars().next() {
                    Some('c') if body.len() == 1 => {
                        inv.invoke_type = InvokeType::Compile;
                        scan.invoke_flag_index = Some(rebuilt.len());
                    }
                    Some('P') if body.len() == 1 => {
                        inv.invoke_type = InvokeType::Preprocess;
                        scan.invoke_flag_index = Some(rebuilt.len());
                    }
                    _ => {}
                }
                // /AI adds a metadata search dir: local by nature.
                if body.len() > 2 && body.starts_with("AI") {
                    scan.remote_possible = false;
                }
                // /D DEFINE and /I path with a detached value.
                if body.len() == 1 && (body == "D" || body == "I") {
                    rebuilt.push(arg);
                    value_expected = true;
                    continue;
                }
                if body == "external:I" {
                    rebuilt.push(arg);
                    value_expected = true;
                    continue;
                }
                // /Fd /Fi /Fo carry a filename, attached or detached.
                if body.len() >= 2 && body.starts_with('F') {
                    let file_kind = body.as_bytes()[1] as char;
                    if matches!(file_kind, 'd' | 'i' | 'o') {
                        let (prefix, attached) = match body.as_bytes().get(2) {
                            Some(b':') => (&arg[..4], &arg[4..]),
                            _ => (&arg[..3], &arg[3..]),
                        };
                        rebuilt.push(format!("{}:", prefix.trim_end_matches(':')));
                        let file_index = rebuilt.len();
                        if attached.is_empty() {
                            value_expected = true;
                        } else {
                            rebuilt.push(attached.to_string());
                        }
                        // /Fi: is the preprocessor's output.
                        if file_kind == 'o' || file_kind == 'i' {
                            inv.output_index = file_index as i32;
                        }
                        continue;
                    }
                }
                rebuilt.push(arg);
                continue;
            }

            // Positional argument: the input file.
            if inv.ignored_args.contains(&arg) {
                rebuilt.push(arg);
                continue;
            }
            if inv.input_index != -1 {
                return Err(WuildError::invocation(format!(
                    "more than one input file: '{}' and '{arg}'",
                    rebuilt[inv.input_index as usize]
                )));
            }
            inv.input_index = rebuilt.len() as i32;
            rebuilt.push(arg);
        }

        inv.args = rebuilt;
        Ok(scan)
    }
}

impl CommandLineParser for MsvcCommandLineParser {
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
                    "cannot change the invocation type: no /c or /P flag",
                ));
            };
            if commandline.output_index <= 0 {
                return Err(WuildError::invocation("no /Fo:/Fi: output to rewrite"));
            }
            let preprocess = target == InvokeType::Preprocess;
            commandline.args[flag_index] = if preprocess { "/P" } else { "/c" }.to_string();
            let output_flag_index = commandline.output_index as usize - 1;
            commandline.args[output_flag_index] =
                if preprocess { "/Fi:" } else { "/Fo:" }.to_string();
            commandline.invoke_type = target;
        }

        if options.remove_local_flags {
            let mut rebuilt = Vec::with_capacity(commandline.args.len());
            let mut skip_next = false;
            for arg in std::mem::take(&mut commandline.args) {
                if skip_next {
                    skip_next = false;
                    continue;
                }
                match arg.as_str() {
                    // PDB paths do not travel.
                    "/Fd:" | "-Fd:" => skip_next = true,
                    // Edit-and-continue debug info becomes plain /Z7.
                    "/ZI" | "/Zi" | "-ZI" | "-Zi" => rebuilt.push("/Z7".to_string()),
                    "/Gm" | "-Gm" | "/FS" | "-FS" => {}
                    _ => rebuilt.push(arg),
                }
            }
            commandline.args = rebuilt;
        }

        if options.remove_preprocessor_flags {
            let mut rebuilt = Vec::with_capacity(commandline.args.len());
            let mut skip_next = false;
            for arg in std::mem::take(&mut commandline.args) {
                if skip_next {
                    skip_next = false;
                    continue;
                }
                if is_flag(&arg) && arg.len() >= 2 {
                    let body = &arg[1..];
                    if body == "I" || body == "D" || body == "external:I" {
                        skip_next = true;
                        continue;
                    }
                    if (body.starts_with('I') || body.starts_with('D')) && body.len() > 1 {
                        continue;
                    }
                    if body == "showIncludes" || body.starts_with("external:I") {
                        continue;
                    }
                }
                rebuilt.push(arg);
            }
            commandline.args = rebuilt;
        }

        // MSVC has no dependency-file flags to strip; /showIncludes went
        // with the preprocessor pass.

        let rescan = self.scan(&mut commandline)?;
        remote_possible &= rescan.remote_possible;

        Ok(ProcessedInvocation {
            commandline,
            remote_possible,
        })
    }
}
