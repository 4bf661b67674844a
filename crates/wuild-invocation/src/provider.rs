//! Tool resolution and the split of one compile command into its
//! preprocess and compile stages.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use wuild_core::config::{ToolDefinition, ToolsConfig};
use wuild_core::{InvokeType, ToolCommandline, ToolId, ToolchainKind, WuildError, WuildResult};

use crate::gcc::GccCommandLineParser;
use crate::msvc::MsvcCommandLineParser;
use crate::parser::{CommandLineParser, ParseOptions};

/// Break a shell-ish command string into words. Not a full shell parser:
/// it skips quoted regions without unescaping, which is what build
/// drivers hand us.
pub fn split_shell_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut buffer = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in command.chars() {
        if escaped {
            buffer.push(c);
            escaped = false;
            continue;
        }
        if c == '\\' && !cfg!(windows) {
            buffer.push(c);
            escaped = true;
            continue;
        }
        if c == '"' || c == '\'' {
            in_quotes = !in_quotes;
            continue;
        }
        if (c == ' ' || c == '\t') && !in_quotes {
            if !buffer.is_empty() {
                words.push(std::mem::take(&mut buffer));
            }
            continue;
        }
        buffer.push(c);
    }
    if !buffer.is_empty() {
        words.push(buffer);
    }
    words
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Preprocessed-output path next to the object file:
/// `obj/main.o` + `src/main.cpp` -> `obj/pp_main.cpp`.
pub fn preprocessed_path(source_path: &str, object_path: &str) -> String {
    let object = Path::new(object_path);
    let dir = object.parent().unwrap_or_else(|| Path::new(""));
    let stem = object
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("out");
    let source_ext = Path::new(source_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("ii");
    dir.join(format!("pp_{stem}.{source_ext}"))
        .to_string_lossy()
        .into_owned()
}

/// GCC language name of a preprocessed translation unit.
fn preprocessed_language(source_path: &str) -> &'static str {
    match Path::new(source_path).extension().and_then(|e| e.to_str()) {
        Some("c") => "cpp-output",
        _ => "c++-cpp-output",
    }
}

/// One resolved tool: its configuration plus the dialect parser.
#[derive(Clone)]
pub struct ToolEntry {
    pub definition: ToolDefinition,
    parser: Arc<dyn CommandLineParser>,
}

impl ToolEntry {
    pub fn tool_id(&self) -> ToolId {
        ToolId {
            tool_id: self.definition.id.clone(),
            executable: self.definition.executables[0].clone(),
        }
    }
}

/// The preprocess/compile pair produced by a split, plus the id the
/// compile stage runs under remotely.
#[derive(Debug, Clone)]
pub struct SplitInvocation {
    pub preprocess: ToolCommandline,
    pub compile: ToolCommandline,
    pub remote_tool_id: String,
}

/// Resolves tools from configuration and rewrites their invocations.
pub struct InvocationToolProvider {
    tools: Vec<ToolEntry>,
}

impl InvocationToolProvider {
    pub fn from_config(config: &ToolsConfig) -> WuildResult<Self> {
        let mut tools = Vec::with_capacity(config.tools.len());
        for definition in &config.tools {
            let parser: Arc<dyn CommandLineParser> = match definition.kind {
                ToolchainKind::Msvc => Arc::new(MsvcCommandLineParser),
                ToolchainKind::Gcc | ToolchainKind::Clang => Arc::new(GccCommandLineParser),
                ToolchainKind::Auto => {
                    return Err(WuildError::config(format!(
                        "tool '{}': could not determine the toolchain kind, set {}_type",
                        definition.id, definition.id
                    )))
                }
            };
            tools.push(ToolEntry {
                definition: definition.clone(),
                parser,
            });
        }
        Ok(Self { tools })
    }

    pub fn tool_ids(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.definition.id.clone()).collect()
    }

    /// Ids advertised to the fleet (remote aliases applied).
    pub fn remote_tool_ids(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| t.definition.remote_id().to_string())
            .collect()
    }

    /// Resolve by tool id, then by remote alias, then by executable path
    /// or basename.
    pub fn resolve(&self, id: &ToolId) -> Option<&ToolEntry> {
        if !id.tool_id.is_empty() {
            if let Some(entry) = self.tools.iter().find(|t| t.definition.id == id.tool_id) {
                return Some(entry);
            }
            return self
                .tools
                .iter()
                .find(|t| t.definition.remote_alias == id.tool_id);
        }
        if id.executable.is_empty() {
            return None;
        }
        let wanted = file_name(&id.executable);
        self.tools.iter().find(|t| {
            t.definition
                .executables
                .iter()
                .any(|e| e == &id.executable || file_name(e) == wanted)
        })
    }

    /// Fill in the missing half of a tool id.
    pub fn complete_tool_id(&self, id: &ToolId) -> ToolId {
        match self.resolve(id) {
            Some(entry) => entry.tool_id(),
            None => id.clone(),
        }
    }

    /// Normalize a raw invocation: resolve the tool, split shell-joined
    /// arguments, classify, index. Unresolvable or unparseable commands
    /// come back unchanged with type `Unknown`.
    pub fn complete_invocation(&self, original: &ToolCommandline) -> ToolCommandline {
        let mut inv = original.clone();
        inv.args = original
            .args
            .iter()
            .flat_map(|arg| split_shell_command(arg))
            .collect();

        let Some(entry) = self.resolve(&inv.id) else {
            return inv;
        };
        inv.id = entry.tool_id();
        match entry.parser.process(inv.clone(), ParseOptions::classify_only()) {
            Ok(processed) => processed.commandline,
            Err(e) => {
                debug!("invocation not classifiable: {e}");
                inv.invoke_type = InvokeType::Unknown;
                inv
            }
        }
    }

    /// Conservative locality check for the whole command line.
    pub fn check_remote_possible(&self, original: &ToolCommandline) -> bool {
        let inv = self.complete_invocation(original);
        let Some(entry) = self.resolve(&inv.id) else {
            return false;
        };
        match entry.parser.process(inv, ParseOptions::classify_only()) {
            Ok(processed) => processed.remote_possible,
            Err(_) => false,
        }
    }

    /// Split one compile command into its two stages. `Ok(None)` means
    /// "not a compile, run the original locally".
    pub fn split_invocation(
        &self,
        original: &ToolCommandline,
    ) -> WuildResult<Option<SplitInvocation>> {
        let complete = self.complete_invocation(original);
        let Some(entry) = self.resolve(&complete.id) else {
            return Ok(None);
        };
        if complete.invoke_type != InvokeType::Compile {
            return Ok(None);
        }

        let preprocess_pass = entry
            .parser
            .process(complete.clone(), ParseOptions::preprocess_stage())?;
        let compile_pass = entry
            .parser
            .process(complete.clone(), ParseOptions::compile_stage())?;
        if !preprocess_pass.remote_possible || !compile_pass.remote_possible {
            return Ok(None);
        }
        let mut preprocess = preprocess_pass.commandline;
        let mut compile = compile_pass.commandline;

        let (Some(source), Some(object)) = (complete.input(), complete.output()) else {
            return Ok(None);
        };

        // Build-variable outputs (a ninja `$out`) cannot be redirected.
        if object.starts_with('$') {
            return Ok(None);
        }

        let pp_path = preprocessed_path(source, object);
        preprocess.set_output(&pp_path);
        compile.set_input(&pp_path);

        // The compile stage consumes preprocessed input; tell the
        // compiler so, since the pp_ file keeps the source extension.
        if matches!(
            entry.definition.kind,
            ToolchainKind::Gcc | ToolchainKind::Clang
        ) {
            insert_before_input(&mut compile, &["-x", preprocessed_language(source)]);
        }

        Ok(Some(SplitInvocation {
            preprocess,
            compile,
            remote_tool_id: entry.definition.remote_id().to_string(),
        }))
    }

    /// Reduce a flag list to what one stage actually needs: preprocess
    /// flags lose the local-only debug switches, compile flags
    /// additionally lose the preprocessor and dependency families.
    /// Unknown tools pass through untouched.
    pub fn filter_flags(&self, id: &ToolId, flags: Vec<String>, stage: InvokeType) -> Vec<String> {
        let Some(entry) = self.resolve(id) else {
            return flags;
        };
        let options = match stage {
            InvokeType::Preprocess => ParseOptions {
                remove_local_flags: true,
                ..ParseOptions::default()
            },
            InvokeType::Compile => ParseOptions {
                remove_local_flags: true,
                remove_preprocessor_flags: true,
                remove_dependency_flags: true,
                ..ParseOptions::default()
            },
            InvokeType::Unknown => return flags,
        };
        let inv = ToolCommandline::new(entry.tool_id(), flags.clone());
        match entry.parser.process(inv, options) {
            Ok(processed) => processed.commandline.args,
            Err(_) => flags,
        }
    }

    /// Rewrite the compile stage for shipping: apply the per-tool
    /// append/remove remote arguments, switch to the remote alias and
    /// reduce file arguments to bare names (the server substitutes its
    /// own temp paths).
    pub fn prepare_remote(&self, invocation: &ToolCommandline) -> WuildResult<ToolCommandline> {
        let mut inv = self.complete_invocation(invocation);
        let Some(entry) = self.resolve(&inv.id) else {
            return Err(WuildError::invocation(format!(
                "unknown tool '{}'",
                inv.id
            )));
        };

        if !entry.definition.append_remote.is_empty() {
            inv.args.extend(entry.definition.append_remote.iter().cloned());
        }
        if !entry.definition.remove_remote.is_empty() {
            let input = inv.input().map(str::to_string);
            let output = inv.output().map(str::to_string);
            inv.args.retain(|arg| arg != &entry.definition.remove_remote);
            // Removal shifted positions; find the files again.
            reindex_files(&mut inv, input.as_deref(), output.as_deref());
        }
        inv.id.tool_id = entry.definition.remote_id().to_string();

        if let Some(input) = inv.input().map(str::to_string) {
            inv.set_input(file_name(&input).to_string());
        }
        if let Some(output) = inv.output().map(str::to_string) {
            inv.set_output(file_name(&output).to_string());
        }
        Ok(inv)
    }
}

fn reindex_files(inv: &mut ToolCommandline, input: Option<&str>, output: Option<&str>) {
    inv.input_index = -1;
    inv.output_index = -1;
    for (index, arg) in inv.args.iter().enumerate() {
        if Some(arg.as_str()) == input && inv.input_index == -1 {
            inv.input_index = index as i32;
        } else if Some(arg.as_str()) == output && inv.output_index == -1 {
            inv.output_index = index as i32;
        }
    }
}

/// Insert arguments right before the input file, keeping the indexes
/// coherent.
fn insert_before_input(inv: &mut ToolCommandline, extra: &[&str]) {
    let Ok(input_index) = usize::try_from(inv.input_index) else {
        return;
    };
    for (offset, arg) in extra.iter().enumerate() {
        inv.args.insert(input_index + offset, arg.to_string());
    }
    let shift = extra.len() as i32;
    inv.input_index += shift;
    if inv.output_index >= input_index as i32 {
        inv.output_index += shift;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuild_core::config::WuildConfig;

    fn provider() -> InvocationToolProvider {
        let config = WuildConfig::from_toml(
            r#"
[tools]
toolIds = "gcc9,msvc2019"
gcc9 = "/usr/bin/g++-9"
gcc9_type = "gcc"
gcc9_remoteAlias = "gcc9_remote"
gcc9_appendRemote = "-fpreprocessed"
msvc2019 = "C:\\VC\\bin\\cl.exe"
msvc2019_type = "msvc"
"#,
            &[],
        )
        .unwrap();
        InvocationToolProvider::from_config(&config.tools).unwrap()
    }

    fn gcc_invocation(args: &[&str]) -> ToolCommandline {
        ToolCommandline::new(
            ToolId::from_id("gcc9"),
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn shell_command_splitting() {
        assert_eq!(
            split_shell_command("g++ -c \"my file.cpp\" -o out.o"),
            vec!["g++", "-c", "my file.cpp", "-o", "out.o"]
        );
        assert_eq!(split_shell_command("  -O2\t-Wall "), vec!["-O2", "-Wall"]);
    }

    #[test]
    fn resolves_by_id_alias_and_executable() {
        let p = provider();
        assert!(p.resolve(&ToolId::from_id("gcc9")).is_some());
        assert!(p.resolve(&ToolId::from_id("gcc9_remote")).is_some());
        assert!(p.resolve(&ToolId::from_executable("/usr/bin/g++-9")).is_some());
        assert!(p.resolve(&ToolId::from_executable("g++-9")).is_some());
        assert!(p.resolve(&ToolId::from_id("tcc")).is_none());

        let completed = p.complete_tool_id(&ToolId::from_id("gcc9"));
        assert_eq!(completed.executable, "/usr/bin/g++-9");
    }

    #[test]
    fn splits_a_gcc_compile() {
        let p = provider();
        let split = p
            .split_invocation(&gcc_invocation(&[
                "-c", "src/main.cpp", "-o", "obj/main.o", "-O2", "-Iinclude", "-MD", "-MF",
                "obj/main.d", "-g",
            ]))
            .unwrap()
            .expect("compile command must split");

        // Preprocess stage: -E, deps and includes intact, writes pp_.
        assert!(split.preprocess.args.contains(&"-E".to_string()));
        assert!(split.preprocess.args.contains(&"-Iinclude".to_string()));
        assert!(split.preprocess.args.contains(&"-MD".to_string()));
        assert_eq!(split.preprocess.output(), Some("obj/pp_main.cpp"));

        // Compile stage: still -c, reads pp_ as preprocessed c++.
        assert!(split.compile.args.contains(&"-c".to_string()));
        assert_eq!(split.compile.input(), Some("obj/pp_main.cpp"));
        assert_eq!(split.compile.output(), Some("obj/main.o"));
        let x_pos = split.compile.args.iter().position(|a| a == "-x").unwrap();
        assert_eq!(split.compile.args[x_pos + 1], "c++-cpp-output");
        assert!(x_pos < split.compile.input_index as usize);
        assert!(!split.compile.args.contains(&"-Iinclude".to_string()));
        assert!(!split.compile.args.contains(&"-g".to_string()));

        assert_eq!(split.remote_tool_id, "gcc9_remote");
    }

    #[test]
    fn link_command_does_not_split() {
        let p = provider();
        let split = p
            .split_invocation(&gcc_invocation(&["main.o", "util.o", "-o", "app"]))
            .unwrap();
        assert!(split.is_none());
    }

    #[test]
    fn response_file_does_not_split() {
        let p = provider();
        let split = p
            .split_invocation(&gcc_invocation(&["-c", "a.cpp", "-o", "a.o", "@r.rsp"]))
            .unwrap();
        assert!(split.is_none());
    }

    #[test]
    fn ninja_variable_output_does_not_split() {
        let p = provider();
        let split = p
            .split_invocation(&gcc_invocation(&["-c", "a.cpp", "-o", "$out"]))
            .unwrap();
        assert!(split.is_none());
    }

    #[test]
    fn prepare_remote_uses_alias_and_bare_names() {
        let p = provider();
        let remote = p
            .prepare_remote(&gcc_invocation(&["-c", "obj/pp_main.cpp", "-o", "obj/main.o"]))
            .unwrap();
        assert_eq!(remote.id.tool_id, "gcc9_remote");
        assert_eq!(remote.input(), Some("pp_main.cpp"));
        assert_eq!(remote.output(), Some("main.o"));
        assert!(remote.args.contains(&"-fpreprocessed".to_string()));
    }

    #[test]
    fn shell_joined_arguments_are_split_on_completion() {
        let p = provider();
        let inv = ToolCommandline::new(
            ToolId::from_id("gcc9"),
            vec!["-c src/a.cpp -o obj/a.o".to_string()],
        );
        let completed = p.complete_invocation(&inv);
        assert_eq!(completed.args.len(), 4);
        assert_eq!(completed.invoke_type, InvokeType::Compile);
    }

    #[test]
    fn flag_filtering_per_stage() {
        let p = provider();
        let id = ToolId::from_id("gcc9");
        let flags: Vec<String> = ["-O2", "-g", "-Iinc", "-DFOO", "-MD", "-Wall"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let preprocess = p.filter_flags(&id, flags.clone(), InvokeType::Preprocess);
        assert!(preprocess.contains(&"-Iinc".to_string()));
        assert!(preprocess.contains(&"-MD".to_string()));
        assert!(!preprocess.contains(&"-g".to_string()));

        let compile = p.filter_flags(&id, flags.clone(), InvokeType::Compile);
        assert_eq!(
            compile,
            vec!["-O2".to_string(), "-Wall".to_string()]
        );

        // Unknown tool: untouched.
        let passthrough = p.filter_flags(&ToolId::from_id("tcc"), flags.clone(), InvokeType::Compile);
        assert_eq!(passthrough, flags);
    }

    #[test]
    fn preprocessed_path_derivation() {
        assert_eq!(
            preprocessed_path("src/main.cpp", "obj/main.o"),
            "obj/pp_main.cpp"
        );
        assert_eq!(preprocessed_path("a.c", "a.o"), "pp_a.c");
    }
}
