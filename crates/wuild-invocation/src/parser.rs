//! The command-line parser seam shared by the toolchain dialects.

use wuild_core::{InvokeType, ToolCommandline, WuildResult};

/// What a processing pass should do on top of classifying the command
/// line and locating input/output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Rewrite the invocation into this type (`-c` → `-E`, `/c` → `/P`).
    pub change_type: Option<InvokeType>,
    /// Strip debug/PDB flags that do not travel to a remote peer.
    pub remove_local_flags: bool,
    /// Strip `-I`/`-D`/include-path flags; the compile stage consumes
    /// already-preprocessed input.
    pub remove_preprocessor_flags: bool,
    /// Strip dependency-emission flags (`-M*` family).
    pub remove_dependency_flags: bool,
}

impl ParseOptions {
    pub fn classify_only() -> Self {
        Self::default()
    }

    /// Options producing the local preprocess stage.
    pub fn preprocess_stage() -> Self {
        Self {
            change_type: Some(InvokeType::Preprocess),
            remove_local_flags: true,
            ..Self::default()
        }
    }

    /// Options producing the remote compile stage.
    pub fn compile_stage() -> Self {
        Self {
            change_type: None,
            remove_local_flags: true,
            remove_preprocessor_flags: true,
            remove_dependency_flags: true,
        }
    }
}

/// A processed command line plus the conservative locality verdict.
#[derive(Debug, Clone)]
pub struct ProcessedInvocation {
    pub commandline: ToolCommandline,
    /// `false` when any flag suggests the command must run locally.
    pub remote_possible: bool,
}

/// One toolchain dialect.
pub trait CommandLineParser: Send + Sync {
    /// Normalize the argument list, classify the invocation, locate the
    /// input/output positions and apply `options`. Returns an error when
    /// the command line cannot be understood as a single-input compile.
    fn process(
        &self,
        commandline: ToolCommandline,
        options: ParseOptions,
    ) -> WuildResult<ProcessedInvocation>;
}
