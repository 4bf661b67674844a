//! # Wuild Invocation
//!
//! Understands compiler command lines well enough to split one compile
//! command into a *preprocess stage* (run locally) and a *compile stage*
//! (shipped to a tool server), and to strip the flags that must not
//! travel. GCC/Clang and MSVC dialects are supported; everything the
//! parsers are not sure about makes the invocation local-only rather
//! than guessing.

mod gcc;
mod msvc;
mod parser;
mod provider;

pub use gcc::GccCommandLineParser;
pub use msvc::MsvcCommandLineParser;
pub use parser::{CommandLineParser, ParseOptions, ProcessedInvocation};
pub use provider::{
    preprocessed_path, split_shell_command, InvocationToolProvider, SplitInvocation, ToolEntry,
};
