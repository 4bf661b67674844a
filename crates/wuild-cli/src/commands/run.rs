//! `wuild run` - the proxy-client compiler shim.
//!
//! Substitutes the compiler in the build system:
//! `wuild run -- g++ -c a.cpp -o a.o`. The invocation travels to the
//! proxy daemon; its output is relayed to stderr and its result becomes
//! the exit code.

use std::io::Write;

use anyhow::Result;
use clap::Args;

use wuild::{proxy_client_run, WuildConfig};

#[derive(Args)]
pub struct RunArgs {
    /// Tool id to run under (defaults to [proxy] toolId)
    #[arg(long)]
    tool: Option<String>,

    /// The compiler invocation, verbatim
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    invocation: Vec<String>,
}

pub async fn execute(args: RunArgs, config: WuildConfig) -> Result<()> {
    let (executable, compiler_args) = args
        .invocation
        .split_first()
        .map(|(first, rest)| (first.clone(), rest.to_vec()))
        .unwrap_or_default();

    let tool_id = args.tool.unwrap_or_else(|| config.proxy.tool_id.clone());

    let outcome = proxy_client_run(
        config.proxy.listen_port,
        &tool_id,
        &executable,
        compiler_args,
        config.proxy.proxy_client_timeout(),
        &config.proxy.start_command,
    )
    .await;

    // Compiler diagnostics belong on stderr, verbatim.
    if !outcome.std_out.is_empty() {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(outcome.std_out.as_bytes());
        if !outcome.std_out.ends_with('\n') {
            let _ = stderr.write_all(b"\n");
        }
    }
    std::process::exit(outcome.exit_code);
}
