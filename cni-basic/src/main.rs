use std::io::{IsTerminal, Read};

use cni_basic::{
    config,
    env::{InvocationContext, command_name},
    error::AppError,
    netops::NetlinkOps,
    orchestrator::{self, Failure, Orchestrator, Reply},
};
use cni_plugin::{Command, reply::reply};
use log::{debug, error, info};

/// Entry point of the CNI bridge plugin.
fn main() {
    cni_plugin::logger::install("cni-basic.log");
    debug!(
        "{} (CNI bridge plugin) version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let ctx = match InvocationContext::from_env() {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("invalid invocation: {err}");
            reply(err.into_reply(config::current_version()))
        }
    };

    // VERSION may be invoked without a configuration on stdin; when one is
    // piped in, its cniVersion is echoed back.
    let mut stdin = Vec::new();
    let input = std::io::stdin();
    if let Command::Version = ctx.command {
        if !input.is_terminal()
            && let Err(e) = input.lock().read_to_end(&mut stdin)
        {
            debug!("ignoring unreadable stdin for VERSION: {e}");
            stdin.clear();
        }
    } else if let Err(e) = input.lock().read_to_end(&mut stdin) {
        let err = AppError::InvalidConfig(format!("failed to read stdin: {e}"));
        reply(err.into_reply(config::current_version()))
    }

    info!(
        "{} serving command={}",
        env!("CARGO_PKG_NAME"),
        command_name(&ctx.command)
    );

    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Failure {
            cni_version: config::peek_version(&stdin),
            error: AppError::Topology(format!("failed to start runtime: {e}")),
        })
        .and_then(|rt| {
            rt.block_on(async {
                let ops = NetlinkOps::new().map_err(|e| Failure {
                    cni_version: config::peek_version(&stdin),
                    error: AppError::Topology(format!("failed to open host namespace: {e:#}")),
                })?;
                Orchestrator::new(ops).dispatch(&ctx, &stdin).await
            })
        });

    match outcome {
        Ok(Reply::Success(res)) => {
            debug!("success! {res:#?}");
            reply(res)
        }
        Ok(Reply::Version(res)) => reply(res),
        Err(failure) => {
            orchestrator::log_failure(&failure);
            reply(failure.error.into_reply(failure.cni_version))
        }
    }
}
