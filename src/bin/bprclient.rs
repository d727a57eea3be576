// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.


//! Submit-side client: hands a proxy to the server watching a job.
use std::env;
use std::path::PathBuf;
use std::process::exit;

use bpr_delegation::client::run_client;
use bpr_delegation::client::ClientArgs;
use bpr_delegation::client::EXIT_OK;
use bpr_delegation::client::EXIT_USAGE;
use bpr_delegation::config::BPRConfig;
use bpr_delegation::gss::gsi::GSIProvider;
use bpr_delegation::proxy::PROXY_ENV;
use clap::Parser;
use log::error;

/// Transfer or delegate an X.509 proxy to a running batch job.
#[derive(Debug, Parser)]
#[command(name = "bprclient", version, about, long_about = None)]
struct Args {
    /// YAML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Proxy file to send, or to delegate from.
    proxy: PathBuf,

    /// Identifier of the job to renew.
    job_id: String,

    /// Worker node running the job.
    worker: String,

    /// Anything starting with `deleg` delegates instead of sending.
    mode: Option<String>
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_USAGE } else { EXIT_OK };

            let _ = err.print();

            exit(code)
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .init();

    let config = match BPRConfig::for_tool(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(target: "bpr-client",
                   "{}",
                   err);

            exit(EXIT_USAGE)
        }
    };

    // The GSSAPI library finds the client's credential through this.
    env::set_var(PROXY_ENV, &args.proxy);

    let client_args = ClientArgs::new(
        args.proxy,
        args.job_id,
        args.worker,
        args.mode.as_deref()
    );
    let (rendezvous, session, _, delegation) = config.take();
    let provider = GSIProvider::new(delegation, &session);

    match run_client(&provider, &client_args, &rendezvous) {
        Ok(()) => exit(EXIT_OK),
        Err(err) => {
            error!(target: "bpr-client",
                   "{}",
                   err);

            exit(err.exit_code())
        }
    }
}
